//! Administrative commands: schema init, operation listing and
//! cancellation, shard inspection and selection.
//!
//! Each `run_*` function opens storage, prints a report, and closes it
//! again. Used by the `fdx` CLI.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use filedex_core::{Operation, OperationId};

use crate::config::Config;
use crate::manager::cancel_stored;
use crate::orchestrator::Storage;
use crate::progress::percent;
use crate::router::EndpointInfo;

/// Create schemas on the primary and every reachable endpoint.
pub async fn run_init(config: &Config) -> Result<()> {
    let storage = Storage::open(config).await?;
    let endpoints = storage.router.endpoints().await;
    storage.close().await;

    println!("Storage initialized.");
    println!("  primary:   {}", config.db.primary);
    let connected = endpoints.len().saturating_sub(1);
    println!(
        "  endpoints: {} of {} connected",
        connected,
        config.db.endpoints.len()
    );
    for ep in &config.db.endpoints {
        if !endpoints.iter().any(|e| e.name == ep.name) {
            println!("  unreachable: {} ({})", ep.name, ep.uri);
        }
    }
    Ok(())
}

pub async fn run_ops_list(config: &Config, active_only: bool, limit: usize) -> Result<()> {
    let storage = Storage::open(config).await?;
    let mut ops = if active_only {
        storage.operations.list_active().await?
    } else {
        storage.operations.list(limit).await?
    };
    storage.close().await;

    if active_only {
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        ops.truncate(limit);
    }

    if ops.is_empty() {
        println!("No operations.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10} {:<20} {:>10} {:>8} {:>8} {:>7}  {}",
        "ID", "STATUS", "SOURCE", "CURSOR", "INDEXED", "SKIPPED", "ERRORS", "UPDATED"
    );
    println!("{}", "-".repeat(120));
    for op in &ops {
        println!("{}", format_row(op));
    }
    Ok(())
}

pub async fn run_ops_show(config: &Config, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let storage = Storage::open(config).await?;
    let op = storage.operations.get(id).await;
    storage.close().await;
    let op = op?;

    println!("Operation {}", op.id);
    println!("  source:    {}", op.source);
    println!("  status:    {}", op.status);
    println!("  cursor:    {}", op.cursor);
    println!("  processed: {}", op.counters.processed());
    println!("  indexed:   {}", op.counters.indexed);
    println!("  skipped:   {}", op.counters.skipped);
    println!("  errors:    {}", op.counters.errors);
    println!("  created:   {}", format_ts(op.created_at));
    println!("  updated:   {}", format_ts(op.updated_at));
    Ok(())
}

pub async fn run_ops_cancel(config: &Config, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let storage = Storage::open(config).await?;
    let result = cancel_stored(storage.operations.as_ref(), id).await;
    storage.close().await;
    result.with_context(|| format!("Failed to cancel operation {}", id))?;

    println!("Operation {} cancelled.", id);
    Ok(())
}

pub async fn run_shard_show(config: &Config) -> Result<()> {
    let storage = Storage::open(config).await?;
    let endpoints = storage.router.endpoints().await;
    storage.close().await;

    println!("{}", format_endpoints(&endpoints));
    Ok(())
}

pub async fn run_shard_select(config: &Config, index: usize) -> Result<()> {
    let storage = Storage::open(config).await?;
    let result = storage.router.select_endpoint(index).await;
    let current = storage.router.current_collection();
    storage.close().await;
    result?;

    println!(
        "New files will be written to endpoint {} ({}).",
        current.index, current.name
    );
    Ok(())
}

fn parse_id(id: &str) -> Result<OperationId> {
    Uuid::parse_str(id.trim()).with_context(|| format!("invalid operation id: {}", id))
}

fn format_row(op: &Operation) -> String {
    format!(
        "{:<36}  {:<10} {:<20} {:>10} {:>8} {:>8} {:>7}  {}",
        op.id,
        op.status,
        truncate(&op.source, 20),
        op.cursor,
        op.counters.indexed,
        op.counters.skipped,
        op.counters.errors,
        format_ts(op.updated_at)
    )
}

fn format_endpoints(endpoints: &[EndpointInfo]) -> String {
    let total: u64 = endpoints.iter().filter_map(|e| e.files).sum();
    let mut out = format!("{:<3} {:<5} {:<24} {:>10} {:>6}\n", "", "INDEX", "NAME", "FILES", "SHARE");
    for ep in endpoints {
        let marker = if ep.selected { "*" } else { "" };
        let (files, share) = match ep.files {
            Some(n) => (n.to_string(), format!("{}%", percent(n, total))),
            None => ("?".to_string(), "-".to_string()),
        };
        out.push_str(&format!(
            "{:<3} {:<5} {:<24} {:>10} {:>6}\n",
            marker,
            ep.index,
            truncate(&ep.name, 24),
            files,
            share
        ));
    }
    out.push_str(&format!("{} endpoint(s), {} file(s)", endpoints.len(), total));
    out
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(width.saturating_sub(1)).collect();
        t.push('…');
        t
    }
}

fn format_ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}
