//! Progress notifications for index operations.
//!
//! The manager emits a [`ProgressEvent`] at batch boundaries and on every
//! terminal transition. A [`Notifier`] delivers the rendered text to the
//! chat platform; delivery failures are logged by the caller and never
//! affect the operation.

use async_trait::async_trait;
use tracing::info;

use filedex_core::{Counters, Operation, OperationStatus};

/// A single progress event for one operation.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Run started (or resumed) at `cursor` of `latest`.
    Started { cursor: u64, latest: u64 },
    /// A batch was persisted.
    Batch {
        cursor: u64,
        latest: u64,
        counters: Counters,
    },
    /// The operation reached a terminal status.
    Finished {
        status: OperationStatus,
        cursor: u64,
        latest: u64,
        counters: Counters,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, op: &Operation, text: &str) -> anyhow::Result<()>;
}

/// Writes progress to the log instead of a chat.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, op: &Operation, text: &str) -> anyhow::Result<()> {
        info!(operation = %op.id, source = %op.source, "{}", text);
        Ok(())
    }
}

/// Discards every message.
pub struct NoNotifier;

#[async_trait]
impl Notifier for NoNotifier {
    async fn notify(&self, _op: &Operation, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Human-readable message for `event`.
pub fn render(source: &str, event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Started { cursor, latest } => format!(
            "Indexing {}: starting at {} / {} ({}%)",
            source,
            format_number(*cursor),
            format_number(*latest),
            percent(*cursor, *latest)
        ),
        ProgressEvent::Batch {
            cursor,
            latest,
            counters,
        } => format!(
            "Indexing {}: {}% ({} / {})\n{}",
            source,
            percent(*cursor, *latest),
            format_number(*cursor),
            format_number(*latest),
            counts(counters)
        ),
        ProgressEvent::Finished {
            status,
            cursor,
            latest,
            counters,
        } => format!(
            "Indexing {} {} at {} / {} ({}%)\n{}",
            source,
            status,
            format_number(*cursor),
            format_number(*latest),
            percent(*cursor, *latest),
            counts(counters)
        ),
    }
}

fn counts(c: &Counters) -> String {
    format!(
        "indexed: {}  duplicates: {}  errors: {}",
        format_number(c.indexed),
        format_number(c.skipped),
        format_number(c.errors)
    )
}

/// Integer percentage of `cursor` over `latest`, capped at 100.
pub fn percent(cursor: u64, latest: u64) -> u64 {
    if latest == 0 {
        return 100;
    }
    (cursor.min(latest) as u128 * 100 / latest as u128) as u64
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
