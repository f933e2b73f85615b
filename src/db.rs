//! SQLite connection management for storage endpoints.
//!
//! Every endpoint is a SQLite database addressed by a `sqlite:` URI and
//! opened as its own pool with WAL journaling. The primary's parent
//! directory is created on demand; additional endpoints are opened as-is so
//! a missing volume shows up as an unreachable endpoint instead of a fresh
//! empty database somewhere unexpected.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use filedex_core::{Error, Result};

/// Pool settings shared by all endpoints.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// Bound on connecting and on acquiring a connection.
    pub timeout: Duration,
    /// Create missing parent directories of the database file.
    pub create_parent: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            timeout: Duration::from_secs(30),
            create_parent: false,
        }
    }
}

/// Open a pool for `uri` and verify it with a round-trip query.
pub async fn connect(uri: &str, settings: PoolSettings) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(uri)
        .map_err(|e| Error::config(format!("invalid database uri '{}': {}", uri, e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    if settings.create_parent {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(Error::storage)?;
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.timeout)
        .connect_with(options);

    let pool = tokio::time::timeout(settings.timeout, pool)
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {}", uri)))?
        .map_err(Error::storage)?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(Error::storage)?;

    Ok(pool)
}
