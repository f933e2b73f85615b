//! Idempotent schema creation.
//!
//! The primary carries the metadata tables plus a `files` table; every
//! additional endpoint carries only `files`.

use sqlx::SqlitePool;

use filedex_core::{Error, Result};

/// Create the `files` table present on every endpoint.
pub async fn migrate_files(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            content_hash TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            mime_type TEXT,
            caption TEXT,
            source TEXT NOT NULL,
            position INTEGER NOT NULL,
            operation_id TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(Error::storage)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_source ON files(source, position)")
        .execute(pool)
        .await
        .map_err(Error::storage)?;

    Ok(())
}

/// Create every table the primary endpoint hosts.
pub async fn migrate_primary(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            cursor INTEGER NOT NULL DEFAULT 0,
            files_indexed INTEGER NOT NULL DEFAULT 0,
            files_skipped INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(Error::storage)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status)")
        .execute(pool)
        .await
        .map_err(Error::storage)?;

    // Single-row documents: the CHECK pins the key.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shard_selection (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            active_index INTEGER NOT NULL,
            endpoint_name TEXT NOT NULL,
            endpoints_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(Error::storage)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_config (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(Error::storage)?;

    migrate_files(pool).await
}
