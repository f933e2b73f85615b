//! SQLite-backed implementations of the storage traits.
//!
//! Maps each trait method onto statements against the schema created by
//! [`crate::migrate`]. Row updates are compare-and-set: the `WHERE` clause
//! re-checks the precondition, and a zero row count is diagnosed with a
//! follow-up read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use filedex_core::store::{ConfigStore, FileCollection, OperationStore, ShardDirectory};
use filedex_core::{
    Counters, Error, FileRecord, InsertOutcome, Operation, OperationId, OperationStatus, Result,
    RuntimeConfig, ShardSelection,
};

fn ts_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// SQLite integers are signed; values past `i64::MAX` are refused, not wrapped.
fn to_sql(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::Storage(format!("{} value {} exceeds SQLite integer range", column, value)))
}

fn from_sql(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::Storage(format!("negative {} value {} in storage", column, value)))
}

fn row_to_operation(row: &SqliteRow) -> Result<Operation> {
    let id: String = row.try_get("id").map_err(Error::storage)?;
    let status: String = row.try_get("status").map_err(Error::storage)?;
    let get_u64 = |col: &str| -> Result<u64> {
        let v: i64 = row.try_get(col).map_err(Error::storage)?;
        from_sql(v, col)
    };

    Ok(Operation {
        id: Uuid::parse_str(&id).map_err(Error::storage)?,
        source: row.try_get("source").map_err(Error::storage)?,
        status: status.parse()?,
        cursor: get_u64("cursor")?,
        counters: Counters {
            indexed: get_u64("files_indexed")?,
            skipped: get_u64("files_skipped")?,
            errors: get_u64("errors")?,
        },
        created_at: from_millis(row.try_get("created_at").map_err(Error::storage)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(Error::storage)?),
    })
}

const OPERATION_COLUMNS: &str =
    "id, source, status, cursor, files_indexed, files_skipped, errors, created_at, updated_at";

/// [`OperationStore`] over the primary's `operations` table.
pub struct SqliteOperationStore {
    pool: SqlitePool,
}

impl SqliteOperationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn create(&self, op: &Operation) -> Result<OperationId> {
        let result = sqlx::query(
            r#"
            INSERT INTO operations (id, source, status, cursor, files_indexed, files_skipped,
                                    errors, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(op.id.to_string())
        .bind(&op.source)
        .bind(to_sql(op.cursor, "cursor")?)
        .bind(to_sql(op.counters.indexed, "files_indexed")?)
        .bind(to_sql(op.counters.skipped, "files_skipped")?)
        .bind(to_sql(op.counters.errors, "errors")?)
        .bind(ts_millis(op.created_at))
        .bind(ts_millis(op.updated_at))
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;

        if result.rows_affected() == 0 {
            return Err(Error::DuplicateId(op.id));
        }
        Ok(op.id)
    }

    async fn update_progress(&self, id: OperationId, cursor: u64, counters: Counters) -> Result<()> {
        let sql_cursor = to_sql(cursor, "cursor")?;
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET cursor = ?, files_indexed = ?, files_skipped = ?, errors = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running') AND cursor <= ?
            "#,
        )
        .bind(sql_cursor)
        .bind(to_sql(counters.indexed, "files_indexed")?)
        .bind(to_sql(counters.skipped, "files_skipped")?)
        .bind(to_sql(counters.errors, "errors")?)
        .bind(ts_millis(Utc::now()))
        .bind(id.to_string())
        .bind(sql_cursor)
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current = self.get(id).await?;
        if current.status.is_terminal() {
            Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: "progress".to_string(),
            })
        } else if cursor < current.cursor {
            Err(Error::CursorRegression {
                current: current.cursor,
                attempted: cursor,
            })
        } else {
            Err(Error::storage(format!("progress update for {} was not applied", id)))
        }
    }

    async fn set_status(&self, id: OperationId, status: OperationStatus) -> Result<()> {
        let current = self.get(id).await?;
        current.status.check_transition(status)?;
        if current.status == status {
            return Ok(());
        }

        let result = sqlx::query(
            "UPDATE operations SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(ts_millis(Utc::now()))
        .bind(id.to_string())
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Lost a race: another writer moved the row first.
        let now = self.get(id).await?;
        now.status.check_transition(status)?;
        if now.status == status {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: now.status.to_string(),
                to: status.to_string(),
            })
        }
    }

    async fn list_active(&self) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM operations WHERE status IN ('pending', 'running')",
            OPERATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)?;

        rows.iter().map(row_to_operation).collect()
    }

    async fn list(&self, limit: usize) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM operations ORDER BY created_at DESC, rowid DESC LIMIT ?",
            OPERATION_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::storage)?;

        rows.iter().map(row_to_operation).collect()
    }

    async fn get(&self, id: OperationId) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM operations WHERE id = ?",
            OPERATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)?;

        match row {
            Some(row) => row_to_operation(&row),
            None => Err(Error::NotFound(id.to_string())),
        }
    }
}

/// [`ShardDirectory`] over the primary's `shard_selection` row.
pub struct SqliteShardDirectory {
    pool: SqlitePool,
}

impl SqliteShardDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShardDirectory for SqliteShardDirectory {
    async fn load(&self) -> Result<Option<ShardSelection>> {
        let row = sqlx::query(
            "SELECT active_index, endpoint_name, endpoints_json, updated_at FROM shard_selection WHERE id = 0",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::storage)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let index: i64 = row.try_get("active_index").map_err(Error::storage)?;
        let endpoints_json: String = row.try_get("endpoints_json").map_err(Error::storage)?;
        Ok(Some(ShardSelection {
            active_index: usize::try_from(index).map_err(Error::storage)?,
            endpoint_name: row.try_get("endpoint_name").map_err(Error::storage)?,
            endpoints: serde_json::from_str(&endpoints_json).map_err(Error::storage)?,
            updated_at: from_millis(row.try_get("updated_at").map_err(Error::storage)?),
        }))
    }

    async fn save(&self, selection: &ShardSelection) -> Result<()> {
        let endpoints_json = serde_json::to_string(&selection.endpoints).map_err(Error::storage)?;
        sqlx::query(
            r#"
            INSERT INTO shard_selection (id, active_index, endpoint_name, endpoints_json, updated_at)
            VALUES (0, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                active_index = excluded.active_index,
                endpoint_name = excluded.endpoint_name,
                endpoints_json = excluded.endpoints_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(i64::try_from(selection.active_index).map_err(Error::storage)?)
        .bind(&selection.endpoint_name)
        .bind(endpoints_json)
        .bind(ts_millis(selection.updated_at))
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }
}

/// [`ConfigStore`] over the primary's `app_config` row (JSON body).
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn load(&self) -> Result<Option<RuntimeConfig>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM app_config WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::storage)?;

        body.map(|b| serde_json::from_str(&b).map_err(Error::storage))
            .transpose()
    }

    async fn save(&self, config: &RuntimeConfig) -> Result<()> {
        let body = serde_json::to_string(config).map_err(Error::storage)?;
        sqlx::query(
            r#"
            INSERT INTO app_config (id, body, updated_at) VALUES (0, ?, ?)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(body)
        .bind(ts_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;
        Ok(())
    }
}

/// [`FileCollection`] over one endpoint's `files` table.
pub struct SqliteFileCollection {
    pool: SqlitePool,
}

impl SqliteFileCollection {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileCollection for SqliteFileCollection {
    async fn insert_file(&self, record: &FileRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO files (content_hash, file_id, file_name, file_size, mime_type, caption,
                               source, position, operation_id, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(&record.content_hash)
        .bind(&record.file_id)
        .bind(&record.file_name)
        .bind(to_sql(record.file_size, "file_size")?)
        .bind(&record.mime_type)
        .bind(&record.caption)
        .bind(&record.source)
        .bind(to_sql(record.position, "position")?)
        .bind(record.operation_id.to_string())
        .bind(ts_millis(record.indexed_at))
        .execute(&self.pool)
        .await
        .map_err(Error::storage)?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn contains(&self, content_hash: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM files WHERE content_hash = ? LIMIT 1")
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::storage)?;
        Ok(found.is_some())
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::storage)?;
        from_sql(n, "count")
    }
}
