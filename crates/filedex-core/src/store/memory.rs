//! In-memory store implementations for tests and embedders.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Semantics match the SQLite
//! backends: the same state machine, the same cursor rule, the same
//! duplicate detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::models::{
    Counters, FileRecord, InsertOutcome, Operation, OperationId, OperationStatus, RuntimeConfig,
    ShardSelection,
};

use super::{ConfigStore, FileCollection, OperationStore, ShardDirectory};

/// In-memory [`OperationStore`].
#[derive(Default)]
pub struct MemoryOperationStore {
    ops: RwLock<HashMap<OperationId, Operation>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn create(&self, op: &Operation) -> Result<OperationId> {
        let mut ops = self.ops.write().unwrap_or_else(PoisonError::into_inner);
        if ops.contains_key(&op.id) {
            return Err(Error::DuplicateId(op.id));
        }
        let mut stored = op.clone();
        stored.status = OperationStatus::Pending;
        ops.insert(op.id, stored);
        Ok(op.id)
    }

    async fn update_progress(&self, id: OperationId, cursor: u64, counters: Counters) -> Result<()> {
        let mut ops = self.ops.write().unwrap_or_else(PoisonError::into_inner);
        let op = ops
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if op.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: op.status.to_string(),
                to: "progress".to_string(),
            });
        }
        if cursor < op.cursor {
            return Err(Error::CursorRegression {
                current: op.cursor,
                attempted: cursor,
            });
        }
        op.cursor = cursor;
        op.counters = counters;
        op.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(&self, id: OperationId, status: OperationStatus) -> Result<()> {
        let mut ops = self.ops.write().unwrap_or_else(PoisonError::into_inner);
        let op = ops
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        op.status.check_transition(status)?;
        if op.status != status {
            op.status = status;
            op.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Operation>> {
        let ops = self.ops.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ops
            .values()
            .filter(|op| !op.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Operation>> {
        let ops = self.ops.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Operation> = ops.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn get(&self, id: OperationId) -> Result<Operation> {
        let ops = self.ops.read().unwrap_or_else(PoisonError::into_inner);
        ops.get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

/// In-memory [`ShardDirectory`].
#[derive(Default)]
pub struct MemoryShardDirectory {
    selection: RwLock<Option<ShardSelection>>,
}

impl MemoryShardDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShardDirectory for MemoryShardDirectory {
    async fn load(&self) -> Result<Option<ShardSelection>> {
        Ok(self
            .selection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, selection: &ShardSelection) -> Result<()> {
        *self.selection.write().unwrap_or_else(PoisonError::into_inner) = Some(selection.clone());
        Ok(())
    }
}

/// In-memory [`ConfigStore`].
#[derive(Default)]
pub struct MemoryConfigStore {
    config: RwLock<Option<RuntimeConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Option<RuntimeConfig>> {
        Ok(self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, config: &RuntimeConfig) -> Result<()> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }
}

/// In-memory [`FileCollection`].
///
/// [`set_unavailable`](MemoryFileCollection::set_unavailable) makes every
/// call fail, standing in for an unreachable endpoint.
#[derive(Default)]
pub struct MemoryFileCollection {
    files: RwLock<HashMap<String, FileRecord>>,
    unavailable: AtomicBool,
}

impl MemoryFileCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored records ordered by source position.
    pub fn records(&self) -> Vec<FileRecord> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<FileRecord> = files.values().cloned().collect();
        out.sort_by_key(|r| r.position);
        out
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::storage("collection unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FileCollection for MemoryFileCollection {
    async fn insert_file(&self, record: &FileRecord) -> Result<InsertOutcome> {
        self.check_available()?;
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        if files.contains_key(&record.content_hash) {
            return Ok(InsertOutcome::Duplicate);
        }
        files.insert(record.content_hash.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn contains(&self, content_hash: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(content_hash))
    }

    async fn count(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.files.read().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }
}
