//! Storage abstraction for filedex.
//!
//! Four traits split the persisted state by owner:
//!
//! | Trait | Lives on | Holds |
//! |-------|----------|-------|
//! | [`OperationStore`] | primary | one row per index operation |
//! | [`ShardDirectory`] | primary | the active endpoint selection |
//! | [`ConfigStore`] | primary | the runtime config document |
//! | [`FileCollection`] | every endpoint | indexed file records |
//!
//! Implementations must be `Send + Sync` to be shared across tasks.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Counters, FileRecord, InsertOutcome, Operation, OperationId, OperationStatus, RuntimeConfig,
    ShardSelection,
};

/// Durable record of index operations.
///
/// # Contract
///
/// - [`create`](OperationStore::create) always stores the operation as
///   `pending`, whatever status the caller passed.
/// - [`update_progress`](OperationStore::update_progress) never lowers the
///   cursor: a smaller value fails with `CursorRegression`.
/// - Terminal operations are never mutated again; attempts fail with
///   `InvalidTransition`.
/// - Nothing is ever deleted.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a new operation. Fails with `DuplicateId` on id collision.
    async fn create(&self, op: &Operation) -> Result<OperationId>;

    /// Atomically set cursor and counters.
    async fn update_progress(&self, id: OperationId, cursor: u64, counters: Counters) -> Result<()>;

    /// Move the operation along the state machine. No-op if already there.
    async fn set_status(&self, id: OperationId, status: OperationStatus) -> Result<()>;

    /// All `pending` or `running` operations, in no particular order.
    async fn list_active(&self) -> Result<Vec<Operation>>;

    /// Most recently created operations first.
    async fn list(&self, limit: usize) -> Result<Vec<Operation>>;

    async fn get(&self, id: OperationId) -> Result<Operation>;
}

/// Single-row record of which storage endpoint receives new writes.
#[async_trait]
pub trait ShardDirectory: Send + Sync {
    async fn load(&self) -> Result<Option<ShardSelection>>;

    async fn save(&self, selection: &ShardSelection) -> Result<()>;
}

/// Single-row runtime configuration document.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<Option<RuntimeConfig>>;

    async fn save(&self, config: &RuntimeConfig) -> Result<()>;
}

/// A collection of file records on one storage endpoint.
#[async_trait]
pub trait FileCollection: Send + Sync {
    /// Insert unless a record with the same content hash exists.
    async fn insert_file(&self, record: &FileRecord) -> Result<InsertOutcome>;

    async fn contains(&self, content_hash: &str) -> Result<bool>;

    async fn count(&self) -> Result<u64>;
}
