//! # filedex core
//!
//! Backend-neutral pieces of filedex: the operation model and its state
//! machine, the error taxonomy, the storage and source traits, and in-memory
//! implementations of each.
//!
//! This crate contains no tokio runtime, sqlx, or network I/O.

pub mod error;
pub mod models;
pub mod source;
pub mod store;

pub use error::{Error, Result};
pub use models::{
    content_hash, Counters, FileRecord, InsertOutcome, Operation, OperationId, OperationStatus,
    RuntimeConfig, ShardSelection, SourceItem,
};
pub use source::{FileSource, MemorySource};
