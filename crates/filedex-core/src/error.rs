//! Error taxonomy shared by every filedex component.

use thiserror::Error;

use crate::models::OperationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown operation id (or other keyed lookup).
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate operation id: {0}")]
    DuplicateId(OperationId),

    /// State-machine violation. `to` is a status name, or `progress` for
    /// a cursor update against a terminal operation.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("cursor regression: stored {current}, attempted {attempted}")]
    CursorRegression { current: u64, attempted: u64 },

    #[error("endpoint index {index} out of range (0..={max})")]
    OutOfRange { index: usize, max: usize },

    #[error("operation {0} is already running")]
    AlreadyRunning(OperationId),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("endpoint '{name}' unavailable: {reason}")]
    EndpointUnavailable { name: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        Self::Storage(e.to_string())
    }

    pub fn source_unavailable<E: std::fmt::Display>(e: E) -> Self {
        Self::SourceUnavailable(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable(_) | Error::Timeout(_) | Error::Storage(_)
        )
    }
}
