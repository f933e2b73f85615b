//! Core data models used throughout filedex.
//!
//! These types describe the index operations, the items scanned from a chat
//! source, the file records written to storage, and the small documents that
//! hold shard selection and runtime configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

pub type OperationId = Uuid;

/// Lifecycle status of an index operation.
///
/// ```text
/// pending ──▶ running ──▶ completed
///    │           │ └────▶ failed
///    │           ▼
///    └──────▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same status is not a transition; callers treat it as
    /// an idempotent no-op before consulting this.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Validate `self -> next`, treating `self == next` as allowed.
    pub fn check_transition(&self, next: OperationStatus) -> Result<(), Error> {
        if *self == next || self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(Error::storage(format!("unknown operation status '{}'", other))),
        }
    }
}

/// Per-operation tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Files written to storage.
    pub indexed: u64,
    /// Files whose content was already stored.
    pub skipped: u64,
    /// Items that failed to write.
    pub errors: u64,
}

impl Counters {
    pub fn processed(&self) -> u64 {
        self.indexed + self.skipped + self.errors
    }
}

/// One bulk indexing job over a chat source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// Chat or channel being scanned.
    pub source: String,
    pub status: OperationStatus,
    /// Last source position fully processed. Never moves backwards.
    pub cursor: u64,
    pub counters: Counters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// A fresh pending operation with a generated id and zeroed progress.
    pub fn new(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            status: OperationStatus::Pending,
            cursor: 0,
            counters: Counters::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A file-bearing message read from a chat source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Message position within the source; strictly increasing.
    pub position: u64,
    /// Platform id used to send the file back to users.
    pub file_id: String,
    /// Platform fingerprint of the file content, stable across re-uploads.
    pub unique_id: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// A stored file, keyed by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content_hash: String,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub source: String,
    pub position: u64,
    pub operation_id: OperationId,
    pub indexed_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn from_item(item: &SourceItem, source: &str, operation_id: OperationId) -> Self {
        Self {
            content_hash: content_hash(&item.unique_id, item.file_size),
            file_id: item.file_id.clone(),
            file_name: item.file_name.clone(),
            file_size: item.file_size,
            mime_type: item.mime_type.clone(),
            caption: item.caption.clone(),
            source: source.to_string(),
            position: item.position,
            operation_id,
            indexed_at: Utc::now(),
        }
    }
}

/// Content address of a file: sha256 over the platform fingerprint and size.
pub fn content_hash(unique_id: &str, file_size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unique_id.as_bytes());
    hasher.update(file_size.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of writing a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Persisted storage-endpoint selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSelection {
    /// 0 = primary, 1..=N = additional endpoints.
    pub active_index: usize,
    /// Name of the selected endpoint; used to re-resolve the index on restart.
    pub endpoint_name: String,
    /// Names of the connected additional endpoints, in index order.
    pub endpoints: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Runtime settings persisted in the config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub resume_on_startup: bool,
    #[serde(default = "default_true")]
    pub progress_notifications: bool,
    #[serde(default = "default_notify_every")]
    pub notify_every_batches: u32,
}

fn default_true() -> bool {
    true
}

fn default_notify_every() -> u32 {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resume_on_startup: true,
            progress_notifications: true,
            notify_every_batches: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OperationStatus; 5] = [
        OperationStatus::Pending,
        OperationStatus::Running,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::Cancelled,
    ];

    #[test]
    fn only_listed_transitions_are_allowed() {
        use OperationStatus::*;
        let allowed = [
            (Pending, Running),
            (Pending, Cancelled),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn completed_to_running_is_rejected() {
        let err = OperationStatus::Completed
            .check_transition(OperationStatus::Running)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn same_status_is_idempotent() {
        for s in ALL {
            assert!(s.check_transition(s).is_ok());
        }
    }

    #[test]
    fn status_parses_from_storage_names() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<OperationStatus>().unwrap(), s);
        }
        assert!("paused".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn content_hash_depends_on_fingerprint_and_size() {
        let a = content_hash("AgADxyz", 1024);
        assert_eq!(a, content_hash("AgADxyz", 1024));
        assert_ne!(a, content_hash("AgADxyz", 1025));
        assert_ne!(a, content_hash("AgADabc", 1024));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn runtime_config_fills_missing_fields() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"progress_notifications":false}"#).unwrap();
        assert!(cfg.resume_on_startup);
        assert!(!cfg.progress_notifications);
        assert_eq!(cfg.notify_every_batches, 1);
    }
}
