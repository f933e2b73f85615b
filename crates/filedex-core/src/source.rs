//! Source of files to index.
//!
//! A [`FileSource`] exposes the file-bearing messages of a chat as a sequence
//! ordered by position. Positions may have gaps (deleted messages, messages
//! without files), so reads are by window rather than by count.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::SourceItem;

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Highest position currently present in `source`.
    async fn latest_position(&self, source: &str) -> Result<u64>;

    /// Items with `after < position <= until`, in position order.
    async fn fetch_window(&self, source: &str, after: u64, until: u64) -> Result<Vec<SourceItem>>;
}

/// In-memory source for tests and embedders.
///
/// Holds items for any number of sources. Transient failures can be
/// injected with [`fail_next`](MemorySource::fail_next) or
/// [`set_unreachable`](MemorySource::set_unreachable).
#[derive(Default)]
pub struct MemorySource {
    items: Mutex<BTreeMap<String, Vec<SourceItem>>>,
    windows: Mutex<Vec<(u64, u64)>>,
    fail_next: AtomicU32,
    unreachable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(source: &str, items: Vec<SourceItem>) -> Self {
        let s = Self::new();
        s.push(source, items);
        s
    }

    pub fn push(&self, source: &str, mut items: Vec<SourceItem>) {
        let mut map = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(source.to_string()).or_default();
        entry.append(&mut items);
        entry.sort_by_key(|i| i.position);
    }

    /// Fail the next `n` calls with `SourceUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every window successfully served, in call order.
    pub fn fetched_windows(&self) -> Vec<(u64, u64)> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::source_unavailable("source unreachable"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::source_unavailable("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn latest_position(&self, source: &str) -> Result<u64> {
        self.check()?;
        let map = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(source)
            .and_then(|items| items.last())
            .map(|i| i.position)
            .unwrap_or(0))
    }

    async fn fetch_window(&self, source: &str, after: u64, until: u64) -> Result<Vec<SourceItem>> {
        self.check()?;
        let out = {
            let map = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            map.get(source)
                .map(|items| {
                    items
                        .iter()
                        .filter(|i| i.position > after && i.position <= until)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((after, until));
        Ok(out)
    }
}
