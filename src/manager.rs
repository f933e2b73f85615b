//! Operation manager: runs, resumes, and cancels index operations.
//!
//! A run walks the source in position windows of `batch_size`, starting
//! from the persisted cursor:
//!
//! ```text
//! cursor ──▶ fetch (cursor, cursor+batch] ──▶ dedup + write each item
//!    ▲                                              │
//!    └────────── persist cursor + counters ◀────────┘
//! ```
//!
//! Cancellation is checked between batches, so a cancelled run finishes the
//! batch in hand, persists it, and stops as `cancelled`. Source calls are
//! retried up to the retry budget; exhausting it marks the operation
//! `failed`. Per-item write failures are only counted.
//!
//! At most one run per operation id is active in the process at a time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use filedex_core::store::OperationStore;
use filedex_core::{
    Counters, Error, FileRecord, FileSource, InsertOutcome, Operation, OperationId,
    OperationStatus, Result, SourceItem,
};

use crate::config::IndexConfig;
use crate::progress::{self, Notifier, ProgressEvent};
use crate::router::StorageRouter;
use crate::settings::ConfigHandle;

/// Tunables for a run.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Source positions covered per batch; also the persistence interval.
    pub batch_size: u64,
    /// Attempts per source call before the operation fails.
    pub retry_budget: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_backoff: Duration,
    /// Deadline for every source, storage, and notification call.
    pub call_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        (&IndexConfig::default()).into()
    }
}

impl From<&IndexConfig> for ManagerSettings {
    fn from(cfg: &IndexConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            retry_budget: cfg.retry_budget,
            retry_backoff: cfg.retry_backoff(),
            call_timeout: cfg.call_timeout(),
        }
    }
}

/// Why a retried call gave up.
enum Interrupted {
    Cancelled,
    Exhausted(Error),
}

pub struct OperationManager {
    store: Arc<dyn OperationStore>,
    router: Arc<StorageRouter>,
    source: Arc<dyn FileSource>,
    notifier: Arc<dyn Notifier>,
    config: Arc<ConfigHandle>,
    settings: ManagerSettings,
    active: Mutex<HashMap<OperationId, CancellationToken>>,
    tracker: TaskTracker,
}

/// Releases the single-flight slot on drop.
struct Claim<'a> {
    manager: &'a OperationManager,
    id: OperationId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.manager
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl OperationManager {
    pub fn new(
        store: Arc<dyn OperationStore>,
        router: Arc<StorageRouter>,
        source: Arc<dyn FileSource>,
        notifier: Arc<dyn Notifier>,
        config: Arc<ConfigHandle>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            router,
            source,
            notifier,
            config,
            settings,
            active: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Create a pending operation for `source` and a run token derived from
    /// `parent`. Cancelling `parent` cancels the run.
    pub async fn new_operation(
        &self,
        parent: &CancellationToken,
        source: &str,
    ) -> Result<(CancellationToken, Operation)> {
        let op = Operation::new(source);
        self.store.create(&op).await?;
        info!(operation = %op.id, source, "index operation created");
        Ok((parent.child_token(), op))
    }

    /// Run token for an existing operation (resumption path).
    pub fn attach(&self, parent: &CancellationToken, op: &Operation) -> CancellationToken {
        debug!(operation = %op.id, cursor = op.cursor, "attaching to existing operation");
        parent.child_token()
    }

    /// Drive `op` from its persisted cursor to a terminal status.
    ///
    /// Returns the final operation; a `failed` or `cancelled` result is
    /// still `Ok`. Errors are reserved for `AlreadyRunning`, unknown or
    /// terminal operations, and persistence failures.
    pub async fn run_operation(
        &self,
        token: CancellationToken,
        op: &Operation,
    ) -> Result<Operation> {
        let _claim = self.claim(op.id, &token)?;
        let span = info_span!("operation", id = %op.id, source = %op.source);
        self.drive(token, op.id).instrument(span).await
    }

    /// Run `op` as a tracked background task.
    pub fn spawn(
        self: &Arc<Self>,
        token: CancellationToken,
        op: Operation,
    ) -> JoinHandle<Result<Operation>> {
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let result = this.run_operation(token, &op).await;
            if let Err(e) = &result {
                error!(operation = %op.id, error = %e, "index operation stopped with error");
            }
            result
        })
    }

    /// Cancel an operation by id.
    ///
    /// A run in this process is signalled and stops after its current batch.
    /// Otherwise see [`cancel_stored`].
    pub async fn cancel(&self, id: OperationId) -> Result<()> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(token) = token {
            info!(operation = %id, "cancellation requested");
            token.cancel();
            return Ok(());
        }

        cancel_stored(self.store.as_ref(), id).await
    }

    /// Ids of operations with an active run in this process.
    pub fn running(&self) -> Vec<OperationId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Stop accepting spawned runs and wait for the tracked ones to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn claim(&self, id: OperationId, token: &CancellationToken) -> Result<Claim<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&id) {
            return Err(Error::AlreadyRunning(id));
        }
        active.insert(id, token.clone());
        Ok(Claim { manager: self, id })
    }

    async fn drive(&self, token: CancellationToken, id: OperationId) -> Result<Operation> {
        let mut op = self.store.get(id).await?;
        if op.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: op.status.to_string(),
                to: OperationStatus::Running.to_string(),
            });
        }
        if token.is_cancelled() {
            return self.finish(op, OperationStatus::Cancelled, 0).await;
        }

        self.store.set_status(id, OperationStatus::Running).await?;
        op.status = OperationStatus::Running;

        let latest = {
            let source = Arc::clone(&self.source);
            let name = op.source.clone();
            let call = move || {
                let source = Arc::clone(&source);
                let name = name.clone();
                async move { source.latest_position(&name).await }
            };
            match self.with_retry(&token, "latest position", call).await {
                Ok(latest) => latest,
                Err(Interrupted::Cancelled) => {
                    return self.finish(op, OperationStatus::Cancelled, 0).await
                }
                Err(Interrupted::Exhausted(e)) => return self.fail(op, e, 0).await,
            }
        };

        info!(cursor = op.cursor, latest, "index run started");
        self.notify(
            &op,
            ProgressEvent::Started {
                cursor: op.cursor,
                latest,
            },
        )
        .await;

        let batch_size = self.settings.batch_size.max(1);
        let mut batches: u64 = 0;

        loop {
            if op.cursor >= latest {
                return self.finish(op, OperationStatus::Completed, latest).await;
            }
            if token.is_cancelled() {
                return self.finish(op, OperationStatus::Cancelled, latest).await;
            }
            if let Err(e) = self.router.sync_selection().await {
                warn!(error = %e, "could not re-read shard selection, keeping current endpoint");
            }

            let after = op.cursor;
            let until = after.saturating_add(batch_size).min(latest);
            let items = {
                let source = Arc::clone(&self.source);
                let name = op.source.clone();
                let call = move || {
                    let source = Arc::clone(&source);
                    let name = name.clone();
                    async move { source.fetch_window(&name, after, until).await }
                };
                match self.with_retry(&token, "fetch window", call).await {
                    Ok(items) => items,
                    Err(Interrupted::Cancelled) => {
                        return self.finish(op, OperationStatus::Cancelled, latest).await
                    }
                    Err(Interrupted::Exhausted(e)) => return self.fail(op, e, latest).await,
                }
            };

            let mut counters = op.counters;
            for item in &items {
                self.index_item(&op, item, &mut counters).await;
            }

            if let Err(e) = self.store.update_progress(id, until, counters).await {
                if matches!(e, Error::InvalidTransition { .. }) {
                    let current = self.store.get(id).await?;
                    if current.status == OperationStatus::Cancelled {
                        info!(cursor = current.cursor, "operation cancelled by another process");
                        return Ok(current);
                    }
                }
                return Err(e);
            }
            op.cursor = until;
            op.counters = counters;
            batches += 1;

            debug!(
                cursor = op.cursor,
                latest,
                items = items.len(),
                indexed = counters.indexed,
                skipped = counters.skipped,
                errors = counters.errors,
                "batch persisted"
            );

            let every = u64::from(self.config.current().notify_every_batches.max(1));
            if batches % every == 0 {
                self.notify(
                    &op,
                    ProgressEvent::Batch {
                        cursor: op.cursor,
                        latest,
                        counters,
                    },
                )
                .await;
            }
        }
    }

    /// Dedup and write one item. Failures are counted, never raised.
    async fn index_item(&self, op: &Operation, item: &SourceItem, counters: &mut Counters) {
        let record = FileRecord::from_item(item, &op.source, op.id);
        let timeout = self.settings.call_timeout;

        let seen = self.router.contains_file(&record.content_hash);
        match with_deadline(timeout, "duplicate check", seen).await {
            Ok(true) => {
                counters.skipped += 1;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(position = item.position, error = %e, "duplicate check failed");
                counters.errors += 1;
                return;
            }
        }

        let target = self.router.current_collection();
        match with_deadline(timeout, "file write", target.collection.insert_file(&record)).await {
            Ok(InsertOutcome::Inserted) => counters.indexed += 1,
            Ok(InsertOutcome::Duplicate) => counters.skipped += 1,
            Err(e) => {
                warn!(
                    position = item.position,
                    endpoint = %target.name,
                    error = %e,
                    "file write failed"
                );
                counters.errors += 1;
            }
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        token: &CancellationToken,
        what: &str,
        mut call: F,
    ) -> std::result::Result<T, Interrupted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.settings.retry_budget.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match with_deadline(self.settings.call_timeout, what, call()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= attempts {
                warn!(attempt, attempts, error = %err, "{} failed, giving up", what);
                return Err(Interrupted::Exhausted(err));
            }

            let delay = self
                .settings
                .retry_backoff
                .saturating_mul(1u32 << (attempt - 1).min(6));
            warn!(attempt, attempts, error = %err, ?delay, "{} failed, retrying", what);
            tokio::select! {
                _ = token.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fail(&self, op: Operation, cause: Error, latest: u64) -> Result<Operation> {
        error!(cursor = op.cursor, error = %cause, "source unavailable, operation failed");
        self.finish(op, OperationStatus::Failed, latest).await
    }

    async fn finish(
        &self,
        mut op: Operation,
        status: OperationStatus,
        latest: u64,
    ) -> Result<Operation> {
        if let Err(e) = self.store.set_status(op.id, status).await {
            if matches!(e, Error::InvalidTransition { .. }) {
                error!(from = %op.status, to = %status, error = %e, "rejected status change");
            }
            return Err(e);
        }
        op.status = status;
        info!(
            status = %status,
            cursor = op.cursor,
            indexed = op.counters.indexed,
            skipped = op.counters.skipped,
            errors = op.counters.errors,
            "index run finished"
        );
        self.notify(
            &op,
            ProgressEvent::Finished {
                status,
                cursor: op.cursor,
                latest: latest.max(op.cursor),
                counters: op.counters,
            },
        )
        .await;
        Ok(op)
    }

    async fn notify(&self, op: &Operation, event: ProgressEvent) {
        if !self.config.current().progress_notifications {
            return;
        }
        let text = progress::render(&op.source, &event);
        let sent = self.notifier.notify(op, &text);
        match tokio::time::timeout(self.settings.call_timeout, sent).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "progress notification failed"),
            Err(_) => warn!("progress notification timed out"),
        }
    }
}

/// Mark a non-terminal operation `cancelled` in the store.
///
/// Used for operations with no run in this process. A run elsewhere sees
/// the change on its next progress write and stops.
pub async fn cancel_stored(store: &dyn OperationStore, id: OperationId) -> Result<()> {
    let op = store.get(id).await?;
    if op.status.is_terminal() {
        return Err(Error::InvalidTransition {
            from: op.status.to_string(),
            to: OperationStatus::Cancelled.to_string(),
        });
    }
    store.set_status(id, OperationStatus::Cancelled).await?;
    info!(operation = %id, "idle operation cancelled");
    Ok(())
}

async fn with_deadline<T, Fut>(limit: Duration, what: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}
