//! Process wiring: storage, manager, resumption, liveness, and shutdown.
//!
//! Startup order:
//!
//! 1. Connect the primary (fatal on failure) and every additional endpoint
//!    (degraded on failure), restoring the persisted shard selection.
//! 2. Load the runtime config document from the primary.
//! 3. Build the operation manager under a root cancellation token.
//! 4. Resume every `pending` or `running` operation when
//!    `resume_on_startup` is set.
//! 5. Serve `/healthz` until Ctrl-C or the root token is cancelled.
//!
//! Shutdown cancels the root token (every run finishes its current batch
//! and persists it), waits for the tracked runs, then closes the pools.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use filedex_core::store::OperationStore;
use filedex_core::{FileSource, Operation};

use crate::config::Config;
use crate::db::PoolSettings;
use crate::manager::{ManagerSettings, OperationManager};
use crate::platform::{HttpFileSource, HttpNotifier};
use crate::progress::{Notifier, TracingNotifier};
use crate::router::StorageRouter;
use crate::server;
use crate::settings::ConfigHandle;
use crate::sqlite_store::{SqliteConfigStore, SqliteOperationStore};

/// Everything persisted: the router and the primary-hosted stores.
pub struct Storage {
    pub router: Arc<StorageRouter>,
    pub operations: Arc<dyn OperationStore>,
    pub config: Arc<ConfigHandle>,
}

impl Storage {
    pub async fn open(config: &Config) -> Result<Self> {
        let settings = PoolSettings {
            max_connections: config.db.max_connections,
            timeout: config.index.call_timeout(),
            create_parent: false,
        };
        let router = StorageRouter::connect(&config.db.primary, &config.db.endpoints, settings)
            .await
            .context("Failed to connect storage")?;

        let pool = router
            .primary_pool()
            .cloned()
            .context("primary endpoint has no pool")?;
        let operations: Arc<dyn OperationStore> = Arc::new(SqliteOperationStore::new(pool.clone()));
        let runtime = ConfigHandle::load(Arc::new(SqliteConfigStore::new(pool))).await;

        info!(
            endpoints = router.endpoint_count(),
            selected = %router.current_collection().name,
            "storage ready"
        );

        Ok(Self {
            router: Arc::new(router),
            operations,
            config: Arc::new(runtime),
        })
    }

    pub async fn close(&self) {
        self.router.close().await;
    }
}

/// Notifier for `config`: the platform chat when one is configured,
/// otherwise the log.
pub fn notifier_for(config: &Config) -> Result<Arc<dyn Notifier>> {
    match (&config.platform.base_url, &config.platform.progress_chat) {
        (Some(_), Some(chat)) => Ok(Arc::new(HttpNotifier::new(
            &config.platform,
            chat,
            config.index.call_timeout(),
        )?)),
        _ => Ok(Arc::new(TracingNotifier)),
    }
}

pub struct Orchestrator {
    config: Config,
    storage: Storage,
    manager: Arc<OperationManager>,
    root: CancellationToken,
}

impl Orchestrator {
    /// Open storage and the platform bridge described by `config`.
    pub async fn start(config: Config) -> Result<Self> {
        let source: Arc<dyn FileSource> = Arc::new(
            HttpFileSource::new(&config.platform, config.index.call_timeout())
                .context("Failed to set up file source")?,
        );
        let notifier = notifier_for(&config)?;
        let storage = Storage::open(&config).await?;
        Ok(Self::new(config, storage, source, notifier))
    }

    pub fn new(
        config: Config,
        storage: Storage,
        source: Arc<dyn FileSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let manager = Arc::new(OperationManager::new(
            Arc::clone(&storage.operations),
            Arc::clone(&storage.router),
            source,
            notifier,
            Arc::clone(&storage.config),
            ManagerSettings::from(&config.index),
        ));
        Self {
            config,
            storage,
            manager,
            root: CancellationToken::new(),
        }
    }

    pub fn manager(&self) -> &Arc<OperationManager> {
        &self.manager
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Cancelling this token stops every run started by this orchestrator.
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Spawn a run for every non-terminal operation. Returns how many were
    /// resumed.
    pub async fn resume_active(&self) -> Result<usize> {
        let runtime = self.storage.config.refresh().await;
        if !runtime.resume_on_startup {
            info!("resume on startup disabled, leaving active operations idle");
            return Ok(0);
        }

        let active = self
            .storage
            .operations
            .list_active()
            .await
            .context("Failed to list active operations")?;

        for op in &active {
            info!(operation = %op.id, source = %op.source, cursor = op.cursor, "resuming operation");
            let token = self.manager.attach(&self.root, op);
            let _handle = self.manager.spawn(token, op.clone());
        }
        Ok(active.len())
    }

    /// Create one operation for `source` and run it in the foreground.
    /// Ctrl-C cancels it after the current batch.
    pub async fn index_source(&self, source: &str) -> Result<Operation> {
        let (token, op) = self.manager.new_operation(&self.root, source).await?;

        let on_signal = token.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupt received, stopping after current batch");
                    on_signal.cancel();
                }
                _ = on_signal.cancelled() => {}
            }
        });

        let result = self.manager.run_operation(token.clone(), &op).await;
        token.cancel();
        let _ = watcher.await;
        Ok(result?)
    }

    /// Resume work and serve liveness until interrupted, then shut down.
    pub async fn serve(self) -> Result<()> {
        let resumed = self.resume_active().await?;
        info!(resumed, "orchestrator started");

        let bind = self.config.server.bind.clone();
        let stop = self.root.clone();
        let mut server = tokio::spawn(async move { server::run_server(&bind, stop).await });

        let early = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "failed to listen for interrupt");
                }
                info!("interrupt received, shutting down");
                None
            }
            _ = self.root.cancelled() => None,
            res = &mut server => Some(res),
        };

        self.shutdown().await;
        let finished = match early {
            Some(res) => res,
            None => server.await,
        };
        match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e).context("liveness server task panicked"),
        }
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        let running = self.manager.running();
        if !running.is_empty() {
            info!(count = running.len(), "waiting for running operations to persist");
        }
        self.manager.shutdown().await;
        self.storage.close().await;
        info!("shutdown complete");
    }
}
