//! Storage router: one logical file collection over many endpoints.
//!
//! The router holds a primary endpoint (index 0) and any number of
//! additional endpoints (indices `1..=N`, in configuration order, counting
//! only those that connected). New writes go to the *current* collection,
//! which an administrator can retarget at runtime with
//! [`StorageRouter::select_endpoint`]. Existing records are never migrated;
//! they stay readable on whichever endpoint they were written to.
//!
//! ```text
//!             ┌──────────────────────────────┐
//!  writers ──▶│ current: Arc<CollectionHandle>│──▶ endpoint k
//!             └──────────────┬───────────────┘
//!                            │ select_endpoint(k')
//!                            ▼
//!                  ShardDirectory (primary)
//! ```
//!
//! The selection lives in the primary's Shard Directory, so another process
//! (`fdx shard select`) can change it. [`StorageRouter::sync_selection`]
//! re-reads it; the manager calls it at every batch boundary.
//!
//! The current handle sits behind an `RwLock<Arc<_>>`: readers clone the
//! `Arc` and never see a half-switched value; a switch replaces the whole
//! `Arc` in one step.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use filedex_core::store::{FileCollection, ShardDirectory};
use filedex_core::{Error, Result, ShardSelection};

use crate::config::EndpointConfig;
use crate::db::{self, PoolSettings};
use crate::migrate;
use crate::sqlite_store::{SqliteFileCollection, SqliteShardDirectory};

pub const PRIMARY_NAME: &str = "primary";

/// A named file collection on one endpoint.
#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub collection: Arc<dyn FileCollection>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, collection: Arc<dyn FileCollection>) -> Self {
        Self {
            name: name.into(),
            collection,
        }
    }
}

/// The collection currently receiving writes, with its position.
#[derive(Clone)]
pub struct CollectionHandle {
    pub index: usize,
    pub name: String,
    pub collection: Arc<dyn FileCollection>,
}

/// Administrative view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub index: usize,
    pub name: String,
    pub selected: bool,
    /// `None` when the count query failed.
    pub files: Option<u64>,
}

pub struct StorageRouter {
    primary: Endpoint,
    additional: Vec<Endpoint>,
    directory: Arc<dyn ShardDirectory>,
    current: RwLock<Arc<CollectionHandle>>,
    select_lock: tokio::sync::Mutex<()>,
    primary_pool: Option<SqlitePool>,
    pools: Vec<SqlitePool>,
}

impl StorageRouter {
    /// Connect to the primary and every additional endpoint.
    ///
    /// The primary failing is fatal (`EndpointUnavailable`). An additional
    /// endpoint failing is logged and the endpoint is left out of the pool.
    pub async fn connect(
        primary_uri: &str,
        additional: &[EndpointConfig],
        settings: PoolSettings,
    ) -> Result<Self> {
        let primary_settings = PoolSettings {
            create_parent: true,
            ..settings
        };
        let primary_pool = db::connect(primary_uri, primary_settings)
            .await
            .map_err(|e| Error::EndpointUnavailable {
                name: PRIMARY_NAME.to_string(),
                reason: e.to_string(),
            })?;
        migrate::migrate_primary(&primary_pool).await?;

        let mut endpoints = Vec::with_capacity(additional.len());
        let mut pools = Vec::with_capacity(additional.len());
        for ep in additional {
            match open_additional(ep, settings).await {
                Ok(pool) => {
                    info!(endpoint = %ep.name, index = endpoints.len() + 1, "storage endpoint connected");
                    endpoints.push(Endpoint::new(
                        ep.name.clone(),
                        Arc::new(SqliteFileCollection::new(pool.clone())),
                    ));
                    pools.push(pool);
                }
                Err(e) => {
                    warn!(endpoint = %ep.name, error = %e, "storage endpoint unavailable, excluded from pool");
                }
            }
        }

        let primary = Endpoint::new(
            PRIMARY_NAME,
            Arc::new(SqliteFileCollection::new(primary_pool.clone())),
        );
        let directory = Arc::new(SqliteShardDirectory::new(primary_pool.clone()));

        let mut router = Self::with_endpoints(primary, endpoints, directory).await?;
        router.primary_pool = Some(primary_pool);
        router.pools = pools;
        Ok(router)
    }

    /// Build a router over already-open collections and restore the
    /// persisted selection from `directory`.
    ///
    /// The selection is resolved by endpoint name. If the named endpoint is
    /// not in the pool, the router writes to the primary for now but leaves
    /// the stored selection alone, so it applies again once the endpoint
    /// reconnects.
    pub async fn with_endpoints(
        primary: Endpoint,
        additional: Vec<Endpoint>,
        directory: Arc<dyn ShardDirectory>,
    ) -> Result<Self> {
        let stored = directory.load().await?;
        let resolved = stored.as_ref().map(|sel| resolve(&additional, sel));
        let index = match (&stored, resolved) {
            (Some(sel), Some(None)) => {
                warn!(
                    endpoint = %sel.endpoint_name,
                    "selected storage endpoint is not connected, using primary"
                );
                0
            }
            (_, Some(Some(index))) => index,
            _ => 0,
        };

        let handle = handle_for(&primary, &additional, index);
        let router = Self {
            primary,
            additional,
            directory,
            current: RwLock::new(Arc::new(handle)),
            select_lock: tokio::sync::Mutex::new(()),
            primary_pool: None,
            pools: Vec::new(),
        };

        // First start records the primary. Later starts only refresh the
        // index and endpoint list of a selection that still resolves.
        let refresh = match (&stored, resolved) {
            (None, _) => true,
            (Some(sel), Some(Some(index))) => {
                sel.active_index != index || sel.endpoints != router.connected_names()
            }
            _ => false,
        };
        if refresh {
            if let Err(e) = router.directory.save(&router.selection_for(index)).await {
                warn!(error = %e, "failed to record shard selection");
            }
        }

        Ok(router)
    }

    /// Re-read the persisted selection and retarget new writes if another
    /// process selected a different endpoint.
    ///
    /// Returns the index now receiving writes. A selection naming an
    /// endpoint this process has not connected routes to the primary.
    pub async fn sync_selection(&self) -> Result<usize> {
        let _guard = self.select_lock.lock().await;
        let current = self.current_collection();
        let Some(stored) = self.directory.load().await? else {
            return Ok(current.index);
        };

        let index = match resolve(&self.additional, &stored) {
            Some(index) => index,
            None => {
                if current.index != 0 {
                    warn!(
                        endpoint = %stored.endpoint_name,
                        "selected storage endpoint is not connected, using primary"
                    );
                }
                0
            }
        };
        if index != current.index {
            let handle = handle_for(&self.primary, &self.additional, index);
            info!(index, endpoint = %handle.name, "storage endpoint selection changed");
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(handle);
        }
        Ok(index)
    }

    /// Route new writes to endpoint `index` and persist the choice.
    ///
    /// Fails with `OutOfRange` unless `0 <= index <= endpoint_count()`; the
    /// current endpoint is unchanged on any error.
    pub async fn select_endpoint(&self, index: usize) -> Result<()> {
        let max = self.additional.len();
        if index > max {
            return Err(Error::OutOfRange { index, max });
        }

        let _guard = self.select_lock.lock().await;
        self.directory.save(&self.selection_for(index)).await?;

        let handle = handle_for(&self.primary, &self.additional, index);
        info!(index, endpoint = %handle.name, "storage endpoint selected");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(handle);
        Ok(())
    }

    /// The collection new writes should go to.
    pub fn current_collection(&self) -> Arc<CollectionHandle> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of additional endpoints that connected.
    pub fn endpoint_count(&self) -> usize {
        self.additional.len()
    }

    /// Whether any connected collection already stores `content_hash`.
    ///
    /// Errors from the current collection propagate; errors from other
    /// endpoints are logged and that endpoint is skipped.
    pub async fn contains_file(&self, content_hash: &str) -> Result<bool> {
        let current = self.current_collection();
        if current.collection.contains(content_hash).await? {
            return Ok(true);
        }

        for (index, ep) in self.all_endpoints() {
            if index == current.index {
                continue;
            }
            match ep.collection.contains(content_hash).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!(endpoint = %ep.name, error = %e, "duplicate check skipped endpoint");
                }
            }
        }
        Ok(false)
    }

    pub async fn endpoints(&self) -> Vec<EndpointInfo> {
        let selected = self.current_collection().index;
        let mut out = Vec::with_capacity(self.additional.len() + 1);
        for (index, ep) in self.all_endpoints() {
            out.push(EndpointInfo {
                index,
                name: ep.name.clone(),
                selected: index == selected,
                files: ep.collection.count().await.ok(),
            });
        }
        out
    }

    /// Pool of the primary endpoint, when connected through [`connect`](Self::connect).
    pub fn primary_pool(&self) -> Option<&SqlitePool> {
        self.primary_pool.as_ref()
    }

    /// Close every pool the router opened.
    pub async fn close(&self) {
        for pool in &self.pools {
            pool.close().await;
        }
        if let Some(pool) = &self.primary_pool {
            pool.close().await;
        }
    }

    fn all_endpoints(&self) -> impl Iterator<Item = (usize, &Endpoint)> {
        std::iter::once(&self.primary)
            .chain(self.additional.iter())
            .enumerate()
    }

    fn connected_names(&self) -> Vec<String> {
        self.additional.iter().map(|e| e.name.clone()).collect()
    }

    fn selection_for(&self, index: usize) -> ShardSelection {
        let name = if index == 0 {
            PRIMARY_NAME.to_string()
        } else {
            self.additional[index - 1].name.clone()
        };
        ShardSelection {
            active_index: index,
            endpoint_name: name,
            endpoints: self.connected_names(),
            updated_at: Utc::now(),
        }
    }
}

/// Index of the endpoint `selection` names, `None` if it is not connected.
fn resolve(additional: &[Endpoint], selection: &ShardSelection) -> Option<usize> {
    if selection.endpoint_name == PRIMARY_NAME {
        return Some(0);
    }
    additional
        .iter()
        .position(|e| e.name == selection.endpoint_name)
        .map(|pos| pos + 1)
}

fn handle_for(primary: &Endpoint, additional: &[Endpoint], index: usize) -> CollectionHandle {
    let ep = if index == 0 {
        primary
    } else {
        &additional[index - 1]
    };
    CollectionHandle {
        index,
        name: ep.name.clone(),
        collection: Arc::clone(&ep.collection),
    }
}

async fn open_additional(ep: &EndpointConfig, settings: PoolSettings) -> Result<SqlitePool> {
    let pool = db::connect(&ep.uri, settings)
        .await
        .map_err(|e| Error::EndpointUnavailable {
            name: ep.name.clone(),
            reason: e.to_string(),
        })?;
    migrate::migrate_files(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filedex_core::store::memory::{MemoryFileCollection, MemoryShardDirectory};
    use filedex_core::{FileRecord, InsertOutcome, SourceItem};

    struct Fixture {
        primary: Arc<MemoryFileCollection>,
        extra: Vec<Arc<MemoryFileCollection>>,
        directory: Arc<MemoryShardDirectory>,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            Self {
                primary: Arc::new(MemoryFileCollection::new()),
                extra: (0..n).map(|_| Arc::new(MemoryFileCollection::new())).collect(),
                directory: Arc::new(MemoryShardDirectory::new()),
            }
        }

        async fn router(&self) -> StorageRouter {
            let extra = self
                .extra
                .iter()
                .enumerate()
                .map(|(i, c)| Endpoint::new(format!("shard-{}", i + 1), c.clone() as Arc<dyn FileCollection>))
                .collect();
            StorageRouter::with_endpoints(
                Endpoint::new(PRIMARY_NAME, self.primary.clone()),
                extra,
                self.directory.clone(),
            )
            .await
            .unwrap()
        }
    }

    fn record(unique: &str) -> FileRecord {
        let item = SourceItem {
            position: 1,
            file_id: "f".into(),
            unique_id: unique.into(),
            file_name: "a.mkv".into(),
            file_size: 1,
            mime_type: None,
            caption: None,
        };
        FileRecord::from_item(&item, "src", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn starts_on_primary_without_saved_selection() {
        let fx = Fixture::new(2);
        let router = fx.router().await;
        assert_eq!(router.current_collection().index, 0);
        assert_eq!(router.endpoint_count(), 2);

        let saved = fx.directory.load().await.unwrap().unwrap();
        assert_eq!(saved.endpoint_name, PRIMARY_NAME);
        assert_eq!(saved.endpoints, vec!["shard-1", "shard-2"]);
    }

    #[tokio::test]
    async fn select_redirects_writes_and_persists() {
        let fx = Fixture::new(2);
        let router = fx.router().await;
        router.select_endpoint(2).await.unwrap();

        let current = router.current_collection();
        assert_eq!(current.index, 2);
        assert_eq!(current.name, "shard-2");
        assert_eq!(
            current.collection.insert_file(&record("x")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(fx.extra[1].count().await.unwrap(), 1);
        assert_eq!(fx.primary.count().await.unwrap(), 0);

        let saved = fx.directory.load().await.unwrap().unwrap();
        assert_eq!(saved.active_index, 2);
        assert_eq!(saved.endpoint_name, "shard-2");
    }

    #[tokio::test]
    async fn out_of_range_leaves_selection_unchanged() {
        let fx = Fixture::new(2);
        let router = fx.router().await;
        router.select_endpoint(1).await.unwrap();

        let bad = router.endpoint_count() + 1;
        let err = router.select_endpoint(bad).await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange { index: 3, max: 2 }));
        assert_eq!(router.current_collection().index, 1);
        assert_eq!(fx.directory.load().await.unwrap().unwrap().active_index, 1);
    }

    #[tokio::test]
    async fn selection_survives_rebuild_by_name() {
        let fx = Fixture::new(3);
        fx.router().await.select_endpoint(3).await.unwrap();

        // shard-2 dropped out: shard-3 is now at index 2.
        let extra = vec![
            Endpoint::new("shard-1", fx.extra[0].clone() as Arc<dyn FileCollection>),
            Endpoint::new("shard-3", fx.extra[2].clone() as Arc<dyn FileCollection>),
        ];
        let router = StorageRouter::with_endpoints(
            Endpoint::new(PRIMARY_NAME, fx.primary.clone()),
            extra,
            fx.directory.clone(),
        )
        .await
        .unwrap();
        let current = router.current_collection();
        assert_eq!(current.index, 2);
        assert_eq!(current.name, "shard-3");
    }

    #[tokio::test]
    async fn missing_selected_endpoint_falls_back_to_primary() {
        let fx = Fixture::new(1);
        fx.router().await.select_endpoint(1).await.unwrap();

        let router = StorageRouter::with_endpoints(
            Endpoint::new(PRIMARY_NAME, fx.primary.clone()),
            Vec::new(),
            fx.directory.clone(),
        )
        .await
        .unwrap();
        assert_eq!(router.current_collection().index, 0);

        let saved = fx.directory.load().await.unwrap().unwrap();
        assert_eq!(saved.endpoint_name, "shard-1");

        // Endpoint back: the stored choice applies again.
        let router = fx.router().await;
        assert_eq!(router.current_collection().name, "shard-1");
    }

    #[tokio::test]
    async fn sync_picks_up_selection_made_elsewhere() {
        let fx = Fixture::new(2);
        let serving = fx.router().await;
        let admin = fx.router().await;

        admin.select_endpoint(2).await.unwrap();
        assert_eq!(serving.current_collection().index, 0);
        assert_eq!(serving.sync_selection().await.unwrap(), 2);
        assert_eq!(serving.current_collection().name, "shard-2");

        admin.select_endpoint(0).await.unwrap();
        assert_eq!(serving.sync_selection().await.unwrap(), 0);
        assert_eq!(serving.current_collection().name, PRIMARY_NAME);
    }

    #[tokio::test]
    async fn sync_routes_unknown_endpoint_to_primary() {
        let fx = Fixture::new(2);
        let serving = StorageRouter::with_endpoints(
            Endpoint::new(PRIMARY_NAME, fx.primary.clone()),
            vec![Endpoint::new("shard-1", fx.extra[0].clone() as Arc<dyn FileCollection>)],
            fx.directory.clone(),
        )
        .await
        .unwrap();
        serving.select_endpoint(1).await.unwrap();

        fx.router().await.select_endpoint(2).await.unwrap();
        assert_eq!(serving.sync_selection().await.unwrap(), 0);
        assert_eq!(serving.current_collection().index, 0);
        assert_eq!(fx.directory.load().await.unwrap().unwrap().endpoint_name, "shard-2");
    }

    #[tokio::test]
    async fn contains_file_checks_every_endpoint() {
        let fx = Fixture::new(1);
        let router = fx.router().await;
        let rec = record("old");
        fx.primary.insert_file(&rec).await.unwrap();

        router.select_endpoint(1).await.unwrap();
        assert!(router.contains_file(&rec.content_hash).await.unwrap());
        assert!(!router.contains_file(&record("new").content_hash).await.unwrap());

        fx.primary.set_unavailable(true);
        assert!(!router.contains_file(&rec.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn endpoints_report_selection_and_counts() {
        let fx = Fixture::new(1);
        let router = fx.router().await;
        fx.extra[0].insert_file(&record("a")).await.unwrap();
        router.select_endpoint(1).await.unwrap();

        let info = router.endpoints().await;
        assert_eq!(info.len(), 2);
        assert!(!info[0].selected);
        assert!(info[1].selected);
        assert_eq!(info[1].files, Some(1));
    }
}
