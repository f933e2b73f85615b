//! Runtime configuration handle.
//!
//! The config document lives on the primary and is read by every component.
//! Readers take a snapshot with [`ConfigHandle::current`]; a refresh or an
//! update replaces the whole value at once.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use filedex_core::store::ConfigStore;
use filedex_core::{Result, RuntimeConfig};

pub struct ConfigHandle {
    store: Arc<dyn ConfigStore>,
    value: RwLock<Arc<RuntimeConfig>>,
}

impl ConfigHandle {
    /// Load the document, falling back to defaults if it is missing or
    /// unreadable.
    pub async fn load(store: Arc<dyn ConfigStore>) -> Self {
        let value = match store.load().await {
            Ok(Some(cfg)) => cfg,
            Ok(None) => RuntimeConfig::default(),
            Err(e) => {
                error!(error = %e, "failed to load runtime config, using defaults");
                RuntimeConfig::default()
            }
        };
        Self {
            store,
            value: RwLock::new(Arc::new(value)),
        }
    }

    pub fn current(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.value.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the document. On failure the previous value stays in place.
    pub async fn refresh(&self) -> Arc<RuntimeConfig> {
        match self.store.load().await {
            Ok(loaded) => {
                let next = Arc::new(loaded.unwrap_or_default());
                *self.value.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
                debug!("runtime config refreshed");
                next
            }
            Err(e) => {
                error!(error = %e, "failed to refresh runtime config");
                self.current()
            }
        }
    }

    /// Persist `config`, then make it current.
    pub async fn update(&self, config: RuntimeConfig) -> Result<()> {
        self.store.save(&config).await?;
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        Ok(())
    }
}
