//! Process configuration.
//!
//! Loaded once at startup from a TOML file, then overridden by environment
//! variables, then validated. Connection strings are never hot-reloaded: a
//! new endpoint means a new `[[db.endpoints]]` entry and a restart, followed
//! by an explicit `shard select`.
//!
//! ```toml
//! [db]
//! primary = "sqlite:data/primary.db"
//!
//! [[db.endpoints]]
//! name = "overflow-1"
//! uri = "sqlite:data/overflow-1.db"
//!
//! [index]
//! batch_size = 200
//! retry_budget = 5
//!
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [platform]
//! base_url = "http://127.0.0.1:9000"
//! progress_chat = "-1001234567890"
//! ```
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `FDX_PRIMARY_URI` | replaces `db.primary` |
//! | `FDX_ENDPOINTS` | replaces `db.endpoints` (`name=uri,name=uri`) |
//! | `FDX_PLATFORM_TOKEN` | replaces `platform.token` |
//! | `PORT` | replaces the port of `server.bind` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Hosts operations, shard selection, config, and endpoint 0 files.
    pub primary: String,
    /// Additional file endpoints, addressed by 1-based position.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub uri: String,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retry_budget: default_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl IndexConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_batch_size() -> u64 {
    200
}
fn default_retry_budget() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_call_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PlatformConfig {
    /// Bridge to the chat platform. Required for `serve` and `index`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Chat that receives progress messages; logs only when unset.
    #[serde(default)]
    pub progress_chat: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Apply environment overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(uri) = lookup("FDX_PRIMARY_URI").filter(|s| !s.is_empty()) {
        config.db.primary = uri;
    }

    if let Some(list) = lookup("FDX_ENDPOINTS") {
        config.db.endpoints = parse_endpoint_list(&list)?;
    }

    if let Some(token) = lookup("FDX_PLATFORM_TOKEN").filter(|s| !s.is_empty()) {
        config.platform.token = Some(token);
    }

    if let Some(port) = lookup("PORT").filter(|s| !s.is_empty()) {
        let host = config
            .server
            .bind
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        config.server.bind = format!("{}:{}", host, port);
    }

    Ok(())
}

/// Parse `name=uri,name=uri` into an ordered endpoint list.
pub fn parse_endpoint_list(list: &str) -> Result<Vec<EndpointConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, uri)) if !name.trim().is_empty() && !uri.trim().is_empty() => {
                Ok(EndpointConfig {
                    name: name.trim().to_string(),
                    uri: uri.trim().to_string(),
                })
            }
            _ => bail!("invalid endpoint entry '{}': expected name=uri", entry),
        })
        .collect()
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.primary.trim().is_empty() {
        bail!("db.primary must not be empty");
    }

    let mut seen = HashSet::new();
    for ep in &config.db.endpoints {
        if ep.name == "primary" {
            bail!("endpoint name 'primary' is reserved");
        }
        if ep.uri.trim().is_empty() {
            bail!("endpoint '{}' has an empty uri", ep.name);
        }
        if !seen.insert(ep.name.as_str()) {
            bail!("duplicate endpoint name '{}'", ep.name);
        }
    }

    if config.db.max_connections == 0 {
        bail!("db.max_connections must be > 0");
    }
    if config.index.batch_size == 0 {
        bail!("index.batch_size must be > 0");
    }
    if config.index.retry_budget == 0 {
        bail!("index.retry_budget must be > 0");
    }
    if config.index.call_timeout_secs == 0 {
        bail!("index.call_timeout_secs must be > 0");
    }

    Ok(())
}
