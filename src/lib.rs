//! # filedex
//!
//! Resumable bulk indexing of chat-hosted files into a sharded set of
//! storage endpoints.
//!
//! An *index operation* walks one source chat from its persisted cursor to
//! the newest message, batch by batch, writing a record per file into
//! whichever endpoint is currently selected. Progress is persisted after
//! every batch, so a crashed or restarted process resumes where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────────────┐
//! │ FileSource   │──▶│ OperationManager │──▶│ StorageRouter       │
//! │ (platform)   │   │ batch/retry/cancel│   │ primary + endpoints │
//! └──────────────┘   └────────┬─────────┘   └─────────┬───────────┘
//!                             │                       │
//!                             ▼                       ▼
//!                      OperationStore           ShardDirectory
//!                      (primary)                (primary)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fdx init                       # create schemas on every endpoint
//! fdx index -1001234567890       # index one chat in the foreground
//! fdx serve                      # resume active operations, serve /healthz
//! fdx shard select 1             # send new writes to endpoint 1
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`db`] | SQLite pool setup |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite storage trait implementations |
//! | [`router`] | Storage endpoint selection |
//! | [`settings`] | Runtime config handle |
//! | [`manager`] | Operation lifecycle |
//! | [`progress`] | Progress messages |
//! | [`platform`] | HTTP file source and notifier |
//! | [`server`] | Liveness endpoint |
//! | [`orchestrator`] | Startup, resumption, shutdown |
//! | [`admin`] | CLI reports and administrative actions |

pub mod admin;
pub mod config;
pub mod db;
pub mod manager;
pub mod migrate;
pub mod orchestrator;
pub mod platform;
pub mod progress;
pub mod router;
pub mod server;
pub mod settings;
pub mod sqlite_store;
