//! # filedex CLI (`fdx`)
//!
//! ## Usage
//!
//! ```bash
//! fdx --config ./config/fdx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fdx init` | Create schemas on the primary and every endpoint |
//! | `fdx serve` | Resume active operations and serve `/healthz` |
//! | `fdx index <source>` | Index one source chat in the foreground |
//! | `fdx ops list` | List recent operations |
//! | `fdx ops show <id>` | Show one operation |
//! | `fdx ops cancel <id>` | Cancel an operation that is not running here |
//! | `fdx shard show` | List storage endpoints and the current selection |
//! | `fdx shard select <index>` | Send new writes to another endpoint |

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use filedex::{admin, config, orchestrator::Orchestrator};

/// filedex: resumable bulk file indexing over sharded storage.
#[derive(Parser)]
#[command(name = "fdx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fdx.toml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `filedex=debug`.
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Disable console logging.
    #[arg(long, global = true)]
    no_output: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create schemas on every endpoint. Safe to run repeatedly.
    Init,

    /// Resume active operations and serve liveness until interrupted.
    Serve,

    /// Create an index operation for a source chat and run it to the end.
    ///
    /// Ctrl-C stops after the current batch; the operation is left
    /// `cancelled` with its progress persisted.
    Index {
        /// Source chat id.
        source: String,
    },

    /// Inspect and cancel index operations.
    Ops {
        #[command(subcommand)]
        action: OpsAction,
    },

    /// Inspect and switch storage endpoints.
    Shard {
        #[command(subcommand)]
        action: ShardAction,
    },
}

#[derive(Subcommand)]
enum OpsAction {
    /// Most recent operations first.
    List {
        /// Only pending and running operations.
        #[arg(long)]
        active: bool,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show {
        id: String,
    },
    /// Cancel an operation that has no run in another live process.
    Cancel {
        id: String,
    },
}

#[derive(Subcommand)]
enum ShardAction {
    Show,
    /// 0 is the primary; 1.. are the connected endpoints in config order.
    Select {
        index: usize,
    },
}

fn init_logging(filter: &str, no_output: bool) {
    if no_output {
        return;
    }
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.no_output);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            admin::run_init(&cfg).await?;
        }
        Commands::Serve => {
            Orchestrator::start(cfg).await?.serve().await?;
        }
        Commands::Index { source } => {
            let orchestrator = Orchestrator::start(cfg).await?;
            let result = orchestrator.index_source(&source).await;
            orchestrator.shutdown().await;
            let op = result?;
            println!(
                "Operation {} {}: cursor {}, indexed {}, skipped {}, errors {}",
                op.id,
                op.status,
                op.cursor,
                op.counters.indexed,
                op.counters.skipped,
                op.counters.errors
            );
        }
        Commands::Ops { action } => match action {
            OpsAction::List { active, limit } => {
                admin::run_ops_list(&cfg, active, limit).await?;
            }
            OpsAction::Show { id } => {
                admin::run_ops_show(&cfg, &id).await?;
            }
            OpsAction::Cancel { id } => {
                admin::run_ops_cancel(&cfg, &id).await?;
            }
        },
        Commands::Shard { action } => match action {
            ShardAction::Show => {
                admin::run_shard_show(&cfg).await?;
            }
            ShardAction::Select { index } => {
                admin::run_shard_select(&cfg, index).await?;
            }
        },
    }

    Ok(())
}
