//! # Channel Digest CLI (`cdg`)
//!
//! The `cdg` binary drives the pipeline: database setup, message ingestion,
//! the enrichment worker pool, per-window clustering and digest
//! publication, and operator tooling.
//!
//! ## Usage
//!
//! ```bash
//! cdg --config ./config/digest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cdg init` | Create the SQLite database and run schema migrations |
//! | `cdg ingest <path>` | Upsert messages from a JSONL file (`-` for stdin) |
//! | `cdg work` | Run the enrichment worker pool until interrupted |
//! | `cdg tick` | Claim and process a single batch |
//! | `cdg recover` | Release claims abandoned by crashed workers |
//! | `cdg cluster` | Rebuild the clusters of a window |
//! | `cdg digest` | Cluster, assemble and publish the digest of a window |
//! | `cdg clear-digest-errors` | Forget failed digest attempts |
//! | `cdg retry <raw_id>` | Requeue a terminally failed message |
//! | `cdg errors` | List terminally failed messages |
//! | `cdg embed pending` | Backfill missing embeddings |
//! | `cdg stats` | Show pipeline statistics |
//! | `cdg serve` | Start the status HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! cdg init --config ./config/digest.toml
//!
//! # Load a day of messages and process them
//! cdg ingest ./dumps/2026-10-01.jsonl
//! cdg work
//!
//! # Publish the digest for an explicit window
//! cdg digest --start 2026-10-01T00:00:00Z --end 2026-10-01T06:00:00Z
//!
//! # Preview the last six hours without publishing
//! cdg digest --last-hours 6 --dry-run
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `channel_digest=info`).

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use channel_digest::{
    config, digest_cmd, embed_cmd, ingest, migrate, server, stats, work_cmd,
};

/// Channel Digest CLI: enrich, deduplicate, cluster and publish channel
/// messages as windowed digests.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "cdg",
    about = "Channel Digest: message enrichment, deduplication and digest publication",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/digest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing database is safe.
    Init,

    /// Ingest messages from a JSONL file.
    ///
    /// Each line is one message keyed by `(channel, source_message_id)`.
    /// Re-ingesting a message updates its content only.
    Ingest {
        /// JSONL file, or `-` for stdin.
        path: PathBuf,

        /// Abort on the first malformed line instead of skipping it.
        #[arg(long)]
        strict: bool,
    },

    /// Run the enrichment worker pool until Ctrl-C.
    Work,

    /// Claim and process one batch, then exit.
    Tick,

    /// Release claims older than `worker.stale_claim_after_secs`.
    Recover,

    /// Rebuild the clusters of a window.
    Cluster {
        #[command(flatten)]
        window: WindowArgs,
    },

    /// Assemble and publish the digest of a window.
    ///
    /// Clusters are rebuilt first unless `--skip-cluster` is given. A
    /// window is published at most once.
    Digest {
        #[command(flatten)]
        window: WindowArgs,

        /// Use the clusters already stored for the window.
        #[arg(long)]
        skip_cluster: bool,

        /// Print the entries as JSON instead of publishing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete failed digest records so their windows can be retried now.
    ClearDigestErrors,

    /// Requeue a terminally failed message.
    Retry {
        /// Raw message id, as listed by `cdg errors`.
        raw_id: i64,
    },

    /// List terminally failed messages.
    Errors {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show pipeline statistics.
    Stats,

    /// Start the status HTTP server on `[server].bind`.
    Serve,
}

#[derive(Args)]
struct WindowArgs {
    /// Window start (RFC 3339, inclusive).
    #[arg(long)]
    start: Option<String>,

    /// Window end (RFC 3339, exclusive).
    #[arg(long)]
    end: Option<String>,

    /// The N whole hours ending at the last hour boundary.
    #[arg(long)]
    last_hours: Option<i64>,
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed relevant ready items that have no vector yet.
    Pending {
        /// Maximum number of items to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (number of texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },
}

fn window_from(args: &WindowArgs) -> anyhow::Result<channel_digest_core::models::Window> {
    digest_cmd::parse_window(
        args.start.as_deref(),
        args.end.as_deref(),
        args.last_hours,
        chrono::Utc::now(),
    )
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("channel_digest=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, strict } => {
            ingest::run_ingest(&cfg, &path, strict).await?;
        }
        Commands::Work => {
            work_cmd::run_work(&cfg, cancel).await?;
        }
        Commands::Tick => {
            work_cmd::run_tick(&cfg, cancel).await?;
        }
        Commands::Recover => {
            work_cmd::run_recover(&cfg).await?;
        }
        Commands::Cluster { window } => {
            let window = window_from(&window)?;
            digest_cmd::run_cluster(&cfg, &window, cancel).await?;
        }
        Commands::Digest {
            window,
            skip_cluster,
            dry_run,
        } => {
            let window = window_from(&window)?;
            digest_cmd::run_digest(&cfg, &window, skip_cluster, dry_run, cancel).await?;
        }
        Commands::ClearDigestErrors => {
            digest_cmd::run_clear_digest_errors(&cfg).await?;
        }
        Commands::Retry { raw_id } => {
            work_cmd::run_retry(&cfg, raw_id).await?;
        }
        Commands::Errors { limit } => {
            stats::run_errors(&cfg, limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg, cancel).await?;
        }
    }

    Ok(())
}
