//! # Org Harvest CLI (`harvest`)
//!
//! The `harvest` binary extracts a Salesforce org's schema, automation,
//! security, and usage statistics through the authenticated `sf` CLI, emits
//! a chunked document corpus, and keeps an external vector index in sync
//! with it incrementally.
//!
//! ## Usage
//!
//! ```bash
//! harvest run                              # full pipeline
//! harvest run --phases enumerate,describe  # schema only
//! harvest run --dry-run                    # emit locally, skip upload
//! harvest run --resume                     # continue a quota-walled run
//! harvest cache stats
//! harvest cache clear --data-type stats
//! ```
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 2 | partial: daily quota reached, run again with `--resume` |
//! | 1 | fatal error (configuration, CLI missing, unrecoverable I/O) |

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use org_harvest::cache::QueryCache;
use org_harvest::config;
use org_harvest::pipeline::{self, RunOptions};
use org_harvest::session::Session;

/// Org Harvest: Salesforce schema extraction and vector-corpus ingestion.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Extract a Salesforce org's schema into a searchable vector corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file falls back to
    /// defaults plus environment variables.
    #[arg(long, global = true, default_value = "./harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction pipeline.
    Run {
        /// Comma-separated phase selector: enumerate, describe, stats,
        /// automation, security, history, org-security, emit, upload.
        /// Defaults to all phases.
        #[arg(long, default_value = "all")]
        phases: String,

        /// Resume a previous run: seed each phase from its pending refs.
        #[arg(long)]
        resume: bool,

        /// Emit the corpus locally but skip the vector-index upload.
        #[arg(long)]
        dry_run: bool,

        /// Delete and re-upload every chunk instead of diffing by content hash.
        #[arg(long)]
        no_incremental: bool,

        /// Clear the query cache before running.
        #[arg(long)]
        clear_cache: bool,

        /// Salesforce org alias (overrides config and SF_ORG_ALIAS).
        #[arg(long)]
        org: Option<String>,

        /// Worker pool size for describe and enrich phases.
        #[arg(long)]
        max_workers: Option<usize>,

        /// Cache TTL in hours.
        #[arg(long)]
        cache_ttl_hours: Option<u64>,

        /// Cache directory.
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Output directory.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Chunks per embedding request.
        #[arg(long)]
        embed_batch_size: Option<usize>,

        /// Vector-index namespace for the corpus.
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Inspect or clear the query cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print cache counters and on-disk size.
    Stats,
    /// Remove cache entries, optionally narrowed by data type or age.
    Clear {
        /// Only clear entries of this data type (e.g. `stats`, `describe`).
        #[arg(long)]
        data_type: Option<String>,
        /// Only clear entries older than this many hours.
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let mut config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            phases,
            resume,
            dry_run,
            no_incremental,
            clear_cache,
            org,
            max_workers,
            cache_ttl_hours,
            cache_dir,
            output,
            embed_batch_size,
            namespace,
        } => {
            if let Some(org) = org {
                config.org.alias = Some(org);
            }
            if let Some(workers) = max_workers {
                config.pools.describe_workers = workers;
                config.pools.enrich_workers = workers;
            }
            if let Some(ttl) = cache_ttl_hours {
                config.cache.ttl_hours = ttl;
            }
            if let Some(dir) = cache_dir {
                config.cache.dir = dir;
            }
            if let Some(dir) = output {
                config.output.dir = dir;
            }
            if let Some(batch) = embed_batch_size {
                config.batch.embed_chunks = batch;
            }
            if let Some(ns) = namespace {
                config.index.namespace = ns;
            }

            let options = RunOptions {
                phases: pipeline::parse_phases(&phases)?,
                resume,
                dry_run,
                incremental: !no_incremental,
                clear_cache,
            };

            let session = Session::build(config).await?;
            let progress = session.progress.clone();
            // Interrupts flush progress before exiting; cache and progress
            // writes are atomic renames, so the on-disk state stays whole
            // and the next --resume picks up where this run stopped.
            let code = tokio::select! {
                result = pipeline::run(session, options) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted; flushing progress");
                    progress.flush().await;
                    130
                }
            };
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Cache { action } => {
            let cache = QueryCache::open(&config.cache)?;
            match action {
                CacheAction::Stats => {
                    let stats = cache.stats();
                    println!("cache {}", config.cache.dir.display());
                    println!("  files: {}", stats.files);
                    println!("  size: {} bytes", stats.total_bytes);
                    println!("  ttl: {} hours", config.cache.ttl_hours);
                }
                CacheAction::Clear {
                    data_type,
                    older_than_hours,
                } => {
                    let older_than =
                        older_than_hours.map(|h| std::time::Duration::from_secs(h * 3600));
                    let removed = cache.clear(data_type.as_deref(), older_than);
                    println!("cleared {} cache entries", removed);
                }
            }
        }
    }

    Ok(())
}
