//! Shared pipeline context.
//!
//! The rate limiter, cache, progress store, and CLI handle are global
//! concerns, but they travel as explicit dependencies inside a [`Session`]
//! rather than as module-level singletons. Every phase receives the same
//! session; tests build one around a stub CLI and a temp directory.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::bridge::SfCli;
use crate::cache::QueryCache;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::progress::ProgressStore;
use crate::retry::RetryPolicy;

pub struct Session {
    pub config: Config,
    pub cli: SfCli,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    pub cache: Arc<QueryCache>,
    pub progress: Arc<ProgressStore>,
}

impl Session {
    /// Wire up a session from configuration. Fails fast on config problems
    /// (unreadable cache dir, missing CLI) before any remote call is made.
    pub async fn build(config: Config) -> Result<Self> {
        let cli = SfCli::resolve(&config).await?;
        let limiter = Arc::new(RateLimiter::new(&config.rate));
        let retry = RetryPolicy::from_config(&config.retry);
        let cache = Arc::new(QueryCache::open(&config.cache)?);
        std::fs::create_dir_all(&config.output.dir).with_context(|| {
            format!("creating output dir {}", config.output.dir.display())
        })?;
        let progress =
            Arc::new(ProgressStore::open(config.output.dir.join("progress.json"))?);
        Ok(Self {
            config,
            cli,
            limiter,
            retry,
            cache,
            progress,
        })
    }

    /// Assemble a session around an existing CLI handle; used by tests.
    pub fn with_cli(config: Config, cli: SfCli) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(&config.rate));
        let retry = RetryPolicy::from_config(&config.retry);
        let cache = Arc::new(QueryCache::open(&config.cache)?);
        std::fs::create_dir_all(&config.output.dir)?;
        let progress =
            Arc::new(ProgressStore::open(config.output.dir.join("progress.json"))?);
        Ok(Self {
            config,
            cli,
            limiter,
            retry,
            cache,
            progress,
        })
    }
}
