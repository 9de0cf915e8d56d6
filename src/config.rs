use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration, loaded from `harvest.toml` with environment
/// overrides for paths and the org alias. Secrets (`OPENAI_API_KEY`,
/// `PINECONE_API_KEY`, `PINECONE_INDEX_HOST`) are read from the environment
/// by the clients that need them and never appear in the file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub org: OrgConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OrgConfig {
    /// Org alias passed to the CLI with `-o`. Falls back to `SF_ORG_ALIAS`.
    #[serde(default)]
    pub alias: Option<String>,
    /// Explicit path to the `sf` executable; PATH probe otherwise.
    #[serde(default)]
    pub sf_path: Option<PathBuf>,
    /// Subprocess timeout for a single CLI invocation.
    #[serde(default = "default_cli_timeout_secs")]
    pub cli_timeout_secs: u64,
}

fn default_cli_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// Glob patterns for noise objects dropped before describing.
    #[serde(default = "default_noise_globs")]
    pub noise_globs: Vec<String>,
    /// Managed-package namespace prefixes to exclude (`ns` matches `ns__*`).
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            noise_globs: default_noise_globs(),
            exclude_namespaces: Vec::new(),
        }
    }
}

fn default_noise_globs() -> Vec<String> {
    [
        "*__Share",
        "*__Tag",
        "*__History",
        "*__Feed",
        "*ChangeEvent",
        "*__e",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateConfig {
    /// Token bucket capacity (burst).
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Steady-state refill rate, tokens per minute.
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_min_per_minute")]
    pub min_per_minute: u32,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
    /// Consecutive quota errors that trip the quota wall.
    #[serde(default = "default_quota_wall")]
    pub quota_wall_threshold: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            per_minute: default_per_minute(),
            min_per_minute: default_min_per_minute(),
            max_per_minute: default_max_per_minute(),
            quota_wall_threshold: default_quota_wall(),
        }
    }
}

fn default_burst() -> u32 {
    20
}
fn default_per_minute() -> u32 {
    200
}
fn default_min_per_minute() -> u32 {
    50
}
fn default_max_per_minute() -> u32 {
    300
}
fn default_quota_wall() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Backoff floor applied to quota errors.
    #[serde(default = "default_quota_floor_secs")]
    pub quota_floor_secs: u64,
    /// Backoff base applied to timeouts.
    #[serde(default = "default_timeout_base_ms")]
    pub timeout_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_ms: default_base_ms(),
            quota_floor_secs: default_quota_floor_secs(),
            timeout_base_ms: default_timeout_base_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_ms() -> u64 {
    500
}
fn default_quota_floor_secs() -> u64 {
    30
}
fn default_timeout_base_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_true")]
    pub compression: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_hours: default_ttl_hours(),
            compression: true,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}
fn default_ttl_hours() -> u64 {
    24
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_describe_workers")]
    pub describe_workers: usize,
    #[serde(default = "default_enrich_workers")]
    pub enrich_workers: usize,
    #[serde(default = "default_upsert_workers")]
    pub upsert_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            describe_workers: default_describe_workers(),
            enrich_workers: default_enrich_workers(),
            upsert_workers: default_upsert_workers(),
        }
    }
}

fn default_describe_workers() -> usize {
    15
}
fn default_enrich_workers() -> usize {
    15
}
fn default_upsert_workers() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    /// Refs per coalesced query.
    #[serde(default = "default_coalesce_refs")]
    pub coalesce_refs: usize,
    /// Chunks per embedding request.
    #[serde(default = "default_embed_chunks")]
    pub embed_chunks: usize,
    /// Rows sampled per object for fill-rate statistics.
    #[serde(default = "default_stats_sample")]
    pub stats_sample: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            coalesce_refs: default_coalesce_refs(),
            embed_chunks: default_embed_chunks(),
            stats_sample: default_stats_sample(),
        }
    }
}

fn default_coalesce_refs() -> usize {
    200
}
fn default_embed_chunks() -> usize {
    96
}
fn default_stats_sample() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` or `"disabled"`.
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_dims")]
    pub dims: usize,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: default_embed_model(),
            dims: default_embed_dims(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embed_provider() -> String {
    "openai".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embed_dims() -> usize {
    1536
}
fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"pinecone"` or `"disabled"`.
    #[serde(default = "default_index_provider")]
    pub provider: String,
    /// Index namespace; empty string means the default namespace.
    #[serde(default)]
    pub namespace: String,
    /// Chunk id prefix for the corpus.
    #[serde(default = "default_corpus_prefix")]
    pub corpus_prefix: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            namespace: String::new(),
            corpus_prefix: default_corpus_prefix(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl IndexConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_index_provider() -> String {
    "pinecone".to_string()
}
fn default_corpus_prefix() -> String {
    "salesforce_object".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            org: OrgConfig::default(),
            filters: FilterConfig::default(),
            rate: RateConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            pools: PoolConfig::default(),
            batch: BatchConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Resolved org alias: config value, then `SF_ORG_ALIAS`.
    pub fn org_alias(&self) -> Option<String> {
        self.org
            .alias
            .clone()
            .or_else(|| std::env::var("SF_ORG_ALIAS").ok().filter(|s| !s.is_empty()))
    }
}

/// Load and validate configuration. A missing file yields the defaults, so
/// `harvest run` works with nothing but environment variables set.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    // Environment overrides for paths (container-friendly, like the secrets).
    if let Ok(dir) = std::env::var("HARVEST_CACHE_DIR") {
        if !dir.is_empty() {
            config.cache.dir = PathBuf::from(dir);
        }
    }
    if let Ok(dir) = std::env::var("HARVEST_OUTPUT_DIR") {
        if !dir.is_empty() {
            config.output.dir = PathBuf::from(dir);
        }
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.batch.coalesce_refs == 0 {
        anyhow::bail!("batch.coalesce_refs must be > 0");
    }
    if config.batch.embed_chunks == 0 {
        anyhow::bail!("batch.embed_chunks must be > 0");
    }
    // FIELDS(ALL) queries reject LIMIT above 200.
    if config.batch.stats_sample == 0 || config.batch.stats_sample > 200 {
        anyhow::bail!("batch.stats_sample must be in [1, 200]");
    }
    if config.rate.burst == 0 {
        anyhow::bail!("rate.burst must be > 0");
    }
    if config.rate.min_per_minute > config.rate.max_per_minute {
        anyhow::bail!("rate.min_per_minute must be <= rate.max_per_minute");
    }
    if !(config.rate.min_per_minute..=config.rate.max_per_minute)
        .contains(&config.rate.per_minute)
    {
        anyhow::bail!(
            "rate.per_minute must be within [{}, {}]",
            config.rate.min_per_minute,
            config.rate.max_per_minute
        );
    }
    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be > 0");
    }
    match config.embedding.provider.as_str() {
        "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or disabled.",
            other
        ),
    }
    match config.index.provider.as_str() {
        "pinecone" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown index provider: '{}'. Must be pinecone or disabled.",
            other
        ),
    }
    if config.index.corpus_prefix.is_empty() {
        anyhow::bail!("index.corpus_prefix must not be empty");
    }

    Ok(config)
}
