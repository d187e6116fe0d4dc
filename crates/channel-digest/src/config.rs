//! TOML configuration.
//!
//! Every section except `[db]` may be omitted; missing keys fall back to the
//! defaults below. [`load_config`] parses and validates in one step, and the
//! `*_policy()` / `*_params()` helpers convert sections into the core types.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use channel_digest_core::cluster::ClusterParams;
use channel_digest_core::dedup::DedupPolicy;
use channel_digest_core::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// How messages rejected by the content filter are recorded.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Write a `ready` item with relevance 0.
    #[default]
    ScoreZero,
    /// Write a drop-log row and no item.
    DropLog,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default = "default_stale_claim_after_secs")]
    pub stale_claim_after_secs: i64,
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default = "default_digest_language")]
    pub digest_language: String,
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            fan_out: default_fan_out(),
            idle_backoff_ms: default_idle_backoff_ms(),
            stale_claim_after_secs: default_stale_claim_after_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
            min_relevance: default_min_relevance(),
            digest_language: default_digest_language(),
            filter_mode: FilterMode::default(),
            provider_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    16
}
fn default_fan_out() -> usize {
    4
}
fn default_idle_backoff_ms() -> u64 {
    2000
}
fn default_stale_claim_after_secs() -> i64 {
    600
}
fn default_recovery_interval_secs() -> u64 {
    60
}
fn default_min_relevance() -> f64 {
    0.3
}
fn default_digest_language() -> String {
    "en".to_string()
}
fn default_provider_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: i64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff_secs() -> i64 {
    60
}
fn default_max_backoff_secs() -> i64 {
    21_600
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_global_similarity")]
    pub global_similarity: f32,
    #[serde(default = "default_global_window_secs")]
    pub global_window_secs: i64,
    #[serde(default = "default_intra_similarity")]
    pub intra_similarity: f32,
    #[serde(default = "default_intra_window_secs")]
    pub intra_window_secs: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            global_similarity: default_global_similarity(),
            global_window_secs: default_global_window_secs(),
            intra_similarity: default_intra_similarity(),
            intra_window_secs: default_intra_window_secs(),
        }
    }
}

fn default_global_similarity() -> f32 {
    0.92
}
fn default_global_window_secs() -> i64 {
    172_800
}
fn default_intra_similarity() -> f32 {
    0.88
}
fn default_intra_window_secs() -> i64 {
    7_200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_cluster_similarity")]
    pub similarity: f32,
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub require_topic_match: bool,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity: default_cluster_similarity(),
            max_cluster_size: default_max_cluster_size(),
            max_items: default_max_items(),
            require_topic_match: false,
        }
    }
}

fn default_cluster_similarity() -> f32 {
    0.82
}
fn default_max_cluster_size() -> usize {
    12
}
fn default_max_items() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct DigestConfig {
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,
    #[serde(default = "default_retry_grace_secs")]
    pub retry_grace_secs: i64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
    #[serde(default = "default_chat_id")]
    pub chat_id: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            importance_threshold: default_importance_threshold(),
            retry_grace_secs: default_retry_grace_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            chat_id: default_chat_id(),
            language: None,
        }
    }
}

fn default_importance_threshold() -> f64 {
    0.5
}
fn default_retry_grace_secs() -> i64 {
    3_600
}
fn default_lock_ttl_secs() -> i64 {
    600
}
fn default_chat_id() -> String {
    "digest".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FiltersConfig {
    #[serde(default)]
    pub min_length: usize,
    #[serde(default)]
    pub skip_forwards: bool,
    #[serde(default)]
    pub denylist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_http_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_publisher_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            kind: default_publisher_kind(),
            url: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_publisher_kind() -> String {
    "log".to_string()
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
    "127.0.0.1:7341".to_string()
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_backoff: Duration::seconds(self.retry.base_backoff_secs),
            max_backoff: Duration::seconds(self.retry.max_backoff_secs),
        }
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy {
            global_similarity: self.dedup.global_similarity,
            global_window: Duration::seconds(self.dedup.global_window_secs),
            intra_similarity: self.dedup.intra_similarity,
            intra_window: Duration::seconds(self.dedup.intra_window_secs),
        }
    }

    pub fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            similarity: self.clustering.similarity,
            max_cluster_size: self.clustering.max_cluster_size,
            max_items: self.clustering.max_items,
            require_topic_match: self.clustering.require_topic_match,
        }
    }

    /// Stale-claim horizon for `recover_stuck_claims`.
    pub fn stale_claim_after(&self) -> Duration {
        Duration::seconds(self.worker.stale_claim_after_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Worker
    if config.worker.workers == 0 {
        bail!("worker.workers must be >= 1");
    }
    if config.worker.batch_size == 0 {
        bail!("worker.batch_size must be >= 1");
    }
    if config.worker.fan_out == 0 {
        bail!("worker.fan_out must be >= 1");
    }
    if config.worker.stale_claim_after_secs <= 0 {
        bail!("worker.stale_claim_after_secs must be > 0");
    }
    if !(0.0..=1.0).contains(&config.worker.min_relevance) {
        bail!("worker.min_relevance must be in [0.0, 1.0]");
    }

    // Retry
    if config.retry.base_backoff_secs <= 0 {
        bail!("retry.base_backoff_secs must be > 0");
    }
    if config.retry.max_backoff_secs < config.retry.base_backoff_secs {
        bail!("retry.max_backoff_secs must be >= retry.base_backoff_secs");
    }

    // Dedup and clustering
    config.dedup_policy().validate()?;
    config.cluster_params().validate()?;

    // Digest
    if !(0.0..=1.0).contains(&config.digest.importance_threshold) {
        bail!("digest.importance_threshold must be in [0.0, 1.0]");
    }
    if config.digest.retry_grace_secs < 0 {
        bail!("digest.retry_grace_secs must be >= 0");
    }
    if config.digest.lock_ttl_secs <= 0 {
        bail!("digest.lock_ttl_secs must be > 0");
    }
    let publish_timeout = i64::try_from(config.publisher.timeout_secs).unwrap_or(i64::MAX);
    if publish_timeout >= config.digest.lock_ttl_secs {
        bail!(
            "publisher.timeout_secs ({}) must be less than digest.lock_ttl_secs ({})",
            config.publisher.timeout_secs,
            config.digest.lock_ttl_secs
        );
    }

    // Providers
    match config.enrichment.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown enrichment provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.enrichment.is_enabled() && config.enrichment.model.is_none() {
        bail!(
            "enrichment.model must be specified when provider is '{}'",
            config.enrichment.provider
        );
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.publisher.kind.as_str() {
        "log" => {}
        "webhook" => {
            if config.publisher.url.is_none() {
                bail!("publisher.url must be specified when kind is 'webhook'");
            }
        }
        other => bail!("Unknown publisher kind: '{}'. Must be log or webhook.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/digest.sqlite\"\n").unwrap();
        assert_eq!(config.worker.batch_size, 16);
        assert_eq!(config.worker.filter_mode, FilterMode::ScoreZero);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.dedup_policy(), DedupPolicy::default());
        assert_eq!(config.cluster_params(), ClusterParams::default());
        assert_eq!(config.stale_claim_after(), Duration::minutes(10));
        assert_eq!(config.digest.retry_grace_secs, 3_600);
    }

    #[test]
    fn test_filter_mode_parses() {
        let config = parse(
            "[db]\npath = \"x.sqlite\"\n[worker]\nfilter_mode = \"drop_log\"\n",
        )
        .unwrap();
        assert_eq!(config.worker.filter_mode, FilterMode::DropLog);
    }

    #[test]
    fn test_inverted_dedup_thresholds_rejected() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[dedup]\nglobal_similarity = 0.8\nintra_similarity = 0.9\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("global_similarity"));
    }

    #[test]
    fn test_enabled_embedding_requires_dims() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_publish_timeout_must_fit_in_lock_ttl() {
        let base = "[db]\npath = \"x.sqlite\"\n";
        assert!(parse(&format!("{base}[digest]\nlock_ttl_secs = 30\n[publisher]\ntimeout_secs = 30\n")).is_err());
        assert!(parse(&format!("{base}[digest]\nlock_ttl_secs = 60\n[publisher]\ntimeout_secs = 30\n")).is_ok());
    }

    #[test]
    fn test_webhook_requires_url() {
        assert!(parse("[db]\npath = \"x.sqlite\"\n[publisher]\nkind = \"webhook\"\n").is_err());
        assert!(parse("[db]\npath = \"x.sqlite\"\n[publisher]\nkind = \"carrier-pigeon\"\n").is_err());
    }
}
