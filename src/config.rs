//! Configuration loading and validation.
//!
//! Persona Harness is configured through a single TOML file (default
//! `./config/persona.toml`). Every section except `[db]` is optional and
//! falls back to the defaults documented on each field.
//!
//! ```toml
//! [db]
//! path = "./data/persona.sqlite"
//!
//! [retrieval]
//! k = 10
//! similarity_threshold = 0.7
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//!
//! [rate_limits.tiers.anonymous]
//! window_seconds = 300
//! max_requests = 20
//! burst_allowance = 5
//!
//! [[personalities]]
//! id = "krishna"
//! display_name = "Krishna"
//! domain = "spiritual"
//! ```

use anyhow::{bail, Context, Result};
use persona_harness_core::personality::PersonalityProfile;
use persona_harness_core::ratelimit::{default_tiers, Tier, TierLimits};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub personalities: Vec<PersonalityProfile>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
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
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Upper bound on embedding + search for one request.
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            similarity_threshold: default_similarity_threshold(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

fn default_k() -> usize {
    persona_harness_core::retrieval::DEFAULT_K
}
fn default_similarity_threshold() -> f32 {
    persona_harness_core::retrieval::DEFAULT_SIMILARITY_THRESHOLD
}
fn default_retrieval_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hash`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of an OpenAI-compatible API. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `echo`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Retries after the first attempt.
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: None,
            max_retries: default_generation_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_generation_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    4_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplatesConfig {
    /// Entries in the read-through template cache.
    #[serde(default = "default_template_cache_capacity")]
    pub cache_capacity: usize,
    /// How long a resolved "latest" stays cached before the repository is
    /// asked again. Publishes from this process invalidate immediately.
    #[serde(default = "default_latest_ttl_secs")]
    pub latest_ttl_secs: u64,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_template_cache_capacity(),
            latest_ttl_secs: default_latest_ttl_secs(),
        }
    }
}

fn default_template_cache_capacity() -> usize {
    256
}
fn default_latest_ttl_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Entries kept by the in-process LRU tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Enable the shared tier. The built-in one is process-local; it only
    /// spans instances that are handed the same handle.
    #[serde(default)]
    pub shared: bool,
    /// Entries kept by the shared tier.
    #[serde(default = "default_shared_capacity")]
    pub shared_capacity: usize,
    /// Enable the SQLite-backed durable tier.
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default = "default_tier_timeout_ms")]
    pub tier_timeout_ms: u64,
    /// How long a concurrent caller waits on another caller's computation.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Upper bound for one full computation before it is aborted.
    #[serde(default = "default_producer_timeout_secs")]
    pub producer_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            memory_capacity: default_memory_capacity(),
            shared: false,
            shared_capacity: default_shared_capacity(),
            durable: true,
            tier_timeout_ms: default_tier_timeout_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            producer_timeout_secs: default_producer_timeout_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}
fn default_memory_capacity() -> usize {
    1_024
}
fn default_shared_capacity() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_tier_timeout_ms() -> u64 {
    250
}
fn default_wait_timeout_ms() -> u64 {
    30_000
}
fn default_producer_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_idle_evict_secs")]
    pub idle_evict_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Tiers missing from the file keep their defaults.
    #[serde(default)]
    pub tiers: HashMap<Tier, TierLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            idle_evict_secs: default_idle_evict_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            tiers: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Configured tiers merged over the defaults.
    pub fn effective_tiers(&self) -> HashMap<Tier, TierLimits> {
        let mut tiers = default_tiers();
        for (tier, limits) in &self.tiers {
            tiers.insert(*tier, *limits);
        }
        tiers
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_evict_secs)
    }
}

fn default_idle_evict_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    60
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
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.timeout_ms == 0 {
        bail!("retrieval.timeout_ms must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled()
        && (config.embedding.dims.is_none() || config.embedding.dims == Some(0))
    {
        bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    // Generation
    match config.generation.provider.as_str() {
        "disabled" | "echo" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, echo, openai, or ollama.",
            other
        ),
    }
    if config.generation.backoff_base_ms > config.generation.backoff_max_ms {
        bail!("generation.backoff_base_ms must be <= generation.backoff_max_ms");
    }

    // Cache
    if config.cache.memory_capacity == 0 {
        bail!("cache.memory_capacity must be > 0");
    }
    if config.cache.shared && config.cache.shared_capacity == 0 {
        bail!("cache.shared_capacity must be > 0");
    }
    if config.cache.ttl_secs == 0 {
        bail!("cache.ttl_secs must be > 0");
    }
    if config.templates.cache_capacity == 0 {
        bail!("templates.cache_capacity must be > 0");
    }

    // Rate limits
    for (tier, limits) in &config.rate_limits.tiers {
        if limits.window_seconds == 0 || limits.max_requests == 0 {
            bail!("rate_limits.tiers.{tier}: window_seconds and max_requests must be > 0");
        }
        if limits.burst_allowance == 0 {
            bail!("rate_limits.tiers.{tier}.burst_allowance must be > 0");
        }
    }

    // Personalities
    let mut seen = HashSet::new();
    for profile in &config.personalities {
        if profile.id.trim().is_empty() {
            bail!("personalities: id must not be empty");
        }
        if !seen.insert(profile.id.as_str()) {
            bail!("personalities: duplicate id '{}'", profile.id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_harness_core::personality::Domain;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/p.sqlite\"\n").unwrap();
        assert_eq!(config.retrieval.k, 10);
        assert!((config.retrieval.similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert!(config.personalities.is_empty());
        assert!(!config.cache.shared);
        assert!(config.cache.durable);
        assert_eq!(config.cache.shared_capacity, 10_000);

        let tiers = config.rate_limits.effective_tiers();
        assert_eq!(tiers[&Tier::Anonymous].max_requests, 20);
        assert_eq!(tiers[&Tier::Premium].burst_allowance, 20);
    }

    #[test]
    fn test_tier_override_merges_with_defaults() {
        let config = parse(
            r#"
            [db]
            path = "p.sqlite"

            [rate_limits.tiers.anonymous]
            window_seconds = 60
            max_requests = 6
            burst_allowance = 2
            "#,
        )
        .unwrap();
        let tiers = config.rate_limits.effective_tiers();
        assert_eq!(tiers[&Tier::Anonymous].burst_allowance, 2);
        assert_eq!(tiers[&Tier::Authenticated].max_requests, 50);
    }

    #[test]
    fn test_personalities_parse() {
        let config = parse(
            r#"
            [db]
            path = "p.sqlite"

            [[personalities]]
            id = "krishna"
            display_name = "Krishna"
            domain = "spiritual"

            [[personalities]]
            id = "einstein"
            display_name = "Albert Einstein"
            domain = "scientific"
            template_id = "physics"
            "#,
        )
        .unwrap();
        assert_eq!(config.personalities.len(), 2);
        assert_eq!(config.personalities[0].template_id, "default");
        assert_eq!(config.personalities[1].domain, Domain::Scientific);
    }

    #[test]
    fn test_duplicate_personality_rejected() {
        let err = parse(
            r#"
            [db]
            path = "p.sqlite"
            [[personalities]]
            id = "krishna"
            display_name = "Krishna"
            domain = "spiritual"
            [[personalities]]
            id = "krishna"
            display_name = "Krishna again"
            domain = "spiritual"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate id"));
    }

    #[test]
    fn test_embedding_requires_dims() {
        let err = parse("[db]\npath = \"p\"\n[embedding]\nprovider = \"hash\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_generation_provider() {
        let err = parse("[db]\npath = \"p\"\n[generation]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn test_threshold_range() {
        let err = parse("[db]\npath = \"p\"\n[retrieval]\nsimilarity_threshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }
}
