use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{KosError, Result, DEFAULT_KEY_MAX_CHARS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8010,
        }
    }
}

/// Downstream embedding service (Ollama-compatible API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingServiceConfig {
    #[serde(default = "EmbeddingServiceConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "EmbeddingServiceConfig::default_model")]
    pub model: String,
    #[serde(default = "EmbeddingServiceConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Inputs are cut to this many characters before they are sent.
    #[serde(default = "EmbeddingServiceConfig::default_max_input_chars")]
    pub max_input_chars: usize,
}

impl EmbeddingServiceConfig {
    fn default_base_url() -> String {
        "http://localhost:11434".to_string()
    }

    fn default_model() -> String {
        "nomic-embed-text".to_string()
    }

    fn default_timeout_secs() -> u64 {
        5
    }

    fn default_max_input_chars() -> usize {
        8000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EmbeddingServiceConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            timeout_secs: Self::default_timeout_secs(),
            max_input_chars: Self::default_max_input_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "BatchSettings::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "BatchSettings::default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "BatchSettings::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl BatchSettings {
    fn default_batch_size() -> usize {
        10
    }

    fn default_batch_timeout_ms() -> u64 {
        50
    }

    fn default_queue_capacity() -> usize {
        1024
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            batch_timeout_ms: Self::default_batch_timeout_ms(),
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "CacheSettings::default_key_max_chars")]
    pub key_max_chars: usize,
    /// Upper bound on process-cache entries; 0 disables eviction.
    #[serde(default = "CacheSettings::default_max_entries")]
    pub max_entries: usize,
}

impl CacheSettings {
    fn default_key_max_chars() -> usize {
        DEFAULT_KEY_MAX_CHARS
    }

    fn default_max_entries() -> usize {
        10_000
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_max_chars: Self::default_key_max_chars(),
            max_entries: Self::default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "LimiterSettings::default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "LimiterSettings::default_acquire_timeout_secs")]
    pub acquire_timeout_secs: f64,
}

impl LimiterSettings {
    pub const DEFAULT_MAX_CONCURRENT: usize = 5;
    pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: f64 = 30.0;

    fn default_max_concurrent() -> usize {
        Self::DEFAULT_MAX_CONCURRENT
    }

    fn default_acquire_timeout_secs() -> f64 {
        Self::DEFAULT_ACQUIRE_TIMEOUT_SECS
    }

    /// Pool size with the documented fallback for an unset (zero) value.
    pub fn effective_max_concurrent(&self) -> usize {
        if self.max_concurrent == 0 {
            warn!(
                "limiter.max_concurrent is 0, falling back to {}",
                Self::DEFAULT_MAX_CONCURRENT
            );
            Self::DEFAULT_MAX_CONCURRENT
        } else {
            self.max_concurrent
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        let default = Duration::from_secs_f64(Self::DEFAULT_ACQUIRE_TIMEOUT_SECS);
        if self.acquire_timeout_secs > 0.0 {
            // NaN, infinity and values past Duration::MAX all fail here
            Duration::try_from_secs_f64(self.acquire_timeout_secs).unwrap_or(default)
        } else {
            default
        }
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_concurrent: Self::default_max_concurrent(),
            acquire_timeout_secs: Self::default_acquire_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchSettings {
    #[serde(default = "PrefetchSettings::default_enabled")]
    pub enabled: bool,
    /// JSON array of query strings; the built-in list is used when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "PrefetchSettings::default_max_queries")]
    pub max_queries: usize,
    /// Seconds between background reloads; 0 disables the scheduler.
    #[serde(default)]
    pub refresh_interval_secs: u64,
    #[serde(default = "PrefetchSettings::default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl PrefetchSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_queries() -> usize {
        15
    }

    fn default_max_backoff_secs() -> u64 {
        300
    }
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            file: None,
            max_queries: Self::default_max_queries(),
            refresh_interval_secs: 0,
            max_backoff_secs: Self::default_max_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSettings {
    #[serde(default = "HybridSettings::default_vector_weight")]
    pub vector_weight: f32,
    /// Best vector score below which keyword results are blended in.
    #[serde(default = "HybridSettings::default_min_vector_score")]
    pub min_vector_score: f32,
}

impl HybridSettings {
    fn default_vector_weight() -> f32 {
        0.7
    }

    fn default_min_vector_score() -> f32 {
        0.65
    }
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            vector_weight: Self::default_vector_weight(),
            min_vector_score: Self::default_min_vector_score(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "Settings::default_env")]
    pub env: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingServiceConfig,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub limiter: LimiterSettings,
    #[serde(default)]
    pub prefetch: PrefetchSettings,
    #[serde(default)]
    pub hybrid: HybridSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            server: ServerConfig::default(),
            embedding: EmbeddingServiceConfig::default(),
            batch: BatchSettings::default(),
            cache: CacheSettings::default(),
            limiter: LimiterSettings::default(),
            prefetch: PrefetchSettings::default(),
            hybrid: HybridSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    pub const ENV_PREFIX: &'static str = "KOS";

    pub fn default_env() -> String {
        env::var("APP_ENV")
            .ok()
            .or_else(|| env::var("RUST_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    pub fn default_config_dir() -> PathBuf {
        env::var("KOS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    pub fn validate(&self) -> Result<()> {
        ensure(
            !self.server.host.trim().is_empty(),
            "server.host cannot be empty",
        )?;
        ensure(self.server.port > 0, "server.port must be > 0")?;
        ensure(
            !self.embedding.base_url.trim().is_empty(),
            "embedding.base_url cannot be empty",
        )?;
        ensure(
            !self.embedding.model.trim().is_empty(),
            "embedding.model cannot be empty",
        )?;
        ensure(self.batch.batch_size > 0, "batch.batch_size must be > 0")?;
        ensure(
            self.batch.queue_capacity > 0,
            "batch.queue_capacity must be > 0",
        )?;
        ensure(
            self.cache.key_max_chars > 0,
            "cache.key_max_chars must be > 0",
        )?;
        ensure(
            (0.0..=1.0).contains(&self.hybrid.vector_weight),
            "hybrid.vector_weight must be within 0..=1",
        )?;
        Ok(())
    }

    /// Layered load: defaults, `default.*`, `{env}.*`, `local.toml`, then `KOS__*` env vars.
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<Settings> {
        let builder = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.yaml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.json")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.yaml", env_name))).required(false),
            )
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.json", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        if settings.env.is_empty() {
            settings.env = env_name.to_string();
        }
        settings.validate()?;

        info!(
            "Loaded settings for env '{}' from {}",
            env_name,
            config_dir.display()
        );
        Ok(settings)
    }

    pub fn load(config_dir: Option<PathBuf>, env_override: Option<String>) -> Result<Settings> {
        let env_name = env_override.unwrap_or_else(Self::default_env);
        let dir = config_dir.unwrap_or_else(Self::default_config_dir);
        Self::load_from_sources(&dir, &env_name)
    }
}

fn ensure(cond: bool, msg: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(KosError::Config(msg.to_string()))
    }
}
