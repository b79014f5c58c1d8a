use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    batch::{
        BatchFetcher, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_MAX_BATCH_SIZE,
        DEFAULT_MAX_CONCURRENT_BATCHES, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, RetryPolicy,
    },
    cache::{CacheSettings, MAX_DAYS_AHEAD},
    error::Error,
    layer::DEFAULT_MAX_GRID_POINTS,
    provider::{
        SourceKind,
        open_meteo::{FORECAST_URL, MARINE_URL},
        synthetic::DEFAULT_SEED,
    },
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One upstream HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl EndpointConfig {
    fn with_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Use the day-bucketed cache for routes and layers.
    pub enabled: bool,
    pub max_days_ahead: u32,
    pub cleanup_interval_secs: u64,
    /// Lifetime of whole point responses.
    pub response_ttl_secs: u64,
    pub use_response_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_days_ahead: 7,
            cleanup_interval_secs: 3600,
            response_ttl_secs: 3600,
            use_response_cache: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_retries: u32,
    /// Base delay; retry n waits n times this.
    pub retry_delay_ms: u64,
    pub max_concurrent_batches: usize,
    pub call_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_concurrent_batches: DEFAULT_MAX_CONCURRENT_BATCHES,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub max_points: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_MAX_GRID_POINTS,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// source = "synthetic"
///
/// [cache]
/// max_days_ahead = 5
///
/// [batch]
/// max_batch_size = 50
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// "live" or "synthetic".
    pub source: String,
    pub synthetic_seed: u64,
    pub default_include_currents: bool,
    pub marine: EndpointConfig,
    pub atmosphere: EndpointConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub grid: GridConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceKind::Live.as_str().to_string(),
            synthetic_seed: DEFAULT_SEED,
            default_include_currents: true,
            marine: EndpointConfig::with_url(MARINE_URL),
            atmosphere: EndpointConfig::with_url(FORECAST_URL),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            grid: GridConfig::default(),
        }
    }
}

impl Config {
    /// Return the configured source as a strongly-typed SourceKind.
    pub fn source_kind(&self) -> Result<SourceKind, Error> {
        SourceKind::try_from(self.source.as_str())
    }

    pub fn set_source(&mut self, kind: SourceKind) {
        self.source = kind.as_str().to_string();
    }

    /// Reject settings that would make the aggregator unusable.
    pub fn validate(&self) -> Result<(), Error> {
        self.source_kind()?;
        if self.batch.max_batch_size == 0 {
            return Err(Error::Config("batch.max_batch_size must be at least 1".into()));
        }
        if self.batch.max_concurrent_batches == 0 {
            return Err(Error::Config("batch.max_concurrent_batches must be at least 1".into()));
        }
        if self.grid.max_points == 0 {
            return Err(Error::Config("grid.max_points must be at least 1".into()));
        }
        if self.cache.max_days_ahead > MAX_DAYS_AHEAD {
            return Err(Error::Config(format!(
                "cache.max_days_ahead must be at most {MAX_DAYS_AHEAD}"
            )));
        }
        if self.marine.timeout_secs == 0 || self.atmosphere.timeout_secs == 0 {
            return Err(Error::Config("endpoint timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            max_days_ahead: self.cache.max_days_ahead,
            cleanup_interval: Duration::from_secs(self.cache.cleanup_interval_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.batch.max_retries,
            base_delay: Duration::from_millis(self.batch.retry_delay_ms),
            call_timeout: (self.batch.call_timeout_secs > 0)
                .then(|| Duration::from_secs(self.batch.call_timeout_secs)),
        }
    }

    pub fn batch_fetcher(&self) -> BatchFetcher {
        BatchFetcher::new(
            self.batch.max_batch_size,
            self.batch.max_concurrent_batches,
            self.retry_policy(),
        )
    }

    /// TTL of the whole-response cache, or `None` when it is switched off.
    pub fn response_ttl(&self) -> Option<Duration> {
        self.cache
            .use_response_cache
            .then(|| Duration::from_secs(self.cache.response_ttl_secs))
    }

    /// Load config from disk, or return the default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    /// Load config from an explicit path; a missing file yields the default.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "marine-weather", "marine-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }
}
