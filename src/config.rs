//! Configuration for the middleware components and the daemon.
//!
//! Every component validates its own slice of configuration in its
//! constructor, so a malformed value stops the process at startup instead
//! of surfacing as odd runtime behaviour.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "MAILWISE_CONFIG";

// ── Component configs ───────────────────────────────────────────────

/// Fingerprint cache sizing and similarity policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_size: usize,
    /// Minimum similarity (0..=1) for a fallback hit. `1.0` only matches
    /// digests with identical token sets.
    pub similarity_threshold: f64,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("cache_max_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) || self.similarity_threshold.is_nan() {
            return Err(ConfigError::invalid(
                "similarity_threshold",
                format!("{} is outside 0..=1", self.similarity_threshold),
            ));
        }
        Ok(())
    }
}

/// Quotas for the admission limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub burst_limit: u32,
    pub burst_window: Duration,
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let quotas = [
            ("requests_per_minute", self.requests_per_minute),
            ("requests_per_hour", self.requests_per_hour),
            ("requests_per_day", self.requests_per_day),
            ("burst_limit", self.burst_limit),
        ];
        for (field, value) in quotas {
            if value == 0 {
                return Err(ConfigError::invalid(field, "quota must be at least 1"));
            }
        }
        if self.burst_window.is_zero() {
            return Err(ConfigError::invalid("burst_window_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Batch sizing for the coalescer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::invalid("batch_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// What `analyze` does when admission is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Sleep for the reported wait (if within `max_admission_wait_ms`) and
    /// check once more.
    WaitAndRetry,
    /// Return the denial to the caller immediately.
    Reject,
}

// ── Optimizer config (file format) ──────────────────────────────────

/// Flat, serde-friendly view of every middleware knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub cache_max_size: usize,
    pub similarity_threshold: f64,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub burst_limit: u32,
    pub burst_window_ms: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub admission_policy: AdmissionPolicy,
    pub max_admission_wait_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cache_max_size: 1000,
            similarity_threshold: 0.85,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            requests_per_day: 10_000,
            burst_limit: 10,
            burst_window_ms: 1000,
            batch_size: 10,
            batch_timeout_ms: 100,
            admission_policy: AdmissionPolicy::WaitAndRetry,
            max_admission_wait_ms: 30_000,
        }
    }
}

impl OptimizerConfig {
    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.cache_max_size,
            similarity_threshold: self.similarity_threshold,
        }
    }

    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            requests_per_minute: self.requests_per_minute,
            requests_per_hour: self.requests_per_hour,
            requests_per_day: self.requests_per_day,
            burst_limit: self.burst_limit,
            burst_window: Duration::from_millis(self.burst_window_ms),
        }
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
        }
    }

    pub fn max_admission_wait(&self) -> Duration {
        Duration::from_millis(self.max_admission_wait_ms)
    }

    /// Validate every component slice at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache().validate()?;
        self.limiter().validate()?;
        self.batch().validate()
    }
}

// ── Backend config ──────────────────────────────────────────────────

/// Settings for the OpenAI-compatible analysis backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key. The key
    /// itself never lives in the config file.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "MAILWISE_API_KEY".into(),
            request_timeout_secs: 60,
            max_tokens: 4096,
        }
    }
}

// ── Daemon config ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    cache_db_path: Option<PathBuf>,
    persist_cache: Option<bool>,
    metrics_pulse_secs: Option<u64>,
    optimizer: OptimizerConfig,
    backend: BackendConfig,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    /// `None` runs the cache memory-only.
    pub cache_db_path: Option<PathBuf>,
    pub metrics_pulse_interval: Duration,
    pub optimizer: OptimizerConfig,
    pub backend: BackendConfig,
}

impl Config {
    /// Load from `$MAILWISE_CONFIG`, else `<data_dir>/config.yaml`, else
    /// defaults. The result is validated before it is returned.
    pub fn load() -> Result<Self, ConfigError> {
        let default_dir = default_data_dir();
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_dir.join("config.yaml"));

        let file = if path.exists() {
            read_file_config(&path)?
        } else {
            FileConfig::default()
        };

        let config = Self::resolve(file, default_dir);
        config.optimizer.validate()?;
        Ok(config)
    }

    /// Parse a YAML document directly (used by `load` and tests).
    pub fn from_yaml(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        let config = Self::resolve(file, default_data_dir());
        config.optimizer.validate()?;
        Ok(config)
    }

    fn resolve(file: FileConfig, default_dir: PathBuf) -> Self {
        let data_dir = file.data_dir.unwrap_or(default_dir);
        let persist = file.persist_cache.unwrap_or(true);
        let cache_db_path = persist.then(|| {
            file.cache_db_path
                .clone()
                .unwrap_or_else(|| data_dir.join("cache.db"))
        });

        Self {
            socket_path: file
                .socket_path
                .unwrap_or_else(|| data_dir.join("mailwise.sock")),
            cache_db_path,
            // 15 minutes unless configured
            metrics_pulse_interval: Duration::from_secs(file.metrics_pulse_secs.unwrap_or(15 * 60).max(1)),
            optimizer: file.optimizer,
            backend: file.backend,
            data_dir,
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mailwise")
}
