//! Transfer configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.xfer.toml`)
//! 2. Environment variables (with `XFER_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [cache]
//! backend = "redis"
//! host = "cache.internal"
//! port = 6379
//! ttl_secs = 86400
//!
//! [transfer]
//! chunk_size = 10000
//! pause_poll_ms = 2000
//! data_dir = "/var/lib/xfer"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xfer_tasks::RegistryConfig;

use crate::executor::ExecutorConfig;

/// Default configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = ".xfer.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XferConfig {
    /// Shared state store settings.
    pub cache: CacheConfig,

    /// Executor and storage settings.
    pub transfer: TransferConfig,
}

impl XferConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `.xfer.toml` in the working directory
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = var("XFER_CACHE_BACKEND") {
            if let Ok(v) = backend.parse() {
                self.cache.backend = v;
            }
        }

        if let Some(host) = var("XFER_CACHE_HOST") {
            self.cache.host = host;
        }

        if let Some(port) = var("XFER_CACHE_PORT") {
            if let Ok(v) = port.parse() {
                self.cache.port = v;
            }
        }

        if let Some(ttl) = var("XFER_CACHE_TTL") {
            if let Ok(v) = ttl.parse::<u64>() {
                if v > 0 {
                    self.cache.ttl_secs = v;
                }
            }
        }

        if let Some(size) = var("XFER_CHUNK_SIZE") {
            if let Ok(v) = size.parse::<usize>() {
                if v > 0 {
                    self.transfer.chunk_size = v;
                }
            }
        }

        if let Some(poll) = var("XFER_PAUSE_POLL_MS") {
            if let Ok(v) = poll.parse() {
                self.transfer.pause_poll_ms = v;
            }
        }

        if let Some(dir) = var("XFER_DATA_DIR") {
            self.transfer.data_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.chunk_size must be positive".to_string(),
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Registry settings derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_ttl: Duration::from_secs(self.cache.ttl_secs),
            cas_retries: self.transfer.cas_retries,
        }
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            chunk_size: self.transfer.chunk_size,
            pause_poll_interval: Duration::from_millis(self.transfer.pause_poll_ms),
            store_retry_attempts: self.transfer.store_retry_attempts.max(1),
            store_retry_backoff: Duration::from_millis(self.transfer.store_retry_backoff_ms),
        }
    }
}

/// Which state store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local store; tasks are invisible to other processes.
    #[default]
    Memory,
    /// Shared Redis store.
    Redis,
}

impl std::str::FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("unknown cache backend: {s}")),
        }
    }
}

/// State store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend selection: "memory" or "redis".
    pub backend: CacheBackend,

    /// Cache host.
    pub host: String,

    /// Cache port.
    pub port: u16,

    /// Lifetime granted to a task by each write, in seconds.
    pub ttl_secs: u64,

    /// Prefix for every key written to a shared cache.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            host: "127.0.0.1".to_string(),
            port: 6379,
            ttl_secs: 86_400,
            key_prefix: "xfer".to_string(),
        }
    }
}

impl CacheConfig {
    /// Connection URL for the Redis backend.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Executor and storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per unit of upload and download work.
    pub chunk_size: usize,

    /// How often a paused run re-reads its task, in milliseconds.
    pub pause_poll_ms: u64,

    /// Attempts per state store call before the run fails safe.
    pub store_retry_attempts: u32,

    /// First retry delay in milliseconds; doubles on each attempt.
    pub store_retry_backoff_ms: u64,

    /// Compare-and-set retries for a single registry transition.
    pub cas_retries: u32,

    /// Root of the per-owner data directories.
    pub data_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            pause_poll_ms: 2_000,
            store_retry_attempts: 5,
            store_retry_backoff_ms: 100,
            cas_retries: 8,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading configuration file.
    #[error("failed to read config file '{path}': {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },

    /// Parse error in configuration.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The configured backend is not compiled in.
    #[error("cache backend '{0}' requires the `{0}` feature")]
    Unsupported(&'static str),

    /// The state store could not be reached at startup.
    #[error("failed to connect to the state store: {0}")]
    Connect(String),
}
