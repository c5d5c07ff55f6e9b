//! Runtime configuration.
//!
//! Every field has a default (1000 entries, one-day TTL, 1 ms gate timeout,
//! three fallback retries), so an empty JSON object is a valid configuration:
//!
//! ```
//! use dogpile::config::StampedeConfig;
//!
//! let config = StampedeConfig::from_json_str("{}").unwrap();
//! assert_eq!(config.cache.capacity, 1000);
//! assert_eq!(config.gate.timeout_ms, 1);
//!
//! let config = StampedeConfig::from_json_str(r#"{"gate": {"shards": 1}}"#).unwrap();
//! assert_eq!(config.gate.shards, 1);
//! ```

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StampedeConfig {
    pub cache: CacheConfig,
    pub gate: GateConfig,
    pub fallback: FallbackConfig,
    pub server: ServerConfig,
}

/// Sizing and expiry of the marker cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of entries before least-recently-used eviction.
    pub capacity: usize,
    /// Seconds an entry stays valid after being written.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_secs: 86_400,
        }
    }
}

/// Fast-path gate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// How long a caller waits to become the fast-path holder before falling back.
    pub timeout_ms: u64,
    /// Number of independent locks keys are hashed onto. `1` serializes every key.
    pub shards: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1,
            shards: 64,
        }
    }
}

/// Bounded retry window for callers that did not get the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    /// Cache checks before the caller performs the lookup itself.
    pub retries: u32,
    /// Upper bound on each wait between checks.
    pub delay_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_ms: 5,
        }
    }
}

/// HTTP front settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
        }
    }
}

impl StampedeConfig {
    /// Parses and validates configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks the values serde cannot express as types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.capacity",
                reason: "must be greater than zero",
            });
        }
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.ttl_secs",
                reason: "must be greater than zero",
            });
        }
        if self.gate.shards == 0 {
            return Err(ConfigError::Invalid {
                field: "gate.shards",
                reason: "must be greater than zero",
            });
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.bind",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

impl CacheConfig {
    /// Capacity as the non-zero type the cache requires.
    pub fn capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.capacity).ok_or(ConfigError::Invalid {
            field: "cache.capacity",
            reason: "must be greater than zero",
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl GateConfig {
    /// Shard count as the non-zero type the gate requires.
    pub fn shards(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.shards).ok_or(ConfigError::Invalid {
            field: "gate.shards",
            reason: "must be greater than zero",
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl FallbackConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
