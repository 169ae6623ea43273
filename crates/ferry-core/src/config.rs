//! Engine configuration
//!
//! Loaded from TOML; every field is optional and falls back to the defaults
//! below. Durations are whole milliseconds.
//!
//! ```toml
//! [save]
//! debounce_ms = 2000
//! max_retries = 3
//! base_delay_ms = 1000
//! write_timeout_ms = 10000
//!
//! [breaker]
//! failure_threshold = 5
//! timeout_ms = 60000
//!
//! [queue]
//! max_attempts = 3
//! base_delay_ms = 1000
//! ```

use ferry_resilience::{BreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Save controller settings
    pub save: SaveConfig,
    /// Circuit breaker settings
    pub breaker: BreakerSettings,
    /// Operation queue settings
    pub queue: QueueConfig,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With save settings
    #[inline]
    #[must_use]
    pub fn with_save(mut self, save: SaveConfig) -> Self {
        self.save = save;
        self
    }

    /// With breaker settings
    #[inline]
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    /// With queue settings
    #[inline]
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed input
    /// - `ConfigError::Invalid` if a value is out of range
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - see [`EngineConfig::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "breaker.failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.save.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "save.write_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Save controller settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Quiet period after the last edit before saving
    pub debounce_ms: u64,
    /// Retries after the first failed write
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Ceiling on a single write
    pub write_timeout_ms: u64,
}

impl SaveConfig {
    /// Debounce window
    #[inline]
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Write ceiling
    #[inline]
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Retry schedule for writes
    #[inline]
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_retries: 3,
            base_delay_ms: 1000,
            write_timeout_ms: 10_000,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures that open the breaker
    pub failure_threshold: u32,
    /// Cooldown before a trial call
    pub timeout_ms: u64,
}

impl BreakerSettings {
    /// Breaker thresholds
    #[inline]
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new(self.failure_threshold, Duration::from_millis(self.timeout_ms))
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

/// Operation queue settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per operation, first try included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
}

impl QueueConfig {
    /// Retry schedule for operations
    #[inline]
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_attempts(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}
