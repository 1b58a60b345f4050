//! Governance configuration: tunables, tier tables, env overrides and validation.
//!
//! ```rust,no_run
//! use tenant_governor::config::{self, EnvOverrides, GovernanceConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EnvOverrides::new().apply(GovernanceConfig::default())?;
//! let tiers = config::load_tier_table("tiers.json").await?;
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod file;
pub mod validator;

pub use env::EnvOverrides;
pub use file::{load_config, load_tier_table};
pub use validator::{validate_config, validate_tier_table};

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::EstimatorConfig;
use crate::backend::BackendType;
use crate::budget::RateTable;
use crate::circuit::BreakerConfig;
use crate::pool::PoolManagerConfig;

/// Errors that can occur in configuration operations
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Key not found
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found
        key: String,
    },

    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Process-wide governance tunables. Per-tier limits live in [`crate::tier::TierTable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub pool: PoolManagerConfig,
    pub estimator: EstimatorConfig,
    /// Replaces the built-in breaker defaults for a backend type.
    pub breaker_overrides: HashMap<BackendType, BreakerConfig>,
    pub rates: RateTable,
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Capacity of the channel behind [`crate::events::ChannelSink`] when the
    /// builder creates one.
    pub event_buffer: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            pool: PoolManagerConfig::default(),
            estimator: EstimatorConfig::default(),
            breaker_overrides: HashMap::new(),
            rates: RateTable::default(),
            sweep_interval: Duration::from_secs(10),
            event_buffer: 1024,
        }
    }
}

impl GovernanceConfig {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Breaker configuration for a backend type, honouring overrides.
    pub fn breaker_for(&self, backend: BackendType) -> BreakerConfig {
        self.breaker_overrides
            .get(&backend)
            .cloned()
            .unwrap_or_else(|| BreakerConfig::for_backend(backend))
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// `Duration` as integer microseconds.
pub(crate) mod duration_us {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NotFound {
            key: "tiers.pro".to_string(),
        };
        assert!(err.to_string().contains("tiers.pro"));

        let err = ConfigError::ValidationErrors(ValidationErrors(vec![
            ConfigError::invalid("a", "bad"),
            ConfigError::invalid("b", "worse"),
        ]));
        assert_eq!(
            err.to_string(),
            "Validation failed: Invalid value for a: bad; Invalid value for b: worse"
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = GovernanceConfig::from_json(
            r#"{"sweep_interval_ms": 2500, "pool": {"max_waiters": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.sweep_interval, Duration::from_millis(2500));
        assert_eq!(config.pool.max_waiters, 8);
        assert_eq!(config.pool.reaper_idle, Duration::from_secs(300));
        assert_eq!(config.event_buffer, 1024);
    }

    #[test]
    fn test_breaker_override() {
        let mut config = GovernanceConfig::default();
        let custom = BreakerConfig::for_backend(BackendType::KeyValue).with_volume_threshold(3);
        config
            .breaker_overrides
            .insert(BackendType::KeyValue, custom.clone());

        assert_eq!(config.breaker_for(BackendType::KeyValue), custom);
        assert_eq!(
            config.breaker_for(BackendType::Relational),
            BreakerConfig::for_backend(BackendType::Relational)
        );
    }
}
