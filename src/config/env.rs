//! Environment variable overrides.
//!
//! Environment variables are read, never written, since mutating them is not
//! thread-safe. Lookups go through a function so callers can supply any source.

use std::str::FromStr;
use std::time::Duration;

use super::{ConfigError, ConfigResult, GovernanceConfig};

pub const DEFAULT_PREFIX: &str = "GOVERNOR_";

/// Applies `GOVERNOR_*` scalar overrides on top of a [`GovernanceConfig`].
#[derive(Debug, Clone)]
pub struct EnvOverrides {
    prefix: String,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Apply overrides from the process environment.
    pub fn apply(&self, config: GovernanceConfig) -> ConfigResult<GovernanceConfig> {
        self.apply_with(config, |name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_with<F>(&self, mut config: GovernanceConfig, lookup: F) -> ConfigResult<GovernanceConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = self.parse::<usize, _>(&lookup, "POOL_MAX_WAITERS")? {
            config.pool.max_waiters = v;
        }
        if let Some(v) = self.millis(&lookup, "POOL_EVICTION_IDLE_MS")? {
            config.pool.eviction_idle = v;
        }
        if let Some(v) = self.millis(&lookup, "POOL_REAPER_IDLE_MS")? {
            config.pool.reaper_idle = v;
        }
        if let Some(v) = self.millis(&lookup, "ESTIMATION_TIMEOUT_MS")? {
            config.estimator.estimation_timeout = v;
        }
        if let Some(v) = self.millis(&lookup, "SWEEP_INTERVAL_MS")? {
            config.sweep_interval = v;
        }
        if let Some(v) = self.parse::<usize, _>(&lookup, "EVENT_BUFFER")? {
            config.event_buffer = v;
        }
        Ok(config)
    }

    fn parse<T, F>(&self, lookup: &F, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
        F: Fn(&str) -> Option<String>,
    {
        let name = self.env_key(key);
        match lookup(&name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(name, format!("'{}': {}", raw, e))),
        }
    }

    fn millis<F>(&self, lookup: &F, key: &str) -> ConfigResult<Option<Duration>>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(self.parse::<u64, _>(lookup, key)?.map(Duration::from_millis))
    }
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self::new()
    }
}
