//! Tiered connection pooling, one pool per [`PoolKey`](crate::backend::PoolKey).
//!
//! Pools are created lazily on first acquire, sized from the tier in force at
//! that moment, and reaped by the sweeper once idle past the reaper threshold.

mod connection_pool;
mod manager;

pub use connection_pool::{ConnectionPool, PooledConnection};
pub use manager::{PoolManager, PoolSweep};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::PoolKey;
use crate::config::duration_ms;
use crate::tier::TierConfig;

/// Process-wide pool tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolManagerConfig {
    /// Callers allowed to queue per pool; beyond this `acquire` fails fast.
    pub max_waiters: usize,
    /// Pool inactivity after which idle connections above the minimum are closed.
    #[serde(rename = "eviction_idle_ms", with = "duration_ms")]
    pub eviction_idle: Duration,
    /// Pool inactivity after which the whole pool is drained and dropped.
    #[serde(rename = "reaper_idle_ms", with = "duration_ms")]
    pub reaper_idle: Duration,
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    pub open_timeout: Duration,
    /// Run a liveness check on idle connections before handing them out.
    pub validate_on_acquire: bool,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            max_waiters: 64,
            eviction_idle: Duration::from_secs(30),
            reaper_idle: Duration::from_secs(300),
            open_timeout: Duration::from_secs(5),
            validate_on_acquire: true,
        }
    }
}

/// Sizing snapshot a pool keeps for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub max_waiters: usize,
    pub open_timeout: Duration,
    pub validate_on_acquire: bool,
}

impl PoolSettings {
    pub fn new(tier: &TierConfig, config: &PoolManagerConfig) -> Self {
        Self {
            min_size: tier.min_pool_size.min(tier.max_pool_size),
            max_size: tier.max_pool_size.max(1),
            acquire_timeout: tier.connection_acquire_timeout,
            max_waiters: config.max_waiters,
            open_timeout: config.open_timeout,
            validate_on_acquire: config.validate_on_acquire,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub key: PoolKey,
    /// Open or opening connections: `active + idle`.
    pub size: usize,
    pub idle: usize,
    /// Checked out, including slots reserved for connections being opened.
    pub active: usize,
    /// Callers queued for a connection.
    pub pending: usize,
    pub max_size: usize,
    pub draining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::TierName;

    #[test]
    fn test_settings_from_tier() {
        let tier = TierConfig::defaults_for(TierName::Starter);
        let settings = PoolSettings::new(&tier, &PoolManagerConfig::default());
        assert_eq!(settings.min_size, 1);
        assert_eq!(settings.max_size, 5);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_waiters, 64);
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let json = serde_json::to_value(PoolManagerConfig::default()).unwrap();
        assert_eq!(json["reaper_idle_ms"], 300_000);
        assert_eq!(json["eviction_idle_ms"], 30_000);
    }
}
