//! Subscription tier policy.
//!
//! A [`TierTable`] is immutable once built. [`TierRegistry`] holds the live
//! table behind an `Arc` and swaps it atomically on reload, so readers always
//! see one complete table.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigResult, duration_ms, validate_tier_table};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Free => "free",
            TierName::Starter => "starter",
            TierName::Pro => "pro",
            TierName::Enterprise => "enterprise",
        }
    }

    pub fn all() -> &'static [TierName] {
        &[
            TierName::Free,
            TierName::Starter,
            TierName::Pro,
            TierName::Enterprise,
        ]
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(TierName::Free),
            "starter" => Ok(TierName::Starter),
            "pro" => Ok(TierName::Pro),
            "enterprise" => Ok(TierName::Enterprise),
            _ => Err(Error::UnknownTier(s.to_string())),
        }
    }
}

/// Limits for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// In-flight operations allowed per tenant; 0 disables the cap.
    pub max_concurrent_per_tenant: usize,
    #[serde(rename = "query_timeout_ms", with = "duration_ms")]
    pub query_timeout: Duration,
    #[serde(rename = "connection_acquire_timeout_ms", with = "duration_ms")]
    pub connection_acquire_timeout: Duration,
    /// Planner cost units above which relational operations are rejected.
    pub cost_threshold: f64,
    pub row_threshold: u64,
    pub monthly_budget_usd: Decimal,
    /// Percent of the monthly budget that fires `budget-warning`.
    pub warning_pct: f64,
    /// Percent of the monthly budget that fires `budget-critical`.
    pub critical_pct: f64,
    /// Block admission once the budget is spent.
    pub hard_limit: bool,
    /// Stricter breaker tolerance than the backend default, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_error_threshold_pct: Option<f64>,
}

impl TierConfig {
    pub fn defaults_for(tier: TierName) -> Self {
        match tier {
            TierName::Free => Self {
                min_pool_size: 0,
                max_pool_size: 2,
                max_concurrent_per_tenant: 5,
                query_timeout: Duration::from_secs(5),
                connection_acquire_timeout: Duration::from_secs(2),
                cost_threshold: 1_000.0,
                row_threshold: 10_000,
                monthly_budget_usd: dec!(10),
                warning_pct: 80.0,
                critical_pct: 95.0,
                hard_limit: true,
                breaker_error_threshold_pct: Some(40.0),
            },
            TierName::Starter => Self {
                min_pool_size: 1,
                max_pool_size: 5,
                max_concurrent_per_tenant: 20,
                query_timeout: Duration::from_secs(15),
                connection_acquire_timeout: Duration::from_secs(5),
                cost_threshold: 10_000.0,
                row_threshold: 100_000,
                monthly_budget_usd: dec!(100),
                warning_pct: 80.0,
                critical_pct: 95.0,
                hard_limit: true,
                breaker_error_threshold_pct: None,
            },
            TierName::Pro => Self {
                min_pool_size: 2,
                max_pool_size: 20,
                max_concurrent_per_tenant: 100,
                query_timeout: Duration::from_secs(30),
                connection_acquire_timeout: Duration::from_secs(10),
                cost_threshold: 100_000.0,
                row_threshold: 1_000_000,
                monthly_budget_usd: dec!(1000),
                warning_pct: 80.0,
                critical_pct: 95.0,
                hard_limit: false,
                breaker_error_threshold_pct: None,
            },
            TierName::Enterprise => Self {
                min_pool_size: 5,
                max_pool_size: 50,
                max_concurrent_per_tenant: 500,
                query_timeout: Duration::from_secs(120),
                connection_acquire_timeout: Duration::from_secs(30),
                cost_threshold: 1_000_000.0,
                row_threshold: 10_000_000,
                monthly_budget_usd: dec!(10000),
                warning_pct: 85.0,
                critical_pct: 95.0,
                hard_limit: false,
                breaker_error_threshold_pct: None,
            },
        }
    }
}

/// A resolved tier: its name plus the limits in force when it was resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicy {
    pub name: TierName,
    pub config: TierConfig,
}

/// Immutable mapping from tier name to limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierTable {
    tiers: HashMap<TierName, TierConfig>,
}

impl TierTable {
    /// Built-in limits for all four tiers.
    pub fn builtin() -> Self {
        Self {
            tiers: TierName::all()
                .iter()
                .map(|&name| (name, TierConfig::defaults_for(name)))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            tiers: HashMap::new(),
        }
    }

    pub fn from_json(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Replace one tier's limits, returning the new table.
    pub fn with_tier(mut self, name: TierName, config: TierConfig) -> Self {
        self.tiers.insert(name, config);
        self
    }

    pub fn get(&self, name: TierName) -> Option<&TierConfig> {
        self.tiers.get(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TierName, &TierConfig)> {
        self.tiers.iter().map(|(name, config)| (*name, config))
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Process-wide live tier table.
#[derive(Debug, Clone)]
pub struct TierRegistry {
    current: Arc<RwLock<Arc<TierTable>>>,
}

impl TierRegistry {
    /// Validate and install the initial table.
    pub fn new(table: TierTable) -> ConfigResult<Self> {
        validate_tier_table(&table)?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(table))),
        })
    }

    pub fn snapshot(&self) -> Arc<TierTable> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Swap in a new table. An invalid table is refused and the current one kept.
    pub fn reload(&self, table: TierTable) -> ConfigResult<()> {
        validate_tier_table(&table)?;
        let table = Arc::new(table);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = table;
        tracing::info!("Tier table reloaded");
        Ok(())
    }

    pub fn get(&self, name: TierName) -> Option<TierConfig> {
        self.snapshot().get(name).cloned()
    }

    /// Resolve a caller-supplied tier string.
    pub fn resolve(&self, tier: &str) -> Result<TierPolicy> {
        let name: TierName = tier.parse()?;
        let config = self
            .get(name)
            .ok_or_else(|| Error::UnknownTier(tier.to_string()))?;
        Ok(TierPolicy { name, config })
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(TierTable::builtin()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_name_parse() {
        assert_eq!("Pro".parse::<TierName>().unwrap(), TierName::Pro);
        assert_eq!(" free ".parse::<TierName>().unwrap(), TierName::Free);
        assert!(matches!(
            "platinum".parse::<TierName>(),
            Err(Error::UnknownTier(_))
        ));
    }

    #[test]
    fn test_builtin_table_is_valid() {
        let table = TierTable::builtin();
        assert_eq!(table.len(), 4);
        assert!(validate_tier_table(&table).is_ok());
        assert_eq!(table.get(TierName::Free).unwrap().max_pool_size, 2);
        assert!(table.get(TierName::Free).unwrap().hard_limit);
        assert!(!table.get(TierName::Pro).unwrap().hard_limit);
    }

    #[test]
    fn test_tier_table_json_round_trip_keys() {
        let json = serde_json::to_string(&TierTable::builtin()).unwrap();
        assert!(json.contains("\"enterprise\""));
        assert!(json.contains("\"query_timeout_ms\""));
        let parsed = TierTable::from_json(&json).unwrap();
        assert_eq!(parsed, TierTable::builtin());
    }

    #[test]
    fn test_registry_resolve_and_reload() {
        let registry = TierRegistry::default();
        let policy = registry.resolve("starter").unwrap();
        assert_eq!(policy.name, TierName::Starter);
        assert_eq!(policy.config.max_pool_size, 5);

        let mut bigger = TierConfig::defaults_for(TierName::Starter);
        bigger.max_pool_size = 8;
        let table = TierTable::builtin().with_tier(TierName::Starter, bigger);
        registry.reload(table).unwrap();

        assert_eq!(registry.resolve("starter").unwrap().config.max_pool_size, 8);
    }

    #[test]
    fn test_registry_refuses_invalid_reload() {
        let registry = TierRegistry::default();
        let mut broken = TierConfig::defaults_for(TierName::Pro);
        broken.min_pool_size = 50;
        broken.max_pool_size = 10;

        let result = registry.reload(TierTable::builtin().with_tier(TierName::Pro, broken));
        assert!(result.is_err());
        assert_eq!(registry.resolve("pro").unwrap().config.max_pool_size, 20);
    }

    #[test]
    fn test_snapshot_outlives_reload() {
        let registry = TierRegistry::default();
        let before = registry.snapshot();

        let mut changed = TierConfig::defaults_for(TierName::Free);
        changed.max_pool_size = 3;
        registry
            .reload(TierTable::builtin().with_tier(TierName::Free, changed))
            .unwrap();

        assert_eq!(before.get(TierName::Free).unwrap().max_pool_size, 2);
        assert_eq!(registry.get(TierName::Free).unwrap().max_pool_size, 3);
    }
}
