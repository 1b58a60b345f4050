//! Configuration validation.
//!
//! Validators collect every violation instead of stopping at the first, so an
//! operator sees the full list in one reload attempt.

use super::{ConfigError, ConfigResult, GovernanceConfig, ValidationErrors};
use crate::tier::{TierConfig, TierName, TierTable};

/// Validate a tier table. All four tiers must be present.
pub fn validate_tier_table(table: &TierTable) -> ConfigResult<()> {
    let mut errors = Vec::new();

    for &name in TierName::all() {
        match table.get(name) {
            Some(config) => collect_tier_errors(name, config, &mut errors),
            None => errors.push(ConfigError::NotFound {
                key: format!("tiers.{}", name),
            }),
        }
    }

    finish(errors)
}

/// Validate process-wide tunables.
pub fn validate_config(config: &GovernanceConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    if config.event_buffer == 0 {
        errors.push(ConfigError::invalid("event_buffer", "must be greater than 0"));
    }
    if config.sweep_interval.is_zero() {
        errors.push(ConfigError::invalid("sweep_interval_ms", "must be greater than 0"));
    }
    if config.pool.open_timeout.is_zero() {
        errors.push(ConfigError::invalid("pool.open_timeout_ms", "must be greater than 0"));
    }

    let estimator = &config.estimator;
    if estimator.estimation_timeout.is_zero() {
        errors.push(ConfigError::invalid(
            "estimator.estimation_timeout_ms",
            "must be greater than 0",
        ));
    }
    if !(estimator.complexity_low <= estimator.complexity_medium
        && estimator.complexity_medium <= estimator.complexity_high)
    {
        errors.push(ConfigError::invalid(
            "estimator.complexity",
            format!(
                "thresholds must be ascending, got {}/{}/{}",
                estimator.complexity_low, estimator.complexity_medium, estimator.complexity_high
            ),
        ));
    }
    let factor = estimator.high_complexity_timeout_factor;
    if !(factor > 0.0 && factor <= 1.0) {
        errors.push(ConfigError::invalid(
            "estimator.high_complexity_timeout_factor",
            format!("{} not in (0, 1]", factor),
        ));
    }

    if let Some(rate) = config.rates.first_negative_rate() {
        errors.push(ConfigError::invalid("rates", format!("{} is negative", rate)));
    }

    for (backend, breaker) in &config.breaker_overrides {
        if let Err(message) = breaker.check() {
            errors.push(ConfigError::invalid(
                format!("breaker_overrides.{}", backend),
                message,
            ));
        }
    }

    finish(errors)
}

fn collect_tier_errors(name: TierName, config: &TierConfig, errors: &mut Vec<ConfigError>) {
    let key = |field: &str| format!("tiers.{}.{}", name, field);

    if config.max_pool_size == 0 {
        errors.push(ConfigError::invalid(key("max_pool_size"), "must be greater than 0"));
    }
    if config.min_pool_size > config.max_pool_size {
        errors.push(ConfigError::invalid(
            key("min_pool_size"),
            format!(
                "{} exceeds max_pool_size {}",
                config.min_pool_size, config.max_pool_size
            ),
        ));
    }
    if config.query_timeout.is_zero() {
        errors.push(ConfigError::invalid(key("query_timeout_ms"), "must be greater than 0"));
    }
    if config.connection_acquire_timeout.is_zero() {
        errors.push(ConfigError::invalid(
            key("connection_acquire_timeout_ms"),
            "must be greater than 0",
        ));
    }
    if config.cost_threshold < 0.0 || config.cost_threshold.is_nan() {
        errors.push(ConfigError::invalid(key("cost_threshold"), "must be non-negative"));
    }
    if config.monthly_budget_usd.is_sign_negative() {
        errors.push(ConfigError::invalid(
            key("monthly_budget_usd"),
            "must be non-negative",
        ));
    }
    if !(config.warning_pct > 0.0
        && config.warning_pct <= config.critical_pct
        && config.critical_pct <= 100.0)
    {
        errors.push(ConfigError::invalid(
            key("warning_pct"),
            format!(
                "require 0 < warning ({}) <= critical ({}) <= 100",
                config.warning_pct, config.critical_pct
            ),
        ));
    }
    if let Some(pct) = config.breaker_error_threshold_pct
        && !(pct > 0.0 && pct <= 100.0)
    {
        errors.push(ConfigError::invalid(
            key("breaker_error_threshold_pct"),
            format!("{} not in (0, 100]", pct),
        ));
    }
}

fn finish(errors: Vec<ConfigError>) -> ConfigResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;

    fn errors_of(result: ConfigResult<()>) -> Vec<ConfigError> {
        match result {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors))) => errors,
            other => panic!("Expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_builtin_passes() {
        assert!(validate_tier_table(&TierTable::builtin()).is_ok());
        assert!(validate_config(&GovernanceConfig::default()).is_ok());
    }

    #[test]
    fn test_missing_tiers_reported() {
        let table = TierTable::empty()
            .with_tier(TierName::Pro, TierConfig::defaults_for(TierName::Pro));
        let errors = errors_of(validate_tier_table(&table));
        assert_eq!(errors.len(), 3);
        assert!(
            errors
                .iter()
                .all(|e| matches!(e, ConfigError::NotFound { .. }))
        );
    }

    #[test]
    fn test_collects_all_violations() {
        let mut broken = TierConfig::defaults_for(TierName::Starter);
        broken.min_pool_size = 10;
        broken.query_timeout = Duration::ZERO;
        broken.monthly_budget_usd = dec!(-1);
        broken.warning_pct = 99.0;
        broken.critical_pct = 90.0;

        let table = TierTable::builtin().with_tier(TierName::Starter, broken);
        let errors = errors_of(validate_tier_table(&table));
        assert_eq!(errors.len(), 4);

        let message = ConfigError::ValidationErrors(ValidationErrors(errors)).to_string();
        assert!(message.contains("tiers.starter.min_pool_size"));
        assert!(message.contains("tiers.starter.monthly_budget_usd"));
    }

    #[test]
    fn test_config_thresholds_must_ascend() {
        let mut config = GovernanceConfig::default();
        config.estimator.complexity_medium = 30;
        config.event_buffer = 0;

        let errors = errors_of(validate_config(&config));
        assert_eq!(errors.len(), 2);
    }
}
