//! Builder wiring the governance components together.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::Governance;
use crate::admission::CostEstimator;
use crate::backend::{BackendDriver, DriverRegistry};
use crate::budget::UsageMeter;
use crate::circuit::CircuitBreakerManager;
use crate::config::{GovernanceConfig, validate_config};
use crate::events::{ChannelSink, EventBus, EventSink, TimestampedEvent, TracingSink};
use crate::observability::GovernanceMetrics;
use crate::pool::PoolManager;
use crate::tier::{TierRegistry, TierTable};

/// Builder for a [`Governance`] instance.
#[derive(Default)]
pub struct GovernanceBuilder {
    config: GovernanceConfig,
    tiers: Option<TierTable>,
    drivers: DriverRegistry,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl GovernanceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the process-wide tunables.
    pub fn config(mut self, config: GovernanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tier table. Built-in tiers are used otherwise.
    pub fn tiers(mut self, table: TierTable) -> Self {
        self.tiers = Some(table);
        self
    }

    /// Register a backend driver under its backend type.
    pub fn driver(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.drivers.register(driver);
        self
    }

    /// Add an event observer.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log every event through `tracing`.
    pub fn tracing_events(self) -> Self {
        self.sink(Arc::new(TracingSink))
    }

    /// Add a bounded channel sink sized by `event_buffer` and return its receiver.
    ///
    /// Call after [`GovernanceBuilder::config`] so the configured buffer applies.
    pub fn event_channel(self) -> (Self, mpsc::Receiver<TimestampedEvent>) {
        let (sink, rx) = ChannelSink::new(self.config.event_buffer);
        (self.sink(Arc::new(sink)), rx)
    }

    /// Validate the configuration and build.
    pub fn build(self) -> crate::Result<Governance> {
        validate_config(&self.config)?;
        let tiers = TierRegistry::new(self.tiers.unwrap_or_default())?;

        let metrics = Arc::new(GovernanceMetrics::new());
        let events = self
            .sinks
            .into_iter()
            .fold(EventBus::new().with_metrics(Arc::clone(&metrics)), |bus, sink| {
                bus.with_sink(sink)
            });

        let pools = PoolManager::new(
            self.drivers.clone(),
            self.config.pool.clone(),
            Arc::clone(&metrics),
            events.clone(),
        );
        let breakers = CircuitBreakerManager::new(events.clone());
        let estimator = CostEstimator::new(
            self.config.estimator.clone(),
            self.drivers.clone(),
            Arc::clone(&metrics),
        );
        let meter = UsageMeter::new(self.config.rates.clone(), events.clone());

        tracing::debug!(
            backends = ?self.drivers.backend_types(),
            sinks = events.sink_count(),
            "Governance initialised"
        );

        Ok(Governance {
            config: self.config,
            tiers,
            pools,
            breakers,
            estimator,
            meter,
            tenant_gates: Default::default(),
            metrics,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendType, MemoryDriver};
    use crate::tier::{TierConfig, TierName};
    use crate::Error;

    #[test]
    fn test_build_with_defaults() {
        let gov = GovernanceBuilder::new()
            .driver(Arc::new(MemoryDriver::new(BackendType::Relational)))
            .tracing_events()
            .build()
            .unwrap();
        assert_eq!(gov.events().sink_count(), 1);
        assert!(gov.tiers().get(TierName::Enterprise).is_some());
    }

    #[test]
    fn test_invalid_tier_table_fails_build() {
        let mut broken = TierConfig::defaults_for(TierName::Pro);
        broken.min_pool_size = 50;
        let result = GovernanceBuilder::new()
            .tiers(TierTable::builtin().with_tier(TierName::Pro, broken))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_event_channel_uses_configured_buffer() {
        let config = GovernanceConfig {
            event_buffer: 2,
            ..Default::default()
        };
        let (builder, rx) = GovernanceBuilder::new().config(config).event_channel();
        let gov = builder.build().unwrap();
        assert_eq!(gov.events().sink_count(), 1);
        assert_eq!(rx.max_capacity(), 2);
    }
}
