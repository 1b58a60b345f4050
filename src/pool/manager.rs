//! Sharded registry of connection pools.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::{ConnectionPool, PoolManagerConfig, PoolSettings, PoolStats, PooledConnection};
use crate::Result;
use crate::backend::{DriverRegistry, PoolKey};
use crate::events::{EventBus, GovernanceEvent};
use crate::observability::GovernanceMetrics;
use crate::tier::TierConfig;

/// What one sweep of the pool registry did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSweep {
    pub connections_evicted: usize,
    pub reaped: Vec<PoolKey>,
}

#[derive(Debug)]
pub struct PoolManager {
    pools: DashMap<PoolKey, Arc<ConnectionPool>>,
    drivers: DriverRegistry,
    config: PoolManagerConfig,
    metrics: Arc<GovernanceMetrics>,
    events: EventBus,
}

impl PoolManager {
    pub fn new(
        drivers: DriverRegistry,
        config: PoolManagerConfig,
        metrics: Arc<GovernanceMetrics>,
        events: EventBus,
    ) -> Self {
        Self {
            pools: DashMap::new(),
            drivers,
            config,
            metrics,
            events,
        }
    }

    pub fn config(&self) -> &PoolManagerConfig {
        &self.config
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Check out a connection for `key`, creating its pool from `tier` on first use.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        tier: &TierConfig,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let pool = self.get_or_create(key, tier)?;
        let started = Instant::now();
        let result = pool.acquire(cancel).await;
        self.metrics
            .acquire_wait_ms
            .observe_duration(started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(pool_key = %key, error = %e, "Connection acquire failed");
        }
        result
    }

    /// Return a connection to its pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    fn get_or_create(&self, key: &PoolKey, tier: &TierConfig) -> Result<Arc<ConnectionPool>> {
        if let Some(existing) = self.pools.get(key) {
            return Ok(Arc::clone(existing.value()));
        }
        let driver = self.drivers.get(key.backend)?;
        let mut created = false;
        let pool = {
            let entry = self.pools.entry(key.clone()).or_insert_with(|| {
                created = true;
                Arc::new(ConnectionPool::new(
                    key.clone(),
                    PoolSettings::new(tier, &self.config),
                    driver,
                    Arc::clone(&self.metrics),
                ))
            });
            Arc::clone(entry.value())
        };
        if created {
            tracing::info!(
                pool_key = %key,
                min_size = pool.settings().min_size,
                max_size = pool.settings().max_size,
                "Created connection pool"
            );
            self.spawn_prewarm(&pool);
        }
        Ok(pool)
    }

    fn spawn_prewarm(&self, pool: &Arc<ConnectionPool>) {
        if pool.settings().min_size == 0 {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(pool);
            handle.spawn(async move {
                let opened = pool.prewarm().await;
                tracing::debug!(pool_key = %pool.key(), opened, "Pre-warmed connection pool");
            });
        }
    }

    /// Remove the key's pool and close its connections. Returns `false` if none existed.
    pub async fn drain(&self, key: &PoolKey) -> bool {
        let Some((_, pool)) = self.pools.remove(key) else {
            return false;
        };
        let closed = pool.drain().await;
        tracing::info!(pool_key = %key, closed, "Drained connection pool");
        true
    }

    pub fn stats(&self, key: &PoolKey) -> Option<PoolStats> {
        self.pools.get(key).map(|pool| pool.stats())
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|entry| entry.value().stats()).collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Evict idle connections above each pool's minimum, then drain and drop
    /// pools unused past the reaper threshold.
    pub async fn sweep(&self) -> PoolSweep {
        let pools: Vec<Arc<ConnectionPool>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut sweep = PoolSweep::default();
        for pool in pools {
            sweep.connections_evicted += pool.evict_idle(self.config.eviction_idle).await;

            if !pool.try_begin_drain(self.config.reaper_idle) {
                continue;
            }
            let removed = self
                .pools
                .remove_if(pool.key(), |_, current| Arc::ptr_eq(current, &pool))
                .is_some();
            pool.drain().await;
            if removed {
                tracing::info!(pool_key = %pool.key(), "Reaped idle connection pool");
                self.events.publish(GovernanceEvent::PoolReaped {
                    key: pool.key().clone(),
                });
                sweep.reaped.push(pool.key().clone());
            }
        }
        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendType, MemoryDriver};
    use crate::events::ChannelSink;
    use crate::tier::TierName;
    use crate::Error;
    use std::time::Duration;

    fn manager_with(driver: &MemoryDriver, config: PoolManagerConfig, events: EventBus) -> PoolManager {
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(driver.clone()));
        PoolManager::new(drivers, config, Arc::new(GovernanceMetrics::new()), events)
    }

    fn key(tenant: &str) -> PoolKey {
        PoolKey::new(tenant, BackendType::Relational, "primary")
    }

    #[tokio::test]
    async fn test_pools_are_per_key() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let manager = manager_with(&driver, PoolManagerConfig::default(), EventBus::new());
        let tier = TierConfig::defaults_for(TierName::Free);
        let cancel = CancellationToken::new();

        let _a = manager.acquire(&key("acme"), &tier, &cancel).await.unwrap();
        let _b = manager.acquire(&key("globex"), &tier, &cancel).await.unwrap();

        assert_eq!(manager.pool_count(), 2);
        assert_eq!(manager.stats(&key("acme")).unwrap().active, 1);
        assert_eq!(manager.stats(&key("acme")).unwrap().max_size, 2);
    }

    #[tokio::test]
    async fn test_missing_driver_is_config_error() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let manager = manager_with(&driver, PoolManagerConfig::default(), EventBus::new());
        let tier = TierConfig::defaults_for(TierName::Free);
        let kv = PoolKey::new("acme", BackendType::KeyValue, "cache");

        let result = manager.acquire(&kv, &tier, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(manager.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_new_pool_prewarms_to_minimum() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let manager = manager_with(&driver, PoolManagerConfig::default(), EventBus::new());
        let tier = TierConfig::defaults_for(TierName::Pro);

        drop(manager.acquire(&key("acme"), &tier, &CancellationToken::new()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = manager.stats(&key("acme")).unwrap();
        assert!(stats.size >= 2, "expected pre-warmed pool, got {:?}", stats);
        assert!(stats.size <= stats.max_size);
    }

    #[tokio::test]
    async fn test_drain_then_recreate() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let manager = manager_with(&driver, PoolManagerConfig::default(), EventBus::new());
        let tier = TierConfig::defaults_for(TierName::Free);
        let cancel = CancellationToken::new();

        drop(manager.acquire(&key("acme"), &tier, &cancel).await.unwrap());
        assert!(manager.drain(&key("acme")).await);
        assert!(!manager.drain(&key("acme")).await);
        assert_eq!(manager.pool_count(), 0);
        assert_eq!(driver.closed(), 1);

        assert!(manager.acquire(&key("acme"), &tier, &cancel).await.is_ok());
        assert_eq!(manager.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_reaps_idle_pools() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let (sink, mut rx) = ChannelSink::new(8);
        let config = PoolManagerConfig {
            reaper_idle: Duration::from_millis(20),
            eviction_idle: Duration::from_millis(20),
            ..Default::default()
        };
        let manager = manager_with(&driver, config, EventBus::new().with_sink(Arc::new(sink)));
        let tier = TierConfig::defaults_for(TierName::Free);
        let cancel = CancellationToken::new();

        drop(manager.acquire(&key("acme"), &tier, &cancel).await.unwrap());
        let held = manager.acquire(&key("globex"), &tier, &cancel).await.unwrap();

        assert!(manager.sweep().await.reaped.is_empty());
        tokio::time::sleep(Duration::from_millis(40)).await;

        let sweep = manager.sweep().await;
        assert_eq!(sweep.reaped, vec![key("acme")]);
        assert_eq!(sweep.connections_evicted, 1);
        assert_eq!(manager.pool_count(), 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, GovernanceEvent::PoolReaped { key: key("acme") });
        drop(held);
    }
}
