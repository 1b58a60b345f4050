//! Sharded registry of circuit breakers, one per pool key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerConfig, CallPermit, CircuitBreaker, CircuitState};
use super::window::WindowCounts;
use crate::Result;
use crate::backend::PoolKey;
use crate::events::EventBus;

#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    breakers: DashMap<PoolKey, Arc<CircuitBreaker>>,
    events: EventBus,
}

impl CircuitBreakerManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            events,
        }
    }

    /// Look up the key's breaker, creating it on first use.
    pub fn get_or_create(&self, key: &PoolKey, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(pool_key = %key, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(key.clone(), config, self.events.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn permit(&self, key: &PoolKey, config: &BreakerConfig) -> Result<CallPermit> {
        self.get_or_create(key, config).try_acquire(config)
    }

    /// Run `f` through the key's breaker under `config.call_timeout`.
    ///
    /// Fails fast with `CircuitOpen` without calling `f` when the breaker refuses.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &PoolKey,
        config: &BreakerConfig,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.permit(key, config)?;
        permit.run(cancel, f()).await
    }

    pub fn state(&self, key: &PoolKey) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    pub fn counts(&self, key: &PoolKey) -> Option<WindowCounts> {
        self.breakers.get(key).map(|b| b.counts())
    }

    /// Force a breaker closed. Returns `false` if the key has none.
    pub fn reset(&self, key: &PoolKey) -> bool {
        match self.breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &PoolKey) -> bool {
        self.breakers.remove(key).is_some()
    }

    /// Drop breakers idle for at least `idle` with no call in flight.
    pub fn sweep(&self, idle: Duration) -> Vec<PoolKey> {
        let candidates: Vec<PoolKey> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle)
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.breakers
                    .remove_if(key, |_, breaker| {
                        Arc::strong_count(breaker) == 1 && breaker.idle_for() >= idle
                    })
                    .is_some()
            })
            .inspect(|key| tracing::debug!(pool_key = %key, "Reaped idle circuit breaker"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
