//! The governance façade: the single entry point that sequences admission,
//! budget, pooling, circuit breaking and metering for one operation.

mod builder;

pub use builder::GovernanceBuilder;

use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::admission::{CostEstimator, effective_timeout};
use crate::backend::{ExecutionOptions, Operation, OperationOutput, PoolKey};
use crate::budget::{BillingPeriod, BudgetStatus, UsageMeter, UsagePeriod};
use crate::circuit::{CircuitBreakerManager, CircuitState};
use crate::config::{ConfigResult, GovernanceConfig};
use crate::events::EventBus;
use crate::observability::{ExecuteSpan, GovernanceMetrics, sweep_span};
use crate::pool::PoolManager;
use crate::tier::{TierConfig, TierRegistry, TierTable};
use crate::{Error, ErrorCategory, Result};

/// Dashboard view of one pool key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernanceStats {
    pub key: PoolKey,
    pub pool_size: usize,
    pub idle: usize,
    pub active: usize,
    pub pending: usize,
    pub max_size: usize,
    pub breaker_state: CircuitState,
}

/// What one sweep pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub connections_evicted: usize,
    pub pools_reaped: Vec<PoolKey>,
    pub breakers_reaped: Vec<PoolKey>,
    pub tenant_gates_released: usize,
}

/// Per-tenant in-flight cap.
#[derive(Debug)]
struct TenantGate {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl TenantGate {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }
}

#[derive(Debug)]
pub struct Governance {
    config: GovernanceConfig,
    tiers: TierRegistry,
    pools: PoolManager,
    breakers: CircuitBreakerManager,
    estimator: CostEstimator,
    meter: UsageMeter,
    tenant_gates: DashMap<String, TenantGate>,
    metrics: Arc<GovernanceMetrics>,
    events: EventBus,
}

impl Governance {
    pub fn builder() -> GovernanceBuilder {
        GovernanceBuilder::new()
    }

    /// Run `operation` for `tenant_id` at `tier` against the pool `key`.
    ///
    /// Rejections come back as policy errors (admission, budget) or transient
    /// ones (concurrency, pool, circuit) without touching the backend.
    /// Cancelling `cancel` releases every resource held so far.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        tier: &str,
        key: &PoolKey,
        operation: &Operation,
    ) -> Result<OperationOutput> {
        let span = ExecuteSpan::new(tenant_id, tier, key);
        let result = self
            .execute_inner(cancel, tenant_id, tier, key, operation)
            .instrument(span.span().clone())
            .await;

        match &result {
            Ok(_) => span.finish("ok"),
            Err(e) => {
                self.metrics.record_rejection(e);
                span.finish(outcome_label(e));
            }
        }
        result
    }

    async fn execute_inner(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        tier: &str,
        key: &PoolKey,
        operation: &Operation,
    ) -> Result<OperationOutput> {
        if key.tenant_id != tenant_id {
            return Err(Error::InvalidRequest(format!(
                "pool key {} does not belong to tenant {}",
                key, tenant_id
            )));
        }
        if operation.backend_type() != key.backend {
            return Err(Error::InvalidRequest(format!(
                "{} operation sent to {} pool",
                operation.backend_type(),
                key.backend
            )));
        }

        let policy = self.tiers.resolve(tier)?;
        self.meter.assign_tier(tenant_id, &policy.config);
        let _gate = self.tenant_permit(tenant_id, &policy.config)?;

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            verdict = self.estimator.estimate(operation, key.backend) => verdict,
        };
        let hints = self
            .estimator
            .check_admission(&verdict, &policy.config)
            .into_result()?;

        self.meter.check_admission(tenant_id)?;

        let base = self.config.breaker_for(key.backend).with_tier(&policy.config);
        let breaker_config = base.with_call_timeout(effective_timeout(base.call_timeout, &hints));
        let permit = self.breakers.permit(key, &breaker_config)?;

        let mut conn = match self.pools.acquire(key, &policy.config, cancel).await {
            Ok(conn) => conn,
            Err(e) => {
                if e.counts_as_breaker_failure() {
                    permit.record_failure();
                }
                return Err(e);
            }
        };

        let options = ExecutionOptions {
            tenant_id: tenant_id.to_string(),
            timeout: permit.call_timeout(),
            allow_disk_use: hints.allow_disk_use,
        };
        self.metrics.record_operation_start();
        let started = Instant::now();
        let result = permit.run(cancel, conn.execute(operation, &options)).await;
        self.metrics
            .record_operation_end(result.is_ok(), started.elapsed());

        match result {
            Ok(output) => {
                conn.release();
                let cost = self.meter.record_operation(
                    tenant_id,
                    key.backend,
                    output.bytes_transferred(),
                    output.compute_units,
                );
                self.metrics.record_cost(cost);
                tracing::debug!(
                    bytes = output.bytes_transferred(),
                    cost_usd = %cost,
                    "Operation completed"
                );
                Ok(output)
            }
            Err(e) => {
                if matches!(e, Error::OperationTimeout(_) | Error::BackendUnreachable { .. }) {
                    conn.discard().await;
                } else {
                    conn.release();
                }
                tracing::debug!(error = %e, "Operation failed");
                Err(e)
            }
        }
    }

    fn tenant_permit(
        &self,
        tenant_id: &str,
        tier: &TierConfig,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        let limit = tier.max_concurrent_per_tenant;
        if limit == 0 {
            return Ok(None);
        }
        let semaphore = match self.tenant_gates.get(tenant_id) {
            Some(gate) if gate.limit == limit => Arc::clone(&gate.semaphore),
            _ => {
                let gate = self
                    .tenant_gates
                    .entry(tenant_id.to_string())
                    .and_modify(|gate| {
                        if gate.limit != limit {
                            *gate = TenantGate::new(limit);
                        }
                    })
                    .or_insert_with(|| TenantGate::new(limit));
                Arc::clone(&gate.semaphore)
            }
        };
        semaphore
            .try_acquire_owned()
            .map(Some)
            .map_err(|_| Error::TenantConcurrencyExceeded {
                tenant_id: tenant_id.to_string(),
                limit,
            })
    }

    pub fn stats(&self, key: &PoolKey) -> GovernanceStats {
        let pool = self.pools.stats(key);
        GovernanceStats {
            key: key.clone(),
            pool_size: pool.as_ref().map_or(0, |p| p.size),
            idle: pool.as_ref().map_or(0, |p| p.idle),
            active: pool.as_ref().map_or(0, |p| p.active),
            pending: pool.as_ref().map_or(0, |p| p.pending),
            max_size: pool.as_ref().map_or(0, |p| p.max_size),
            breaker_state: self.breakers.state(key).unwrap_or(CircuitState::Closed),
        }
    }

    pub fn usage(&self, tenant_id: &str, period: BillingPeriod) -> Option<UsagePeriod> {
        self.meter.usage(tenant_id, period)
    }

    pub fn budget_status(&self, tenant_id: &str) -> BudgetStatus {
        self.meter.status(tenant_id)
    }

    /// Swap the tier table. Existing pools keep their sizing until reaped.
    pub fn reload_tiers(&self, table: TierTable) -> ConfigResult<()> {
        self.tiers.reload(table)
    }

    /// Drain one pool and forget its breaker.
    pub async fn drain(&self, key: &PoolKey) -> bool {
        let drained = self.pools.drain(key).await;
        self.breakers.remove(key);
        drained
    }

    /// Run one eviction and reaping pass over pools, breakers and tenant gates.
    pub async fn sweep_now(&self) -> SweepReport {
        let span = sweep_span();
        let pools = self.pools.sweep().instrument(span.clone()).await;
        let breakers_reaped = self.breakers.sweep(self.config.pool.reaper_idle);

        let before = self.tenant_gates.len();
        self.tenant_gates
            .retain(|_, gate| Arc::strong_count(&gate.semaphore) > 1);
        let tenant_gates_released = before.saturating_sub(self.tenant_gates.len());

        span.record("pools_evicted", pools.connections_evicted);
        span.record("pools_reaped", pools.reaped.len());
        span.record("breakers_reaped", breakers_reaped.len());

        SweepReport {
            connections_evicted: pools.connections_evicted,
            pools_reaped: pools.reaped,
            breakers_reaped,
            tenant_gates_released,
        }
    }

    /// Spawn the periodic sweeper. It stops when the handle is stopped or
    /// dropped, or when the last `Arc<Governance>` goes away.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let governance: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(governance) = governance.upgrade() else {
                            break;
                        };
                        let report = governance.sweep_now().await;
                        if !report.pools_reaped.is_empty() || !report.breakers_reaped.is_empty() {
                            tracing::info!(
                                pools_reaped = report.pools_reaped.len(),
                                breakers_reaped = report.breakers_reaped.len(),
                                "Sweep reclaimed idle resources"
                            );
                        }
                    }
                }
            }
            tracing::debug!("Sweeper stopped");
        });

        SweeperHandle {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn tiers(&self) -> &TierRegistry {
        &self.tiers
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    pub fn metrics(&self) -> &Arc<GovernanceMetrics> {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

fn outcome_label(error: &Error) -> &'static str {
    match error.category() {
        ErrorCategory::Policy => "rejected",
        ErrorCategory::Transient => "unavailable",
        ErrorCategory::Backend => "backend_error",
        ErrorCategory::Cancelled => "cancelled",
        ErrorCategory::Configuration => "invalid",
        ErrorCategory::Internal => "internal",
    }
}

/// Handle to the background sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweeper and wait for its current pass to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
