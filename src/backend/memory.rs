//! In-memory scripted driver.
//!
//! Stands in for a real backend in tests and local wiring. Outcomes of
//! `execute` are scripted per call, planner behaviour is switchable at runtime,
//! and connections can be invalidated or refused to exercise pool validation
//! and circuit breaking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    BackendConnection, BackendDriver, BackendType, ExecutionOptions, Operation, OperationOutput,
    PlanEstimate, PoolKey,
};
use crate::{Error, Result};

/// Outcome of the next `execute` call on any connection of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    Fail,
    /// Never completes; only a timeout or cancellation ends the call.
    Hang,
}

/// How `explain_cost` answers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlanBehavior {
    Unsupported,
    Estimate(PlanEstimate),
    Fail,
    Hang,
}

#[derive(Debug)]
struct MemoryState {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    plan: Mutex<PlanBehavior>,
    refuse_connections: AtomicBool,
    latency_ms: AtomicU64,
    generation: AtomicU64,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    executed: AtomicU64,
}

/// Scripted backend driver. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    backend: BackendType,
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new(backend: BackendType) -> Self {
        Self {
            backend,
            state: Arc::new(MemoryState {
                script: Mutex::new(VecDeque::new()),
                plan: Mutex::new(PlanBehavior::Unsupported),
                refuse_connections: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                executed: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self
    }

    pub fn with_plan(self, estimate: PlanEstimate) -> Self {
        self.set_plan(PlanBehavior::Estimate(estimate));
        self
    }

    /// Queue outcomes for upcoming `execute` calls; unscripted calls succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.state
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(outcomes);
    }

    pub fn set_plan(&self, behavior: PlanBehavior) {
        *self.state.plan.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state
            .refuse_connections
            .store(refuse, Ordering::Relaxed);
    }

    /// Mark every connection opened so far as dead.
    pub fn invalidate_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> u64 {
        self.state.executed.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        self.state
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(ScriptedOutcome::Succeed)
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn backend_type(&self) -> BackendType {
        self.backend
    }

    async fn open(&self, key: &PoolKey) -> Result<Box<dyn BackendConnection>> {
        if self.state.refuse_connections.load(Ordering::Relaxed) {
            return Err(Error::unreachable(
                self.backend,
                format!("connection refused for {}", key),
            ));
        }
        self.state.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            id: self.state.next_id.fetch_add(1, Ordering::Relaxed),
            generation: self.state.generation.load(Ordering::Acquire),
            driver: self.clone(),
            closed: false,
        }))
    }

    async fn explain_cost(&self, operation: &Operation) -> Result<Option<PlanEstimate>> {
        if !matches!(operation, Operation::Relational(_)) {
            return Ok(None);
        }
        let behavior = *self.state.plan.lock().unwrap_or_else(|e| e.into_inner());
        match behavior {
            PlanBehavior::Unsupported => Ok(None),
            PlanBehavior::Estimate(estimate) => Ok(Some(estimate)),
            PlanBehavior::Fail => Err(Error::Backend {
                backend: self.backend,
                message: "planner failed".into(),
            }),
            PlanBehavior::Hang => futures::future::pending().await,
        }
    }
}

#[derive(Debug)]
struct MemoryConnection {
    id: u64,
    generation: u64,
    driver: MemoryDriver,
    closed: bool,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn is_alive(&self) -> bool {
        !self.closed && self.generation == self.driver.state.generation.load(Ordering::Acquire)
    }

    async fn execute(
        &mut self,
        operation: &Operation,
        options: &ExecutionOptions,
    ) -> Result<OperationOutput> {
        let latency = self.driver.state.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        match self.driver.next_outcome() {
            ScriptedOutcome::Succeed => {
                self.driver.state.executed.fetch_add(1, Ordering::Relaxed);
                let payload = format!(
                    "{{\"connection\":{},\"tenant\":\"{}\",\"op\":\"{}\"}}",
                    self.id,
                    options.tenant_id,
                    operation.summary()
                );
                Ok(OperationOutput {
                    payload: Bytes::from(payload),
                    rows: 1,
                    compute_units: 1.0,
                })
            }
            ScriptedOutcome::Fail => Err(Error::Backend {
                backend: self.driver.backend,
                message: format!("scripted failure on connection {}", self.id),
            }),
            ScriptedOutcome::Hang => futures::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.state.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PoolKey {
        PoolKey::new("acme", BackendType::Relational, "primary")
    }

    #[tokio::test]
    async fn test_scripted_outcomes() {
        let driver = MemoryDriver::new(BackendType::Relational);
        driver.script([ScriptedOutcome::Fail, ScriptedOutcome::Succeed]);

        let mut conn = driver.open(&key()).await.unwrap();
        let options = ExecutionOptions::new("acme", Duration::from_secs(1));
        let op = Operation::sql("SELECT 1");

        assert!(conn.execute(&op, &options).await.is_err());
        let output = conn.execute(&op, &options).await.unwrap();
        assert!(output.bytes_transferred() > 0);
        assert_eq!(driver.executed(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_connections() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let conn = driver.open(&key()).await.unwrap();
        assert!(conn.is_alive().await);

        driver.invalidate_connections();
        assert!(!conn.is_alive().await);

        let fresh = driver.open(&key()).await.unwrap();
        assert!(fresh.is_alive().await);
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let driver = MemoryDriver::new(BackendType::Relational);
        driver.refuse_connections(true);
        let result = driver.open(&key()).await;
        assert!(matches!(result, Err(Error::BackendUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_plan_behavior() {
        let driver =
            MemoryDriver::new(BackendType::Relational).with_plan(PlanEstimate::new(42.0, 7));
        let plan = driver.explain_cost(&Operation::sql("SELECT 1")).await.unwrap();
        assert_eq!(plan, Some(PlanEstimate::new(42.0, 7)));

        driver.set_plan(PlanBehavior::Fail);
        assert!(driver.explain_cost(&Operation::sql("SELECT 1")).await.is_err());
    }
}
