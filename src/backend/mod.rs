//! Backend identities and the driver capability the governance layer consumes.
//!
//! Wire protocols live behind [`BackendDriver`] and [`BackendConnection`]; this
//! crate only opens, validates, executes on and closes connections through them.

mod memory;
mod operation;

pub use memory::{MemoryDriver, PlanBehavior, ScriptedOutcome};
pub use operation::{KeyValueOp, Operation, PipelineOp, PipelineStage, RelationalOp};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of backend behind a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// SQL databases with a query planner.
    Relational,
    /// Document stores executing staged aggregation pipelines.
    Document,
    /// Key-value caches.
    KeyValue,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Relational => "relational",
            BackendType::Document => "document",
            BackendType::KeyValue => "key_value",
        }
    }

    pub fn all() -> &'static [BackendType] {
        &[
            BackendType::Relational,
            BackendType::Document,
            BackendType::KeyValue,
        ]
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "relational" | "sql" | "postgres" | "postgresql" => Ok(BackendType::Relational),
            "document" | "mongo" | "mongodb" => Ok(BackendType::Document),
            "key_value" | "keyvalue" | "kv" | "redis" => Ok(BackendType::KeyValue),
            other => Err(Error::InvalidRequest(format!(
                "unknown backend type: {}",
                other
            ))),
        }
    }
}

/// Identifies one logical pool: `(tenant, backend type, backend instance)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub tenant_id: String,
    pub backend: BackendType,
    pub instance_id: String,
}

impl PoolKey {
    pub fn new(
        tenant_id: impl Into<String>,
        backend: BackendType,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            backend,
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.backend, self.instance_id)
    }
}

/// Planner estimate returned by a backend without executing the operation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlanEstimate {
    /// Planner cost units.
    pub total_cost: f64,
    pub rows: u64,
    /// Duration reported by the planner, if it offers one.
    pub duration_hint: Option<Duration>,
}

impl PlanEstimate {
    pub fn new(total_cost: f64, rows: u64) -> Self {
        Self {
            total_cost,
            rows,
            duration_hint: None,
        }
    }

    pub fn with_duration_hint(mut self, hint: Duration) -> Self {
        self.duration_hint = Some(hint);
        self
    }
}

/// Per-call options handed to the driver alongside the operation.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Tenant owning the checked-out connection. Drivers that scope sessions
    /// per tenant set their session variables from this before executing.
    pub tenant_id: String,
    pub timeout: Duration,
    /// `Some(false)` forbids spilling intermediate results to disk.
    pub allow_disk_use: Option<bool>,
}

impl ExecutionOptions {
    pub fn new(tenant_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            timeout,
            allow_disk_use: None,
        }
    }
}

/// Result of a completed operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutput {
    pub payload: Bytes,
    pub rows: u64,
    /// Backend-reported compute units consumed, metered into the usage period.
    pub compute_units: f64,
}

impl OperationOutput {
    pub fn bytes_transferred(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// One physical connection, exclusively owned by a pool or by the caller that
/// checked it out.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Cheap liveness probe run before an idle connection is handed out.
    async fn is_alive(&self) -> bool;

    async fn execute(
        &mut self,
        operation: &Operation,
        options: &ExecutionOptions,
    ) -> Result<OperationOutput>;

    async fn close(&mut self);
}

/// Driver capability for one backend type.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Open a new physical connection for the key.
    async fn open(&self, key: &PoolKey) -> Result<Box<dyn BackendConnection>>;

    /// Ask the backend's planner for a cost estimate without executing.
    ///
    /// `Ok(None)` means the backend has no planner for this operation.
    async fn explain_cost(&self, operation: &Operation) -> Result<Option<PlanEstimate>>;
}

/// Registered drivers, one per backend type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<BackendType, Arc<dyn BackendDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own backend type, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(driver.backend_type(), driver);
    }

    pub fn get(&self, backend: BackendType) -> Result<Arc<dyn BackendDriver>> {
        self.drivers
            .get(&backend)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no driver registered for {}", backend)))
    }

    pub fn contains(&self, backend: BackendType) -> bool {
        self.drivers.contains_key(&backend)
    }

    pub fn backend_types(&self) -> Vec<BackendType> {
        let mut types: Vec<_> = self.drivers.keys().copied().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("backends", &self.backend_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key_display() {
        let key = PoolKey::new("acme", BackendType::KeyValue, "cache-1");
        assert_eq!(key.to_string(), "acme/key_value/cache-1");
    }

    #[test]
    fn test_backend_type_parse() {
        assert_eq!(
            "Postgres".parse::<BackendType>().unwrap(),
            BackendType::Relational
        );
        assert_eq!("redis".parse::<BackendType>().unwrap(), BackendType::KeyValue);
        assert!("cassandra".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MemoryDriver::new(BackendType::Document)));

        assert!(registry.contains(BackendType::Document));
        assert!(registry.get(BackendType::Document).is_ok());
        assert!(matches!(
            registry.get(BackendType::Relational),
            Err(Error::Config(_))
        ));
    }
}
