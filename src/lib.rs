//! # tenant-governor
//!
//! Tenant-aware governance layer for shared database backends.
//!
//! The crate sits between an application tier and a set of relational, document
//! and key-value backends shared by many tenants. Every operation goes through a
//! single entry point that:
//!
//! 1. estimates the operation's cost and rejects it when it exceeds the tenant's tier policy,
//! 2. checks the tenant's monthly budget,
//! 3. acquires a pooled connection for the `(tenant, backend, instance)` key,
//! 4. runs the operation through that key's circuit breaker with a hard timeout,
//! 5. releases the connection and meters the usage.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenant_governor::{BackendType, Governance, MemoryDriver, Operation, PoolKey};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tenant_governor::Error> {
//!     let governance = Governance::builder()
//!         .driver(Arc::new(MemoryDriver::new(BackendType::Relational)))
//!         .build()?;
//!
//!     let key = PoolKey::new("acme", BackendType::Relational, "primary");
//!     let output = governance
//!         .execute(
//!             &CancellationToken::new(),
//!             "acme",
//!             "pro",
//!             &key,
//!             &Operation::sql("SELECT id FROM orders LIMIT 10"),
//!         )
//!         .await?;
//!     println!("{} bytes", output.bytes_transferred());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod admission;
pub mod backend;
pub mod budget;
pub mod circuit;
pub mod config;
pub mod events;
pub mod governance;
pub mod observability;
pub mod pool;
pub mod prelude;
pub mod tier;

use std::time::Duration;

pub use admission::{
    AdmissionDecision, ComplexityClass, CostEstimator, CostShape, CostVerdict, DenylistEntry,
    EstimatorConfig, ExecutionHints, RejectionReason,
};
pub use backend::{
    BackendConnection, BackendDriver, BackendType, DriverRegistry, ExecutionOptions, KeyValueOp,
    MemoryDriver, Operation, OperationOutput, PipelineOp, PipelineStage, PlanBehavior,
    PlanEstimate, PoolKey, RelationalOp, ScriptedOutcome,
};
pub use budget::{
    BackendRates, BillingPeriod, BudgetStatus, RateTable, RateTableBuilder, UsageMeter,
    UsagePeriod,
};
pub use circuit::{
    BreakerConfig, CallPermit, CircuitBreaker, CircuitBreakerManager, CircuitState, WindowCounts,
};
pub use config::{ConfigError, GovernanceConfig};
pub use events::{
    ChannelSink, EventBus, EventSink, GovernanceEvent, TimestampedEvent, TracingSink,
};
pub use governance::{Governance, GovernanceBuilder, GovernanceStats, SweepReport, SweeperHandle};
pub use observability::{GovernanceMetrics, MetricsSummary};
pub use pool::{
    ConnectionPool, PoolManager, PoolManagerConfig, PoolSettings, PoolStats, PoolSweep,
    PooledConnection,
};
pub use tier::{TierConfig, TierName, TierPolicy, TierRegistry, TierTable};

/// Error type for governance operations.
///
/// Policy rejections (cost, budget) are distinguished from transient
/// unavailability (pool, circuit) through [`Error::category`], so callers can
/// choose between a hard error and a "try again shortly" response.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation rejected by cost admission control; no backend was contacted.
    #[error("Admission rejected: {reason}")]
    AdmissionRejected { reason: RejectionReason },

    /// Hard-limit tenant is over its monthly budget.
    #[error("Budget exceeded for tenant {tenant_id}: ${used:.2} used (limit: ${limit:.2})")]
    BudgetExceeded {
        tenant_id: String,
        used: f64,
        limit: f64,
    },

    /// Timed out waiting for a connection slot, or the waiter queue is full.
    #[error("Connection pool {key} exhausted after {:.0}ms", waited.as_secs_f64() * 1000.0)]
    PoolExhausted { key: String, waited: Duration },

    /// Pool is being drained; a fresh pool is created on the next attempt.
    #[error("Connection pool {key} is draining")]
    PoolDraining { key: String },

    /// Circuit breaker is open for this key.
    #[error("Circuit open for {key}{}", match retry_after {
        Some(d) => format!(", retry in {:.1}s", d.as_secs_f64()),
        None => String::new(),
    })]
    CircuitOpen {
        key: String,
        retry_after: Option<Duration>,
    },

    /// Opening a physical connection failed.
    #[error("{backend} backend unreachable: {message}")]
    BackendUnreachable {
        backend: BackendType,
        message: String,
    },

    /// Per-call deadline exceeded.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    OperationTimeout(Duration),

    /// Cost estimation could not be produced. Never fatal to admission.
    #[error("Cost estimation unavailable: {0}")]
    EstimationUnavailable(String),

    /// Tenant already has the maximum number of operations in flight.
    #[error("Tenant {tenant_id} has reached its concurrency limit of {limit}")]
    TenantConcurrencyExceeded { tenant_id: String, limit: usize },

    /// The backend executed the operation and reported a failure.
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: BackendType,
        message: String,
    },

    /// Caller cancelled the request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Tier name is not present in the tier table.
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    /// Request parameters are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Cost or budget policy decided against the operation
    Policy,
    /// Known-unhealthy or saturated state that may clear shortly
    Transient,
    /// Backend failures that count toward the circuit breaker
    Backend,
    /// Caller-initiated cancellation
    Cancelled,
    /// Configuration, tier, or request errors
    Configuration,
    /// Internal errors (IO, JSON, degraded estimation)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::AdmissionRejected { .. } | Error::BudgetExceeded { .. } => ErrorCategory::Policy,

            Error::PoolExhausted { .. }
            | Error::PoolDraining { .. }
            | Error::CircuitOpen { .. }
            | Error::TenantConcurrencyExceeded { .. } => ErrorCategory::Transient,

            Error::BackendUnreachable { .. }
            | Error::OperationTimeout(_)
            | Error::Backend { .. } => ErrorCategory::Backend,

            Error::Cancelled => ErrorCategory::Cancelled,

            Error::UnknownTier(_) | Error::InvalidRequest(_) | Error::Config(_) => {
                ErrorCategory::Configuration
            }

            Error::EstimationUnavailable(_) | Error::Json(_) | Error::Io(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn is_policy_rejection(&self) -> bool {
        self.category() == ErrorCategory::Policy
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Whether this error is reported into a circuit breaker's rolling window.
    pub fn counts_as_breaker_failure(&self) -> bool {
        self.category() == ErrorCategory::Backend
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn unreachable(backend: BackendType, message: impl Into<String>) -> Self {
        Error::BackendUnreachable {
            backend,
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound { key } => {
                Error::Config(format!("Key not found: {}", key))
            }
            config::ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            config::ConfigError::Serialization(e) => Error::Json(e),
            config::ConfigError::Io(e) => Error::Io(e),
            config::ConfigError::ValidationErrors(errors) => Error::Config(errors.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PoolExhausted {
            key: "acme/relational/primary".into(),
            waited: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("acme/relational/primary"));
        assert!(err.to_string().contains("250ms"));

        let err = Error::CircuitOpen {
            key: "acme/key_value/cache".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(err.to_string().contains("retry in 3.0s"));
    }

    #[test]
    fn test_policy_and_transient_are_distinct() {
        let budget = Error::BudgetExceeded {
            tenant_id: "acme".into(),
            used: 12.0,
            limit: 10.0,
        };
        assert!(budget.is_policy_rejection());
        assert!(!budget.is_retryable());

        let circuit = Error::CircuitOpen {
            key: "k".into(),
            retry_after: None,
        };
        assert!(circuit.is_retryable());
        assert!(!circuit.is_policy_rejection());
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(Error::OperationTimeout(Duration::from_secs(1)).counts_as_breaker_failure());
        assert!(Error::unreachable(BackendType::Relational, "refused").counts_as_breaker_failure());
        assert!(!Error::Cancelled.counts_as_breaker_failure());
        assert!(
            !Error::PoolExhausted {
                key: "k".into(),
                waited: Duration::ZERO
            }
            .counts_as_breaker_failure()
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let config_err = config::ConfigError::NotFound {
            key: "tiers.pro".to_string(),
        };
        let err: Error = config_err.into();
        assert!(matches!(err, Error::Config(_)));
    }
}
