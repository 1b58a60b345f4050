//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and traits
//! for wiring the governance layer into an API tier.
//!
//! # Usage
//!
//! ```rust
//! use tenant_governor::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::ErrorCategory;
pub use crate::Result;

// Facade
pub use crate::Governance;
pub use crate::GovernanceBuilder;
pub use crate::GovernanceStats;

// Backends
pub use crate::backend::{
    BackendConnection, BackendDriver, BackendType, ExecutionOptions, Operation, OperationOutput,
    PlanEstimate, PoolKey,
};

// Policy
pub use crate::tier::{TierConfig, TierName, TierTable};

// Observation
pub use crate::budget::{BillingPeriod, UsagePeriod};
pub use crate::circuit::CircuitState;
pub use crate::events::{EventSink, GovernanceEvent};

// Cancellation
pub use tokio_util::sync::CancellationToken;
