//! Observability for the governance layer.
//!
//! - **Built-in metrics**: Counter, Gauge, Histogram and the
//!   [`GovernanceMetrics`] registry shared by every subsystem
//! - **Structured spans**: one `governance.execute` span per façade call
//!
//! The library never installs a tracing subscriber; that is left to the host.

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, GovernanceMetrics, Histogram, MetricsSummary};
pub use spans::{ExecuteSpan, sweep_span};
