//! Governance events and their observers.
//!
//! Breaker transitions and budget threshold crossings are published through an
//! [`EventBus`] to any number of [`EventSink`]s. Sinks are called inline on the
//! publishing task, so they must not block; [`ChannelSink`] drops events when
//! its bounded channel is full instead of waiting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::backend::PoolKey;
use crate::budget::BillingPeriod;
use crate::observability::GovernanceMetrics;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GovernanceEvent {
    CircuitOpened {
        key: PoolKey,
        failure_pct: f64,
        samples: u64,
    },
    CircuitHalfOpen {
        key: PoolKey,
    },
    CircuitClosed {
        key: PoolKey,
    },
    BudgetWarning {
        tenant_id: String,
        period: BillingPeriod,
        utilization_pct: f64,
    },
    BudgetCritical {
        tenant_id: String,
        period: BillingPeriod,
        utilization_pct: f64,
    },
    BudgetExceeded {
        tenant_id: String,
        period: BillingPeriod,
        utilization_pct: f64,
    },
    PoolReaped {
        key: PoolKey,
    },
}

impl GovernanceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpened { .. } => "circuit-opened",
            Self::CircuitHalfOpen { .. } => "circuit-half-open",
            Self::CircuitClosed { .. } => "circuit-closed",
            Self::BudgetWarning { .. } => "budget-warning",
            Self::BudgetCritical { .. } => "budget-critical",
            Self::BudgetExceeded { .. } => "budget-exceeded",
            Self::PoolReaped { .. } => "pool-reaped",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            Self::CircuitOpened { key, .. }
            | Self::CircuitHalfOpen { key }
            | Self::CircuitClosed { key }
            | Self::PoolReaped { key } => &key.tenant_id,
            Self::BudgetWarning { tenant_id, .. }
            | Self::BudgetCritical { tenant_id, .. }
            | Self::BudgetExceeded { tenant_id, .. } => tenant_id,
        }
    }
}

impl fmt::Display for GovernanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpened {
                key,
                failure_pct,
                samples,
            } => write!(
                f,
                "{} for {} ({:.1}% of {} calls failed)",
                self.name(),
                key,
                failure_pct,
                samples
            ),
            Self::CircuitHalfOpen { key }
            | Self::CircuitClosed { key }
            | Self::PoolReaped { key } => write!(f, "{} for {}", self.name(), key),
            Self::BudgetWarning {
                tenant_id,
                period,
                utilization_pct,
            }
            | Self::BudgetCritical {
                tenant_id,
                period,
                utilization_pct,
            }
            | Self::BudgetExceeded {
                tenant_id,
                period,
                utilization_pct,
            } => write!(
                f,
                "{} for {} in {} ({:.1}% used)",
                self.name(),
                tenant_id,
                period,
                utilization_pct
            ),
        }
    }
}

/// Observer of governance events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Returns `false` when the sink dropped it.
    fn emit(&self, event: &GovernanceEvent) -> bool;
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GovernanceEvent) -> bool {
        match event {
            GovernanceEvent::CircuitOpened { .. }
            | GovernanceEvent::BudgetWarning { .. }
            | GovernanceEvent::BudgetCritical { .. }
            | GovernanceEvent::BudgetExceeded { .. } => {
                tracing::warn!(event = event.name(), tenant_id = event.tenant_id(), "{}", event)
            }
            _ => tracing::info!(event = event.name(), tenant_id = event.tenant_id(), "{}", event),
        }
        true
    }
}

/// Event paired with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GovernanceEvent,
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TimestampedEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TimestampedEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &GovernanceEvent) -> bool {
        let stamped = TimestampedEvent {
            at: Utc::now(),
            event: event.clone(),
        };
        match self.tx.try_send(stamped) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(event = event.name(), "Event channel full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Fan-out to every registered sink.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: Option<Arc<GovernanceMetrics>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<GovernanceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn publish(&self, event: GovernanceEvent) {
        for sink in &self.sinks {
            if !sink.emit(&event)
                && let Some(metrics) = &self.metrics
            {
                metrics.events_dropped.inc();
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
