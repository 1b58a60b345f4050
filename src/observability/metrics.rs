//! Atomic in-process metrics for the governance layer.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::budget::{cost_from_scaled, cost_to_scaled};

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at `u64::MAX`.
    pub fn add(&self, n: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_add(n)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum in the observed unit. Stored internally scaled by 1000.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum_ms() / n as f64,
        }
    }

    /// Per-bucket counts; the last entry counts observations above every bound.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Counters and histograms for every governance decision point.
#[derive(Debug)]
pub struct GovernanceMetrics {
    pub operations_total: Counter,
    pub operations_succeeded: Counter,
    pub operations_failed: Counter,
    pub operations_in_flight: Gauge,
    pub admission_rejections: Counter,
    pub budget_rejections: Counter,
    pub circuit_rejections: Counter,
    pub concurrency_rejections: Counter,
    pub pool_exhausted: Counter,
    pub estimation_unavailable: Counter,
    pub connections_opened: Counter,
    pub connections_closed: Counter,
    pub events_dropped: Counter,
    pub acquire_wait_ms: Histogram,
    pub execute_latency_ms: Histogram,
    pub cost_total_picos: Counter,
}

impl GovernanceMetrics {
    pub fn new() -> Self {
        Self {
            operations_total: Counter::new(),
            operations_succeeded: Counter::new(),
            operations_failed: Counter::new(),
            operations_in_flight: Gauge::new(),
            admission_rejections: Counter::new(),
            budget_rejections: Counter::new(),
            circuit_rejections: Counter::new(),
            concurrency_rejections: Counter::new(),
            pool_exhausted: Counter::new(),
            estimation_unavailable: Counter::new(),
            connections_opened: Counter::new(),
            connections_closed: Counter::new(),
            events_dropped: Counter::new(),
            acquire_wait_ms: Histogram::default_latency(),
            execute_latency_ms: Histogram::default_latency(),
            cost_total_picos: Counter::new(),
        }
    }

    pub fn record_operation_start(&self) {
        self.operations_total.inc();
        self.operations_in_flight.inc();
    }

    pub fn record_operation_end(&self, success: bool, latency: Duration) {
        self.operations_in_flight.dec();
        self.execute_latency_ms.observe_duration(latency);
        if success {
            self.operations_succeeded.inc();
        } else {
            self.operations_failed.inc();
        }
    }

    /// Count a rejection against the matching counter.
    pub fn record_rejection(&self, error: &crate::Error) {
        use crate::Error;
        match error {
            Error::AdmissionRejected { .. } => self.admission_rejections.inc(),
            Error::BudgetExceeded { .. } => self.budget_rejections.inc(),
            Error::CircuitOpen { .. } => self.circuit_rejections.inc(),
            Error::TenantConcurrencyExceeded { .. } => self.concurrency_rejections.inc(),
            Error::PoolExhausted { .. } => self.pool_exhausted.inc(),
            _ => {}
        }
    }

    pub fn record_cost(&self, cost_usd: Decimal) {
        self.cost_total_picos.add(cost_to_scaled(cost_usd));
    }

    pub fn total_cost_usd(&self) -> Decimal {
        cost_from_scaled(self.cost_total_picos.get())
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_metrics(self)
    }
}

impl Default for GovernanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`GovernanceMetrics`] for export or display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub operations_total: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operations_in_flight: i64,
    pub admission_rejections: u64,
    pub budget_rejections: u64,
    pub circuit_rejections: u64,
    pub concurrency_rejections: u64,
    pub pool_exhausted: u64,
    pub estimation_unavailable: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub events_dropped: u64,
    pub avg_acquire_wait_ms: f64,
    pub avg_execute_latency_ms: f64,
    pub total_cost_usd: Decimal,
}

impl MetricsSummary {
    pub fn from_metrics(metrics: &GovernanceMetrics) -> Self {
        Self {
            operations_total: metrics.operations_total.get(),
            operations_succeeded: metrics.operations_succeeded.get(),
            operations_failed: metrics.operations_failed.get(),
            operations_in_flight: metrics.operations_in_flight.get(),
            admission_rejections: metrics.admission_rejections.get(),
            budget_rejections: metrics.budget_rejections.get(),
            circuit_rejections: metrics.circuit_rejections.get(),
            concurrency_rejections: metrics.concurrency_rejections.get(),
            pool_exhausted: metrics.pool_exhausted.get(),
            estimation_unavailable: metrics.estimation_unavailable.get(),
            connections_opened: metrics.connections_opened.get(),
            connections_closed: metrics.connections_closed.get(),
            events_dropped: metrics.events_dropped.get(),
            avg_acquire_wait_ms: metrics.acquire_wait_ms.mean(),
            avg_execute_latency_ms: metrics.execute_latency_ms.mean(),
            total_cost_usd: metrics.total_cost_usd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0]);
        hist.observe(5.0);
        hist.observe(25.0);
        hist.observe(75.0);
        hist.observe(150.0);
        assert_eq!(hist.count(), 4);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1, 1]);
        assert!((hist.mean() - 63.75).abs() < 1e-9);
    }

    #[test]
    fn test_rejections_are_classified() {
        let metrics = GovernanceMetrics::new();
        metrics.record_rejection(&Error::CircuitOpen {
            key: "k".into(),
            retry_after: None,
        });
        metrics.record_rejection(&Error::PoolExhausted {
            key: "k".into(),
            waited: Duration::ZERO,
        });
        metrics.record_rejection(&Error::Cancelled);

        let summary = metrics.summary();
        assert_eq!(summary.circuit_rejections, 1);
        assert_eq!(summary.pool_exhausted, 1);
        assert_eq!(summary.admission_rejections, 0);
    }

    #[test]
    fn test_cost_total_keeps_sub_micro_amounts() {
        let metrics = GovernanceMetrics::new();
        metrics.record_cost(dec!(0.000125));
        metrics.record_cost(dec!(1.5));
        for _ in 0..10 {
            metrics.record_cost(dec!(0.0000004));
        }
        assert_eq!(metrics.total_cost_usd(), dec!(1.500129));
    }

    #[test]
    fn test_operation_lifecycle() {
        let metrics = GovernanceMetrics::new();
        metrics.record_operation_start();
        assert_eq!(metrics.operations_in_flight.get(), 1);
        metrics.record_operation_end(true, Duration::from_millis(20));

        let summary = metrics.summary();
        assert_eq!(summary.operations_total, 1);
        assert_eq!(summary.operations_succeeded, 1);
        assert_eq!(summary.operations_in_flight, 0);
        assert!(serde_json::to_string(&summary).is_ok());
    }
}
