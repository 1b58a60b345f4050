//! Bucketed rolling window of call outcomes.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Outcome totals over the live part of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    /// Failures including timeouts.
    pub fn failed(&self) -> u64 {
        self.failures + self.timeouts
    }

    pub fn failure_pct(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failed() as f64 * 100.0 / total as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Index of the bucket-width slot this bucket last counted for.
    epoch: Option<u64>,
    counts: WindowCounts,
}

/// Fixed number of buckets covering a fixed duration. A bucket is reused
/// once its slot falls out of the window.
/// Upper bound on buckets per window.
pub(crate) const MAX_WINDOW_BUCKETS: usize = 1_000;

#[derive(Debug)]
pub struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_width: Duration,
    origin: Instant,
}

impl RollingWindow {
    pub fn new(span: Duration, bucket_count: usize, now: Instant) -> Self {
        let bucket_count = bucket_count.clamp(1, MAX_WINDOW_BUCKETS);
        let divisor = u32::try_from(bucket_count).unwrap_or(u32::MAX);
        let bucket_width = (span / divisor).max(Duration::from_millis(1));
        Self {
            buckets: vec![Bucket::default(); bucket_count],
            bucket_width,
            origin: now,
        }
    }

    fn epoch_at(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.origin).as_nanos() / self.bucket_width.as_nanos())
            as u64
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        let epoch = self.epoch_at(now);
        let idx = (epoch % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[idx];
        if bucket.epoch != Some(epoch) {
            *bucket = Bucket {
                epoch: Some(epoch),
                counts: WindowCounts::default(),
            };
        }
        match outcome {
            Outcome::Success => bucket.counts.successes += 1,
            Outcome::Failure => bucket.counts.failures += 1,
            Outcome::Timeout => bucket.counts.timeouts += 1,
        }
    }

    pub fn counts(&self, now: Instant) -> WindowCounts {
        let current = self.epoch_at(now);
        let oldest = current.saturating_sub(self.buckets.len() as u64 - 1);
        self.buckets
            .iter()
            .filter(|b| matches!(b.epoch, Some(e) if e >= oldest && e <= current))
            .fold(WindowCounts::default(), |mut acc, b| {
                acc.successes += b.counts.successes;
                acc.failures += b.counts.failures;
                acc.timeouts += b.counts.timeouts;
                acc
            })
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = Bucket::default());
    }
}
