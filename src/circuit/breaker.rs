//! Per-key circuit breaker.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::window::{MAX_WINDOW_BUCKETS, Outcome, RollingWindow, WindowCounts};
use crate::backend::{BackendType, PoolKey};
use crate::config::duration_ms;
use crate::events::{EventBus, GovernanceEvent};
use crate::tier::TierConfig;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds and timing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Trip when the window's failure percentage exceeds this.
    pub error_threshold_pct: f64,
    /// Minimum samples in the window before the breaker may trip.
    pub volume_threshold: u64,
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Hard deadline for one wrapped call.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    pub window_buckets: usize,
}

impl BreakerConfig {
    /// Built-in defaults. Caches get the least tolerance and the shortest deadline.
    pub fn for_backend(backend: BackendType) -> Self {
        match backend {
            BackendType::Relational => Self {
                error_threshold_pct: 50.0,
                volume_threshold: 20,
                reset_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(300),
                window: Duration::from_secs(10),
                window_buckets: 10,
            },
            BackendType::Document => Self {
                error_threshold_pct: 50.0,
                volume_threshold: 20,
                reset_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(120),
                window: Duration::from_secs(10),
                window_buckets: 10,
            },
            BackendType::KeyValue => Self {
                error_threshold_pct: 25.0,
                volume_threshold: 10,
                reset_timeout: Duration::from_secs(10),
                call_timeout: Duration::from_secs(1),
                window: Duration::from_secs(10),
                window_buckets: 10,
            },
        }
    }

    /// Apply tier limits: the call deadline never exceeds the tier's query
    /// timeout and a stricter tier error threshold wins.
    pub fn with_tier(mut self, tier: &TierConfig) -> Self {
        self.call_timeout = self.call_timeout.min(tier.query_timeout);
        if let Some(pct) = tier.breaker_error_threshold_pct {
            self.error_threshold_pct = self.error_threshold_pct.min(pct);
        }
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_error_threshold(mut self, pct: f64) -> Self {
        self.error_threshold_pct = pct;
        self
    }

    pub fn with_volume_threshold(mut self, samples: u64) -> Self {
        self.volume_threshold = samples;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_window(mut self, window: Duration, buckets: usize) -> Self {
        self.window = window;
        self.window_buckets = buckets;
        self
    }

    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        if !(self.error_threshold_pct > 0.0 && self.error_threshold_pct <= 100.0) {
            return Err(format!(
                "error_threshold_pct {} not in (0, 100]",
                self.error_threshold_pct
            ));
        }
        if self.volume_threshold == 0 {
            return Err("volume_threshold must be greater than 0".into());
        }
        if self.call_timeout.is_zero() || self.reset_timeout.is_zero() || self.window.is_zero() {
            return Err("timeouts and window must be greater than 0".into());
        }
        if self.window_buckets == 0 || self.window_buckets > MAX_WINDOW_BUCKETS {
            return Err(format!(
                "window_buckets {} not in 1..={}",
                self.window_buckets, MAX_WINDOW_BUCKETS
            ));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::for_backend(BackendType::Relational)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_used: Instant,
}

/// Circuit breaker for one pool key.
///
/// The rolling window geometry is fixed when the breaker is created; the
/// thresholds of the config passed with each call apply to that call's outcome.
pub struct CircuitBreaker {
    key: PoolKey,
    inner: Mutex<BreakerInner>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(key: PoolKey, config: &BreakerConfig, events: EventBus) -> Self {
        let now = Instant::now();
        Self {
            key,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: RollingWindow::new(config.window, config.window_buckets, now),
                opened_at: None,
                probe_in_flight: false,
                last_used: now,
            }),
            events,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn counts(&self) -> WindowCounts {
        self.lock().window.counts(Instant::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask permission for one call.
    ///
    /// Fails fast with [`Error::CircuitOpen`] while open, and while half-open
    /// whenever the single probe is already out.
    pub fn try_acquire(self: &Arc<Self>, config: &BreakerConfig) -> Result<CallPermit> {
        let now = Instant::now();
        let mut event = None;
        let permit = {
            let mut inner = self.lock();
            inner.last_used = now;
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| now.saturating_duration_since(at))
                        .unwrap_or(config.reset_timeout);
                    if elapsed >= config.reset_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        event = Some(GovernanceEvent::CircuitHalfOpen {
                            key: self.key.clone(),
                        });
                        Ok(true)
                    } else {
                        Err(Error::CircuitOpen {
                            key: self.key.to_string(),
                            retry_after: Some(config.reset_timeout - elapsed),
                        })
                    }
                }
                CircuitState::HalfOpen if inner.probe_in_flight => Err(Error::CircuitOpen {
                    key: self.key.to_string(),
                    retry_after: None,
                }),
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        };

        if let Some(event) = event {
            tracing::info!(pool_key = %self.key, "Circuit breaker half-open");
            self.events.publish(event);
        }

        permit.map(|probe| CallPermit {
            breaker: Arc::clone(self),
            config: *config,
            probe,
            settled: false,
        })
    }

    fn on_outcome(&self, config: &BreakerConfig, probe: bool, outcome: Outcome) {
        let now = Instant::now();
        let event = {
            let mut inner = self.lock();
            match (inner.state, outcome) {
                (CircuitState::HalfOpen, Outcome::Success) if probe => {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.probe_in_flight = false;
                    Some(GovernanceEvent::CircuitClosed {
                        key: self.key.clone(),
                    })
                }
                (CircuitState::HalfOpen, _) if probe => {
                    let counts = inner.window.counts(now);
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.probe_in_flight = false;
                    Some(GovernanceEvent::CircuitOpened {
                        key: self.key.clone(),
                        failure_pct: counts.failure_pct(),
                        samples: counts.total(),
                    })
                }
                (CircuitState::Closed, outcome) => {
                    inner.window.record(outcome, now);
                    let counts = inner.window.counts(now);
                    if counts.total() >= config.volume_threshold
                        && counts.failure_pct() > config.error_threshold_pct
                    {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                        Some(GovernanceEvent::CircuitOpened {
                            key: self.key.clone(),
                            failure_pct: counts.failure_pct(),
                            samples: counts.total(),
                        })
                    } else {
                        None
                    }
                }
                // Late results of calls admitted before the breaker tripped.
                _ => None,
            }
        };

        if let Some(event) = event {
            match &event {
                GovernanceEvent::CircuitOpened {
                    failure_pct,
                    samples,
                    ..
                } => tracing::warn!(
                    pool_key = %self.key,
                    failure_pct = *failure_pct,
                    samples = *samples,
                    "Circuit breaker opened"
                ),
                _ => tracing::info!(pool_key = %self.key, "Circuit breaker closed"),
            }
            self.events.publish(event);
        }
    }

    fn on_abort(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Force the breaker closed with an empty window.
    pub fn reset(&self) {
        let was = {
            let mut inner = self.lock();
            let was = inner.state;
            inner.state = CircuitState::Closed;
            inner.window.clear();
            inner.opened_at = None;
            inner.probe_in_flight = false;
            was
        };
        if was != CircuitState::Closed {
            tracing::info!(pool_key = %self.key, "Circuit breaker reset");
            self.events.publish(GovernanceEvent::CircuitClosed {
                key: self.key.clone(),
            });
        }
    }

    /// Time since the breaker last admitted or refused a call.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.lock().last_used)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("probe_in_flight", &inner.probe_in_flight)
            .finish()
    }
}

/// Permission for one call through a breaker.
///
/// Settle it with [`CallPermit::run`] or one of the `record_*` methods. A
/// permit dropped unsettled counts as aborted: it leaves the window untouched
/// and frees the half-open probe slot.
#[must_use = "dropping a permit unsettled aborts the call"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    config: BreakerConfig,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker
            .on_outcome(&self.config, self.probe, Outcome::Success);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker
            .on_outcome(&self.config, self.probe, Outcome::Failure);
    }

    pub fn record_timeout(mut self) {
        self.settled = true;
        self.breaker
            .on_outcome(&self.config, self.probe, Outcome::Timeout);
    }

    /// Settle the permit from a call result.
    pub fn record_result<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(Error::OperationTimeout(_)) => self.record_timeout(),
            Err(e) if e.counts_as_breaker_failure() => self.record_failure(),
            Err(_) => drop(self),
        }
    }

    /// Run `fut` under the call deadline, racing caller cancellation, and
    /// settle the permit from its result.
    pub async fn run<T, F>(self, cancel: &CancellationToken, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.call_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::OperationTimeout(timeout)),
            },
        };
        self.record_result(&result);
        result
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abort(self.probe);
        }
    }
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("key", &self.breaker.key)
            .field("probe", &self.probe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: &BreakerConfig) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            PoolKey::new("acme", BackendType::Relational, "primary"),
            config,
            EventBus::new(),
        ))
    }

    fn config() -> BreakerConfig {
        BreakerConfig::for_backend(BackendType::Relational)
            .with_volume_threshold(10)
            .with_reset_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_trips_once_past_threshold_and_volume() {
        let config = config();
        let cb = breaker(&config);

        for _ in 0..6 {
            cb.try_acquire(&config).unwrap().record_failure();
        }
        for _ in 0..3 {
            cb.try_acquire(&config).unwrap().record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.try_acquire(&config).unwrap().record_success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.try_acquire(&config),
            Err(Error::CircuitOpen {
                retry_after: Some(_),
                ..
            })
        ));
    }

    #[test]
    fn test_below_volume_never_trips() {
        let config = config();
        let cb = breaker(&config);
        for _ in 0..9 {
            cb.try_acquire(&config).unwrap().record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_exactly_threshold_does_not_trip() {
        let config = config();
        let cb = breaker(&config);
        for _ in 0..5 {
            cb.try_acquire(&config).unwrap().record_success();
        }
        for _ in 0..5 {
            cb.try_acquire(&config).unwrap().record_failure();
        }
        assert_eq!(cb.counts().failure_pct(), 50.0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    fn trip(cb: &Arc<CircuitBreaker>, config: &BreakerConfig) {
        for _ in 0..10 {
            cb.try_acquire(config).unwrap().record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_single_probe_then_close() {
        let config = config();
        let cb = breaker(&config);
        trip(&cb, &config);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let probe = cb.try_acquire(&config).unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(
            cb.try_acquire(&config),
            Err(Error::CircuitOpen {
                retry_after: None,
                ..
            })
        ));

        probe.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().total(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let config = config();
        let cb = breaker(&config);
        trip(&cb, &config);
        tokio::time::sleep(Duration::from_millis(60)).await;

        cb.try_acquire(&config).unwrap().record_timeout();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire(&config).is_err());
    }

    #[tokio::test]
    async fn test_aborted_probe_frees_slot() {
        let config = config();
        let cb = breaker(&config);
        trip(&cb, &config);
        tokio::time::sleep(Duration::from_millis(60)).await;

        drop(cb.try_acquire(&config).unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let probe = cb.try_acquire(&config).unwrap();
        assert!(probe.is_probe());
        probe.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_run_times_out_and_counts() {
        let config = config().with_call_timeout(Duration::from_millis(20));
        let cb = breaker(&config);
        let cancel = CancellationToken::new();

        let result: Result<()> = cb
            .try_acquire(&config)
            .unwrap()
            .run(&cancel, futures::future::pending())
            .await;
        assert!(matches!(result, Err(Error::OperationTimeout(_))));
        assert_eq!(cb.counts().timeouts, 1);
    }

    #[tokio::test]
    async fn test_run_cancelled_is_neutral() {
        let config = config();
        let cb = breaker(&config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = cb
            .try_acquire(&config)
            .unwrap()
            .run(&cancel, futures::future::pending())
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(cb.counts().total(), 0);
    }

    #[test]
    fn test_tier_tightens() {
        let tier = TierConfig::defaults_for(crate::tier::TierName::Free);
        let config = BreakerConfig::for_backend(BackendType::Relational).with_tier(&tier);
        assert_eq!(config.call_timeout, tier.query_timeout);
        assert_eq!(config.error_threshold_pct, 40.0);

        let kv = BreakerConfig::for_backend(BackendType::KeyValue).with_tier(&tier);
        assert_eq!(kv.call_timeout, Duration::from_secs(1));
        assert_eq!(kv.error_threshold_pct, 25.0);
    }

    #[test]
    fn test_check_bounds_window_buckets() {
        let base = BreakerConfig::for_backend(BackendType::Relational);
        assert!(base.check().is_ok());
        assert!(base.with_window(Duration::from_secs(10), 0).check().is_err());
        let err = base
            .with_window(Duration::from_secs(10), 4_294_967_296)
            .check()
            .unwrap_err();
        assert!(err.contains("window_buckets"));
    }

    #[test]
    fn test_reset() {
        let config = config();
        let cb = breaker(&config);
        trip(&cb, &config);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(&config).is_ok());
    }
}
