//! A single bounded connection pool.
//!
//! `active` counts checked-out connections plus slots reserved for connections
//! being opened, so `active + idle <= max_size` holds at every instant. When a
//! connection or slot frees up while callers are queued, it is handed straight
//! to the oldest waiter instead of going through the idle set.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{PoolSettings, PoolStats};
use crate::backend::{
    BackendConnection, BackendDriver, ExecutionOptions, Operation, OperationOutput, PoolKey,
};
use crate::observability::GovernanceMetrics;
use crate::{Error, Result};

/// What a queued caller receives.
enum Grant {
    Connection(Box<dyn BackendConnection>),
    /// Permission to open a new connection in a freed slot.
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

struct PoolState {
    idle: VecDeque<Box<dyn BackendConnection>>,
    active: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    last_used: Instant,
}

enum Step {
    Ready(Box<dyn BackendConnection>),
    Open,
    Wait(u64, oneshot::Receiver<Grant>),
}

pub struct ConnectionPool {
    key: PoolKey,
    settings: PoolSettings,
    driver: Arc<dyn BackendDriver>,
    state: Mutex<PoolState>,
    draining: AtomicBool,
    metrics: Arc<GovernanceMetrics>,
}

impl ConnectionPool {
    pub fn new(
        key: PoolKey,
        settings: PoolSettings,
        driver: Arc<dyn BackendDriver>,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            key,
            settings,
            driver,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                last_used: Instant::now(),
            }),
            draining: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn draining_error(&self) -> Error {
        Error::PoolDraining {
            key: self.key.to_string(),
        }
    }

    /// Check out a connection, waiting up to the tier's acquire timeout.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.settings.acquire_timeout;

        let step = {
            let mut state = self.lock();
            if self.is_draining() {
                return Err(self.draining_error());
            }
            state.last_used = started;
            if let Some(conn) = state.idle.pop_back() {
                state.active += 1;
                Step::Ready(conn)
            } else if state.active < self.settings.max_size {
                state.active += 1;
                Step::Open
            } else if state.waiters.len() >= self.settings.max_waiters {
                return Err(Error::PoolExhausted {
                    key: self.key.to_string(),
                    waited: Duration::ZERO,
                });
            } else {
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                Step::Wait(id, rx)
            }
        };

        match step {
            Step::Ready(conn) => self.checked_out(conn, cancel).await,
            Step::Open => self.open_in(SlotReservation::new(self), cancel).await,
            Step::Wait(id, mut rx) => {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(Error::PoolExhausted {
                        key: self.key.to_string(),
                        waited: started.elapsed(),
                    }),
                    grant = &mut rx => grant.map_err(|_| self.draining_error()),
                };
                match outcome {
                    // Handed over straight from a caller that just used it.
                    Ok(Grant::Connection(conn)) => Ok(PooledConnection::new(Arc::clone(self), conn)),
                    Ok(Grant::Slot) => self.open_in(SlotReservation::new(self), cancel).await,
                    Err(e) => {
                        self.abandon_wait(id, rx);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Leave the waiter queue. A grant sent before we got the lock is passed on.
    fn abandon_wait(&self, id: u64, mut rx: oneshot::Receiver<Grant>) {
        let still_queued = {
            let mut state = self.lock();
            match state.waiters.iter().position(|w| w.id == id) {
                Some(pos) => {
                    state.waiters.remove(pos);
                    true
                }
                None => false,
            }
        };
        if still_queued {
            return;
        }
        match rx.try_recv() {
            Ok(Grant::Connection(conn)) => self.release(conn),
            Ok(Grant::Slot) => self.release_slot(),
            Err(_) => {}
        }
    }

    async fn checked_out(
        self: &Arc<Self>,
        conn: Box<dyn BackendConnection>,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let guard = PooledConnection::new(Arc::clone(self), conn);
        if !self.settings.validate_on_acquire || guard.is_alive().await {
            return Ok(guard);
        }
        tracing::debug!(pool_key = %self.key, "Discarding dead idle connection");
        let (dead, slot) = guard.into_slot();
        if let Some(dead) = dead {
            self.close(dead).await;
        }
        self.open_in(slot, cancel).await
    }

    async fn open_in(
        self: &Arc<Self>,
        slot: SlotReservation,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            opened = tokio::time::timeout(self.settings.open_timeout, self.driver.open(&self.key)) => opened,
        };
        match opened {
            Ok(Ok(conn)) => {
                slot.disarm();
                self.metrics.connections_opened.inc();
                tracing::debug!(pool_key = %self.key, "Opened backend connection");
                Ok(PooledConnection::new(Arc::clone(self), conn))
            }
            Ok(Err(e)) => {
                tracing::warn!(pool_key = %self.key, error = %e, "Failed to open backend connection");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(pool_key = %self.key, "Timed out opening backend connection");
                Err(Error::unreachable(
                    self.key.backend,
                    format!(
                        "open timed out after {}ms",
                        self.settings.open_timeout.as_millis()
                    ),
                ))
            }
        }
    }

    /// Return a checked-out connection.
    pub(crate) fn release(&self, conn: Box<dyn BackendConnection>) {
        let stale = {
            let mut state = self.lock();
            // Checked under the lock: `drain` flips the flag while holding it.
            if self.is_draining() {
                state.active -= 1;
                Some(conn)
            } else {
                state.last_used = Instant::now();
                match Self::hand_off(&mut state, Grant::Connection(conn)) {
                    None => {}
                    Some(Grant::Connection(conn)) => {
                        state.active -= 1;
                        state.idle.push_back(conn);
                    }
                    Some(Grant::Slot) => state.active -= 1,
                }
                None
            }
        };
        if let Some(conn) = stale {
            self.close_detached(conn);
        }
    }

    /// Give up a checked-out slot without returning a connection.
    pub(crate) fn release_slot(&self) {
        let mut state = self.lock();
        if Self::hand_off(&mut state, Grant::Slot).is_some() {
            state.active -= 1;
        }
    }

    /// Pass a grant to the oldest live waiter, or hand it back if none is left.
    fn hand_off(state: &mut PoolState, grant: Grant) -> Option<Grant> {
        let mut grant = grant;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    async fn close(&self, mut conn: Box<dyn BackendConnection>) {
        conn.close().await;
        self.metrics.connections_closed.inc();
    }

    fn close_detached(&self, mut conn: Box<dyn BackendConnection>) {
        let metrics = Arc::clone(&self.metrics);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    conn.close().await;
                    metrics.connections_closed.inc();
                });
            }
            Err(_) => {
                tracing::warn!(pool_key = %self.key, "No runtime available, dropping connection without close");
            }
        }
    }

    /// Open connections until the pool holds `min_size`. Returns how many opened.
    pub async fn prewarm(self: &Arc<Self>) -> usize {
        let mut opened = 0;
        loop {
            let reserved = {
                let mut state = self.lock();
                let total = state.active + state.idle.len();
                if self.is_draining()
                    || total >= self.settings.min_size
                    || total >= self.settings.max_size
                {
                    false
                } else {
                    state.active += 1;
                    true
                }
            };
            if !reserved {
                return opened;
            }
            let slot = SlotReservation::new(self);
            match tokio::time::timeout(self.settings.open_timeout, self.driver.open(&self.key)).await
            {
                Ok(Ok(conn)) => {
                    slot.disarm();
                    self.metrics.connections_opened.inc();
                    self.release(conn);
                    opened += 1;
                }
                _ => {
                    tracing::warn!(pool_key = %self.key, opened, "Pool pre-warm stopped after open failure");
                    return opened;
                }
            }
        }
    }

    /// Close idle connections above `min_size` once the pool has been unused
    /// for `idle_after`. Returns how many were closed.
    pub async fn evict_idle(&self, idle_after: Duration) -> usize {
        let evicted: Vec<Box<dyn BackendConnection>> = {
            let mut state = self.lock();
            if state.last_used.elapsed() < idle_after {
                return 0;
            }
            let mut evicted = Vec::new();
            while !state.idle.is_empty()
                && state.idle.len() + state.active > self.settings.min_size
            {
                if let Some(conn) = state.idle.pop_front() {
                    evicted.push(conn);
                }
            }
            evicted
        };
        let count = evicted.len();
        for conn in evicted {
            self.close(conn).await;
        }
        if count > 0 {
            tracing::debug!(pool_key = %self.key, count, "Evicted idle connections");
        }
        count
    }

    /// Mark the pool draining if nothing is checked out or queued and it has
    /// been unused for `idle_after`. Once marked, acquires fail with
    /// `PoolDraining`.
    pub fn try_begin_drain(&self, idle_after: Duration) -> bool {
        let state = self.lock();
        if state.active == 0 && state.waiters.is_empty() && state.last_used.elapsed() >= idle_after
        {
            self.draining.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Reject new acquires, fail queued callers and close idle connections.
    /// Checked-out connections are closed as they come back.
    pub async fn drain(&self) -> usize {
        let idle: Vec<Box<dyn BackendConnection>> = {
            let mut state = self.lock();
            self.draining.store(true, Ordering::Release);
            state.waiters.clear();
            state.idle.drain(..).collect()
        };
        let count = idle.len();
        for conn in idle {
            self.close(conn).await;
        }
        count
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_used.elapsed()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            key: self.key.clone(),
            size: state.active + state.idle.len(),
            idle: state.idle.len(),
            active: state.active,
            pending: state.waiters.len(),
            max_size: self.settings.max_size,
            draining: self.is_draining(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("settings", &self.settings)
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// A slot counted in `active` with no connection yet. Released on drop.
struct SlotReservation {
    pool: Option<Arc<ConnectionPool>>,
}

impl SlotReservation {
    fn new(pool: &Arc<ConnectionPool>) -> Self {
        Self {
            pool: Some(Arc::clone(pool)),
        }
    }

    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_slot();
        }
    }
}

/// A checked-out connection. Returned to its pool when dropped.
pub struct PooledConnection {
    conn: Option<Box<dyn BackendConnection>>,
    pool: Arc<ConnectionPool>,
    acquired_at: Instant,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Box<dyn BackendConnection>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            acquired_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        self.pool.key()
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    fn released_error() -> Error {
        Error::InvalidRequest("connection already returned to its pool".into())
    }

    pub async fn is_alive(&self) -> bool {
        match &self.conn {
            Some(conn) => conn.is_alive().await,
            None => false,
        }
    }

    pub async fn execute(
        &mut self,
        operation: &Operation,
        options: &ExecutionOptions,
    ) -> Result<OperationOutput> {
        let conn = self.conn.as_mut().ok_or_else(Self::released_error)?;
        conn.execute(operation, options).await
    }

    /// Return the connection to the pool.
    pub fn release(self) {}

    /// Close the connection instead of returning it, freeing its slot.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            let slot = SlotReservation::new(&self.pool);
            self.pool.close(conn).await;
            drop(slot);
        }
    }

    /// Detach the connection but keep its slot reserved.
    fn into_slot(mut self) -> (Option<Box<dyn BackendConnection>>, SlotReservation) {
        (self.conn.take(), SlotReservation::new(&self.pool))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", self.pool.key())
            .field("held_for", &self.held_for())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendType, MemoryDriver};
    use crate::pool::PoolManagerConfig;
    use crate::tier::{TierConfig, TierName};

    fn pool_with(driver: &MemoryDriver, max: usize, acquire_timeout: Duration) -> Arc<ConnectionPool> {
        let mut tier = TierConfig::defaults_for(TierName::Free);
        tier.max_pool_size = max;
        tier.connection_acquire_timeout = acquire_timeout;
        Arc::new(ConnectionPool::new(
            PoolKey::new("acme", BackendType::Relational, "primary"),
            PoolSettings::new(&tier, &PoolManagerConfig::default()),
            Arc::new(driver.clone()),
            Arc::new(GovernanceMetrics::new()),
        ))
    }

    #[tokio::test]
    async fn test_reuses_idle_connection() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 2, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let conn = pool.acquire(&cancel).await.unwrap();
        drop(conn);
        assert_eq!(pool.stats().idle, 1);

        let _conn = pool.acquire(&cancel).await.unwrap();
        assert_eq!(driver.opened(), 1);
        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (1, 0));
    }

    #[tokio::test]
    async fn test_full_pool_times_out() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let _held = pool.acquire(&cancel).await.unwrap();
        let result = pool.acquire(&cancel).await;
        match result {
            Err(Error::PoolExhausted { waited, .. }) => assert!(waited >= Duration::from_millis(50)),
            other => panic!("Expected PoolExhausted, got {:?}", other),
        }
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_release_hands_off_to_waiter() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(2));
        let cancel = CancellationToken::new();

        let held = pool.acquire(&cancel).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await.map(|c| c.key().clone()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().pending, 1);

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(driver.opened(), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_handed_off_connection_skips_validation() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(2));
        let cancel = CancellationToken::new();

        let held = pool.acquire(&cancel).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await.map(|c| c.held_for()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        driver.invalidate_connections();
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(driver.opened(), 1);
        assert_eq!(driver.closed(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_racing_drain_closes_every_connection() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 4, Duration::from_secs(1));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    loop {
                        match pool.acquire(&cancel).await {
                            Ok(conn) => {
                                tokio::task::yield_now().await;
                                drop(conn);
                            }
                            Err(Error::PoolDraining { .. }) => break,
                            Err(e) => panic!("Unexpected error: {}", e),
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.drain().await;
        for worker in workers {
            worker.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (0, 0));
        assert_eq!(driver.closed(), driver.opened());
    }

    #[tokio::test]
    async fn test_waiters_served_in_order() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let held = pool.acquire(&cancel).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let conn = pool.acquire(&cancel).await.unwrap();
                order_tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(conn);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| order_rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_waiter_queue_is_bounded() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let mut tier = TierConfig::defaults_for(TierName::Free);
        tier.max_pool_size = 1;
        let config = PoolManagerConfig {
            max_waiters: 0,
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(
            PoolKey::new("acme", BackendType::Relational, "primary"),
            PoolSettings::new(&tier, &config),
            Arc::new(driver),
            Arc::new(GovernanceMetrics::new()),
        ));
        let cancel = CancellationToken::new();

        let _held = pool.acquire(&cancel).await.unwrap();
        match pool.acquire(&cancel).await {
            Err(Error::PoolExhausted { waited, .. }) => assert_eq!(waited, Duration::ZERO),
            other => panic!("Expected immediate PoolExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        drop(pool.acquire(&cancel).await.unwrap());
        driver.invalidate_connections();

        let conn = pool.acquire(&cancel).await.unwrap();
        assert!(conn.is_alive().await);
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.stats().size, 1);
    }

    #[tokio::test]
    async fn test_failed_open_frees_slot() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        driver.refuse_connections(true);
        assert!(matches!(
            pool.acquire(&cancel).await,
            Err(Error::BackendUnreachable { .. })
        ));
        assert_eq!(pool.stats().active, 0);

        driver.refuse_connections(false);
        assert!(pool.acquire(&cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(5));
        let held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(pool.stats().pending, 0);
        drop(held);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 1, Duration::from_secs(1));
        let conn = pool.acquire(&CancellationToken::new()).await.unwrap();
        conn.discard().await;

        let stats = pool.stats();
        assert_eq!((stats.active, stats.idle), (0, 0));
        assert_eq!(driver.closed(), 1);
    }

    #[tokio::test]
    async fn test_prewarm_and_evict() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let mut tier = TierConfig::defaults_for(TierName::Pro);
        tier.min_pool_size = 2;
        let pool = Arc::new(ConnectionPool::new(
            PoolKey::new("acme", BackendType::Relational, "primary"),
            PoolSettings::new(&tier, &PoolManagerConfig::default()),
            Arc::new(driver.clone()),
            Arc::new(GovernanceMetrics::new()),
        ));

        assert_eq!(pool.prewarm().await, 2);
        assert_eq!(pool.stats().idle, 2);

        let cancel = CancellationToken::new();
        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        let c = pool.acquire(&cancel).await.unwrap();
        drop((a, b, c));
        assert_eq!(pool.stats().idle, 3);

        assert_eq!(pool.evict_idle(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.evict_idle(Duration::from_millis(10)).await, 1);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_drain_rejects_acquire() {
        let driver = MemoryDriver::new(BackendType::Relational);
        let pool = pool_with(&driver, 2, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let held = pool.acquire(&cancel).await.unwrap();
        drop(pool.acquire(&cancel).await.unwrap());
        assert!(!pool.try_begin_drain(Duration::ZERO));

        assert_eq!(pool.drain().await, 1);
        assert!(matches!(
            pool.acquire(&cancel).await,
            Err(Error::PoolDraining { .. })
        ));

        drop(held);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().size, 0);
        assert_eq!(driver.closed(), 2);
    }
}
