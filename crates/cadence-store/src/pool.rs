use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cadence_core::PoolConfig;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::manager::ConnectionManager;

/// Snapshot of pool accounting, taken under the pool lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live connections: idle + leased + being opened.
    pub pool_size: usize,
    pub idle_connections: usize,
    pub total_connections_created: u64,
    pub max_connections: usize,
    /// Acquires satisfied by an idle connection rather than a new one.
    pub connections_reused: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    /// Leases currently outstanding.
    pub concurrent_operations: usize,
    pub max_concurrent_observed: usize,
}

/// What happened to a connection when its lease was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Passed the liveness probe and went back to the idle set.
    Idle,
    /// Failed the probe (or the pool is closed) and was closed.
    Discarded,
}

struct PooledConnection<C> {
    conn: C,
    created_at: Instant,
    last_used_at: Instant,
}

impl<C> PooledConnection<C> {
    fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used_at: now,
        }
    }
}

enum Slot<C> {
    Idle(PooledConnection<C>),
    New,
}

struct PoolState<C> {
    idle: VecDeque<PooledConnection<C>>,
    /// Idle + leased + slots reserved for a connection being opened or probed.
    size: usize,
    leased: usize,
    closed: bool,
    total_created: u64,
    reused: u64,
    completed: u64,
    failed: u64,
    max_concurrent: usize,
}

impl<C> PoolState<C> {
    /// Pop idle connections unused for longer than `ttl` into `expired`.
    /// The idle queue is ordered oldest-first.
    fn evict_expired(&mut self, ttl: Duration, expired: &mut Vec<PooledConnection<C>>) {
        while self
            .idle
            .front()
            .is_some_and(|c| c.last_used_at.elapsed() > ttl)
        {
            if let Some(conn) = self.idle.pop_front() {
                self.size -= 1;
                expired.push(conn);
            }
        }
    }
}

struct Shared<M: ConnectionManager> {
    manager: M,
    max_connections: usize,
    acquire_timeout: Duration,
    idle_ttl: Duration,
    state: Mutex<PoolState<M::Connection>>,
    /// Signalled whenever a connection or a slot frees up.
    changed: Condvar,
    next_lease_id: AtomicU64,
}

impl<M: ConnectionManager> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        // Counters stay usable after a panicking holder; none of the
        // critical sections leave them half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle connection or reserve a slot for a new one, waiting
    /// until `deadline` while the pool is at its ceiling.
    ///
    /// With `fresh` set the caller always gets `Slot::New`: at the ceiling
    /// the oldest idle connection is closed to make room for it.
    fn reserve(
        &self,
        started: Instant,
        deadline: Instant,
        fresh: bool,
    ) -> Result<Slot<M::Connection>> {
        let mut expired = Vec::new();
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(StoreError::PoolClosed);
            }
            state.evict_expired(self.idle_ttl, &mut expired);

            if !fresh {
                if let Some(conn) = state.idle.pop_back() {
                    return Ok(Slot::Idle(conn));
                }
            }
            if state.size < self.max_connections {
                state.size += 1;
                return Ok(Slot::New);
            }
            if fresh {
                if let Some(oldest) = state.idle.pop_front() {
                    // The closed connection's slot is handed over as is.
                    expired.push(oldest);
                    return Ok(Slot::New);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                state.failed += 1;
                return Err(StoreError::PoolExhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Give up a reserved slot whose connection could not be used.
    fn forfeit(&self) {
        let mut state = self.lock();
        state.size -= 1;
        self.changed.notify_all();
    }

    fn hand_out(
        self: &Arc<Self>,
        mut conn: PooledConnection<M::Connection>,
        reused: bool,
    ) -> Result<Lease<M>> {
        let mut state = self.lock();
        if !reused {
            state.total_created += 1;
        }
        if state.closed {
            state.size -= 1;
            self.changed.notify_all();
            drop(state);
            return Err(StoreError::PoolClosed);
        }
        if reused {
            state.reused += 1;
        }
        state.leased += 1;
        state.max_concurrent = state.max_concurrent.max(state.leased);
        drop(state);

        conn.last_used_at = Instant::now();
        let id = self.next_lease_id.fetch_add(1, Ordering::Relaxed);
        debug!(lease_id = id, reused, "connection leased");
        Ok(Lease {
            pool: Arc::clone(self),
            conn: Some(conn),
            id,
            failed: false,
        })
    }

    fn give_back(&self, mut conn: PooledConnection<M::Connection>, failed: bool) -> Released {
        let healthy = self.manager.is_valid(&mut conn.conn);
        let mut discarded = None;
        let outcome = {
            let mut state = self.lock();
            state.leased -= 1;
            if failed {
                state.failed += 1;
            } else {
                state.completed += 1;
            }
            let outcome = if healthy && !state.closed {
                conn.last_used_at = Instant::now();
                state.idle.push_back(conn);
                Released::Idle
            } else {
                state.size -= 1;
                discarded = Some(conn);
                Released::Discarded
            };
            self.changed.notify_all();
            outcome
        };
        if discarded.is_some() && !healthy {
            warn!("released connection failed liveness probe; discarded");
        }
        outcome
    }
}

/// Bounded, thread-safe pool of store connections.
///
/// At most `max_connections` connections are alive at once. Callers borrow
/// one through a [`Lease`]; the pool lock is only held while the idle set
/// and counters change, never while a leased connection is in use.
/// Cloning the pool is cheap and shares the same connections.
pub struct ConnectionPool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, config: &PoolConfig) -> Self {
        Self::with_limits(
            manager,
            config.max_connections,
            config.acquire_timeout(),
            config.idle_connection_ttl(),
        )
    }

    pub fn with_limits(
        manager: M,
        max_connections: usize,
        acquire_timeout: Duration,
        idle_ttl: Duration,
    ) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            shared: Arc::new(Shared {
                manager,
                max_connections,
                acquire_timeout,
                idle_ttl,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_connections),
                    size: 0,
                    leased: 0,
                    closed: false,
                    total_created: 0,
                    reused: 0,
                    completed: 0,
                    failed: 0,
                    max_concurrent: 0,
                }),
                changed: Condvar::new(),
                next_lease_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// Borrow a connection, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> Result<Lease<M>> {
        self.acquire_timeout(self.shared.acquire_timeout)
    }

    /// Borrow a connection, waiting up to `timeout` for one to free up.
    ///
    /// An idle connection that fails its liveness probe, or a connect that
    /// fails, is retried once with a newly opened connection (never another
    /// idle one). A second consecutive failure is returned as
    /// [`StoreError::ConnectionLost`].
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<M>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut retried = false;

        loop {
            let slot = self.shared.reserve(started, deadline, retried)?;
            let attempt = match slot {
                Slot::Idle(mut pooled) => {
                    if self.shared.manager.is_valid(&mut pooled.conn) {
                        Ok((pooled, true))
                    } else {
                        Err(StoreError::ConnectionLost(
                            "idle connection failed liveness probe".to_string(),
                        ))
                    }
                }
                Slot::New => self
                    .shared
                    .manager
                    .connect()
                    .map(|conn| (PooledConnection::new(conn), false)),
            };

            match attempt {
                Ok((pooled, reused)) => return self.shared.hand_out(pooled, reused),
                Err(e) => {
                    self.shared.forfeit();
                    if retried {
                        self.shared.lock().failed += 1;
                        error!(error = %e, "connection unusable after reconnect attempt");
                        return Err(match e {
                            StoreError::ConnectionLost(_) => e,
                            other => StoreError::ConnectionLost(other.to_string()),
                        });
                    }
                    warn!(error = %e, "discarding unusable connection; retrying once");
                    retried = true;
                }
            }
        }
    }

    /// Close idle connections unused for longer than the idle TTL.
    /// Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut state = self.shared.lock();
            state.evict_expired(self.shared.idle_ttl, &mut expired);
            if !expired.is_empty() {
                self.shared.changed.notify_all();
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "closed expired idle connections");
        }
        expired.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            pool_size: state.size,
            idle_connections: state.idle.len(),
            total_connections_created: state.total_created,
            max_connections: self.shared.max_connections,
            connections_reused: state.reused,
            operations_completed: state.completed,
            operations_failed: state.failed,
            concurrent_operations: state.leased,
            max_concurrent_observed: state.max_concurrent,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Close the pool: later acquires fail with [`StoreError::PoolClosed`],
    /// idle connections are closed now, and this call blocks until every
    /// outstanding lease has been released.
    ///
    /// Calling this while the current thread still holds a lease deadlocks.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.shared.lock();
            if !state.closed {
                info!(leased = state.leased, "closing connection pool");
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.size -= drained.len();
            self.shared.changed.notify_all();
            drained
        };
        drop(drained);

        let mut state = self.shared.lock();
        while state.size > 0 {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        debug!("connection pool closed");
    }
}

/// Exclusive, single-holder right to one pooled connection.
///
/// Dereferences to the driver connection. The connection goes back to the
/// pool on [`Lease::release`] or when the lease is dropped. Because
/// `release` takes the lease by value, a lease cannot be released twice:
///
/// ```compile_fail,E0382
/// # fn demo(pool: &cadence_store::SqlitePool) -> cadence_store::Result<()> {
/// let lease = pool.acquire()?;
/// lease.release();
/// lease.release();
/// # Ok(())
/// # }
/// ```
///
/// A single release compiles:
///
/// ```
/// # fn demo(pool: &cadence_store::SqlitePool) -> cadence_store::Result<()> {
/// let lease = pool.acquire()?;
/// lease.release();
/// # Ok(())
/// # }
/// ```
pub struct Lease<M: ConnectionManager> {
    pool: Arc<Shared<M>>,
    conn: Option<PooledConnection<M::Connection>>,
    id: u64,
    failed: bool,
}

impl<M: ConnectionManager> Lease<M> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the underlying connection was opened.
    pub fn connection_age(&self) -> Duration {
        self.conn
            .as_ref()
            .map(|c| c.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Count this lease's operation as failed when it is released.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Return the connection to the pool, probing it first.
    pub fn release(mut self) -> Released {
        match self.conn.take() {
            Some(conn) => self.pool.give_back(conn, self.failed),
            None => Released::Discarded,
        }
    }
}

impl<M: ConnectionManager> Deref for Lease<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn.as_ref().expect("lease used after release").conn
    }
}

impl<M: ConnectionManager> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.as_mut().expect("lease used after release").conn
    }
}

impl<M: ConnectionManager> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.failed);
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("age", &self.connection_age())
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeConn {
        serial: usize,
        alive: Arc<AtomicBool>,
    }

    /// Hands out in-memory connections that tests can break on demand.
    #[derive(Default)]
    struct FakeManager {
        opened: AtomicUsize,
        failing_connects: AtomicUsize,
        handles: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeManager {
        fn fail_next_connects(&self, n: usize) {
            self.failing_connects.store(n, Ordering::SeqCst);
        }

        fn kill(&self, serial: usize) {
            self.handles.lock().unwrap()[serial].store(false, Ordering::SeqCst);
        }
    }

    impl ConnectionManager for FakeManager {
        type Connection = FakeConn;

        fn connect(&self) -> Result<FakeConn> {
            let pending = self.failing_connects.load(Ordering::SeqCst);
            if pending > 0 {
                self.failing_connects.store(pending - 1, Ordering::SeqCst);
                return Err(StoreError::ConnectionLost("store unreachable".into()));
            }
            let serial = self.opened.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            self.handles.lock().unwrap().push(Arc::clone(&alive));
            Ok(FakeConn { serial, alive })
        }

        fn is_valid(&self, conn: &mut FakeConn) -> bool {
            conn.alive.load(Ordering::SeqCst)
        }
    }

    fn pool(max: usize) -> ConnectionPool<FakeManager> {
        ConnectionPool::with_limits(
            FakeManager::default(),
            max,
            Duration::from_secs(5),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn never_more_leases_than_capacity() {
        let pool = pool(2);
        let outstanding = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let lease = pool.acquire().expect("acquire");
                    let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    lease.release();
                });
            }
        });

        let stats = pool.stats();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(stats.max_concurrent_observed <= 2);
        assert!(stats.pool_size <= 2);
        assert!(stats.total_connections_created <= 2);
        assert_eq!(stats.operations_completed, 8);
        assert_eq!(
            stats.connections_reused + stats.total_connections_created,
            8
        );
        assert_eq!(stats.concurrent_operations, 0);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = pool(1);
        let held = pool.acquire().expect("first acquire");

        let err = pool
            .acquire_timeout(Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted { .. }));
        assert!(err.is_retryable());

        let stats = pool.stats();
        assert_eq!(stats.operations_failed, 1);
        assert_eq!(stats.concurrent_operations, 1);
        assert_eq!(stats.total_connections_created, 1);
        assert_eq!(stats.connections_reused, 0);
        drop(held);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = pool(1);
        let held = pool.acquire().expect("first acquire");

        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                held.release();
            });
            let lease = pool
                .acquire_timeout(Duration::from_secs(5))
                .expect("waiter should get the released connection");
            assert_eq!(lease.serial, 0);
        });
        assert_eq!(pool.stats().connections_reused, 1);
    }

    #[test]
    fn reuse_counted_on_acquire_not_release() {
        let pool = pool(2);
        let lease = pool.acquire().expect("acquire");
        assert_eq!(lease.release(), Released::Idle);
        assert_eq!(pool.stats().connections_reused, 0);

        let again = pool.acquire().expect("acquire");
        assert_eq!(again.serial, 0);
        let stats = pool.stats();
        assert_eq!(stats.connections_reused, 1);
        assert_eq!(stats.total_connections_created, 1);
        assert_eq!(stats.idle_connections, 0);
    }

    #[test]
    fn broken_idle_connection_is_replaced() {
        let pool = pool(1);
        pool.acquire().expect("acquire").release();
        pool.manager().kill(0);

        let lease = pool.acquire().expect("substitute connection");
        assert_eq!(lease.serial, 1);
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 1);
        assert_eq!(stats.total_connections_created, 2);
        assert_eq!(stats.connections_reused, 0);
    }

    #[test]
    fn stale_idle_set_is_replaced_with_new_connections() {
        let pool = pool(3);
        let leases: Vec<_> = (0..3).map(|_| pool.acquire().expect("acquire")).collect();
        drop(leases);
        assert_eq!(pool.stats().idle_connections, 3);
        for serial in 0..=2 {
            pool.manager().kill(serial);
        }

        // Store came back; every idle handle is stale but connecting works.
        let first = pool.acquire().expect("first acquire after restart");
        assert!(first.serial >= 3);
        let second = pool.acquire().expect("second acquire after restart");
        assert!(second.serial >= 3);

        let stats = pool.stats();
        assert_eq!(stats.operations_failed, 0);
        assert!(stats.pool_size <= 3);
        assert_eq!(stats.connections_reused, 0);
    }

    #[test]
    fn retry_opens_a_connection_even_with_idle_ones_left() {
        let pool = pool(2);
        let a = pool.acquire().expect("acquire");
        let b = pool.acquire().expect("acquire");
        assert_eq!((a.serial, b.serial), (0, 1));
        drop(a);
        drop(b);
        pool.manager().kill(1);

        // Serial 1 is popped first and fails. Serial 0 is still idle and
        // healthy, but the retry must open a new connection.
        let lease = pool.acquire().expect("substitute connection");
        assert_eq!(lease.serial, 2);
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections_created, 3);
        assert_eq!(stats.operations_failed, 0);
    }

    #[test]
    fn single_connect_failure_is_retried() {
        let pool = pool(1);
        pool.manager().fail_next_connects(1);
        let lease = pool.acquire().expect("second connect succeeds");
        assert_eq!(lease.serial, 0);
        assert_eq!(pool.stats().operations_failed, 0);
    }

    #[test]
    fn second_consecutive_failure_propagates() {
        let pool = pool(1);
        pool.manager().fail_next_connects(2);
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, StoreError::ConnectionLost(_)));

        let stats = pool.stats();
        assert_eq!(stats.pool_size, 0);
        assert_eq!(stats.operations_failed, 1);

        // The slot was given back, so the store recovering is enough.
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn broken_connection_discarded_on_release() {
        let pool = pool(1);
        let lease = pool.acquire().expect("acquire");
        pool.manager().kill(lease.serial);
        assert_eq!(lease.release(), Released::Discarded);

        let stats = pool.stats();
        assert_eq!(stats.pool_size, 0);
        assert_eq!(stats.idle_connections, 0);
    }

    #[test]
    fn failed_operations_counted_on_release() {
        let pool = pool(1);
        let mut lease = pool.acquire().expect("acquire");
        lease.mark_failed();
        drop(lease);
        pool.acquire().expect("acquire").release();

        let stats = pool.stats();
        assert_eq!(stats.operations_failed, 1);
        assert_eq!(stats.operations_completed, 1);
    }

    #[test]
    fn idle_connections_expire_after_ttl() {
        let pool = ConnectionPool::with_limits(
            FakeManager::default(),
            2,
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        pool.acquire().expect("acquire").release();
        assert_eq!(pool.stats().idle_connections, 1);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.stats().pool_size, 0);

        let lease = pool.acquire().expect("acquire");
        assert_eq!(lease.serial, 1);
    }

    #[test]
    fn acquire_after_close_fails() {
        let pool = pool(2);
        pool.acquire().expect("acquire").release();
        pool.close();

        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(StoreError::PoolClosed)));
        assert_eq!(pool.stats().pool_size, 0);
    }

    #[test]
    fn close_waits_for_outstanding_leases() {
        let pool = pool(2);
        let lease = pool.acquire().expect("acquire");
        let returned = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                returned.store(true, Ordering::SeqCst);
                assert_eq!(lease.release(), Released::Discarded);
            });
            pool.close();
            assert!(returned.load(Ordering::SeqCst));
        });
        assert_eq!(pool.stats().pool_size, 0);
    }
}
