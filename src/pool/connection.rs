//! Bounded pool of duplex connections to a single backend
//!
//! This module provides `ConnectionPool`, which:
//! - Creates connections lazily through a pluggable `Connector`
//! - Never holds more than `max_size` connections (idle + checked out)
//! - Warms up toward `min_size` at the start of each `acquire`
//! - Drops connections whose peer has gone away instead of handing them out
//!
//! Idle connections are served in FIFO order. When every connection is
//! checked out and the bound is reached, `acquire` waits for a release.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::ops::{Deref, DerefMut};
#[cfg(unix)]
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[cfg(unix)]
use super::connector::UnixConnector;
use super::connector::{Connector, EndpointConnector, TcpConnector};
use super::stream::{Connection, ConnectionId};
use super::ConnArgs;
use crate::config::{Config, Endpoint};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to connect to backend: {0}")]
    Connect(#[from] io::Error),

    #[error("Connection {0} is not checked out from this pool")]
    NotCheckedOut(ConnectionId),
}

impl PoolError {
    /// The underlying transport error, if this is a connect failure
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            PoolError::Connect(e) => Some(e),
            PoolError::NotCheckedOut(_) => None,
        }
    }
}

/// Size bounds for a connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections to keep warm
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Hard cap on idle + checked-out connections
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
        }
    }
}

impl PoolConfig {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self { min_size, max_size }
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle connections waiting in the queue
    pub idle: usize,

    /// Connections currently checked out
    pub in_use: usize,

    /// Connects in flight that hold a reserved slot
    pub pending: usize,

    /// Callers parked waiting for an idle connection
    pub waiting: usize,

    /// Connections successfully created
    pub total_created: u64,

    /// Checkouts of a connection that had been checked out before
    pub total_reused: u64,

    /// Connections destroyed because their peer went away
    pub stale_evicted: u64,

    /// Connector calls that failed
    pub failed_attempts: u64,
}

struct PoolState<S> {
    idle: VecDeque<Connection<S>>,
    in_use: HashSet<ConnectionId>,
    pending: usize,
    /// Tasks parked in the idle wait
    waiters: usize,
    /// Freed slots handed to parked tasks so they may connect themselves
    slot_grants: usize,
}

impl<S> PoolState<S> {
    fn size(&self) -> usize {
        self.idle.len() + self.in_use.len()
    }

    /// Record that capacity was given back. Returns true if a waiter should be woken.
    fn free_slot(&mut self) -> bool {
        if self.waiters > self.slot_grants {
            self.slot_grants += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Counters {
    total_created: AtomicU64,
    total_reused: AtomicU64,
    stale_evicted: AtomicU64,
    failed_attempts: AtomicU64,
}

struct Inner<C: Connector> {
    connector: C,
    args: ConnArgs,
    min_size: usize,
    max_size: usize,
    state: Mutex<PoolState<C::Stream>>,
    /// Signalled when an idle connection is queued or a slot is freed
    available: Notify,
    counters: Counters,
}

/// Where a freshly created connection goes once its reservation commits
enum Placement {
    Idle,
    CheckedOut,
}

/// What a task waiting on the idle queue got
enum Next<S> {
    Idle(Connection<S>),
    SlotFreed,
}

/// Outcome of a creation attempt
enum Created<S> {
    /// Queued as idle
    Queued,

    /// Handed straight to the caller
    CheckedOut(Connection<S>),

    /// Connected, but the bound was reached in the meantime; dropped
    Surplus,

    /// No slot left; the connector was not called
    AtCapacity,
}

/// A creation slot counted against `max_size` while a connect is in flight.
///
/// Dropping it without committing gives the slot back, so a failed or
/// cancelled connect never leaks capacity.
struct Reservation<'a, C: Connector> {
    inner: &'a Inner<C>,
    committed: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
    fn try_new(inner: &'a Inner<C>) -> Option<Self> {
        let mut state = inner.state.lock();
        if state.size() + state.pending >= inner.max_size {
            return None;
        }
        state.pending += 1;
        Some(Self {
            inner,
            committed: false,
        })
    }

    /// Turn the reserved slot into a real pool entry, re-checking the bound
    fn commit(
        mut self,
        mut conn: Connection<C::Stream>,
        placement: Placement,
    ) -> Created<C::Stream> {
        let mut state = self.inner.state.lock();
        state.pending -= 1;
        self.committed = true;

        if state.size() >= self.inner.max_size {
            drop(state);
            warn!(
                id = %conn.id(),
                max_size = self.inner.max_size,
                "Pool bound reached while connecting, discarding connection"
            );
            return Created::Surplus;
        }

        match placement {
            Placement::Idle => {
                state.idle.push_back(conn);
                drop(state);
                self.inner.available.notify_one();
                Created::Queued
            }
            Placement::CheckedOut => {
                state.in_use.insert(conn.id());
                conn.mark_checked_out();
                Created::CheckedOut(conn)
            }
        }
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.committed {
            let wake = {
                let mut state = self.inner.state.lock();
                state.pending -= 1;
                state.free_slot()
            };
            if wake {
                self.inner.available.notify_one();
            }
        }
    }
}

/// Counts a task as parked in the idle wait for as long as it lives
struct Waiter<'a, C: Connector> {
    inner: &'a Inner<C>,
    woken: bool,
}

impl<C: Connector> Drop for Waiter<'_, C> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.waiters -= 1;
        // A cancelled waiter must not leave grants nobody is waiting for
        if !self.woken && state.slot_grants > state.waiters {
            state.slot_grants = state.waiters;
        }
    }
}

/// A bounded pool of reusable duplex connections
///
/// Cloning the pool is cheap; clones share the same connections.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionPool<TcpConnector> {
    /// Create a pool of TCP connections to `host:port`
    pub fn tcp(host: impl Into<String>, port: u16, config: PoolConfig) -> Self {
        let args = ConnArgs::new().with("host", host.into()).with("port", port);
        Self::with_connector(TcpConnector, args, config)
    }
}

#[cfg(unix)]
impl ConnectionPool<UnixConnector> {
    /// Create a pool of Unix domain socket connections to `path`
    pub fn unix(path: impl AsRef<Path>, config: PoolConfig) -> Self {
        let args = ConnArgs::new().with("path", path.as_ref().to_string_lossy().into_owned());
        Self::with_connector(UnixConnector, args, config)
    }
}

impl ConnectionPool<EndpointConnector> {
    /// Create a pool for the endpoint described by a loaded configuration
    pub fn from_config(config: &Config) -> Self {
        let mut args = ConnArgs::new();
        let connector = match &config.endpoint {
            Endpoint::Tcp { host, port } => {
                args.set("host", host.clone());
                args.set("port", *port);
                EndpointConnector::Tcp(TcpConnector)
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                args.set("path", path.to_string_lossy().into_owned());
                EndpointConnector::Unix(UnixConnector)
            }
        };
        // Endpoint fields win over same-named entries in conn_args
        args.merge_defaults(&config.conn_args);
        Self::with_connector(connector, args, config.pool)
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool that opens connections with a custom connector
    pub fn with_connector(connector: C, args: ConnArgs, config: PoolConfig) -> Self {
        if config.min_size > config.max_size {
            warn!(
                min_size = config.min_size,
                max_size = config.max_size,
                "Pool min_size exceeds max_size, warm-up stops at max_size"
            );
        }

        Self {
            inner: Arc::new(Inner {
                connector,
                args,
                min_size: config.min_size,
                max_size: config.max_size,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashSet::new(),
                    pending: 0,
                    waiters: 0,
                    slot_grants: 0,
                }),
                available: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Check out a healthy connection, creating one if the pool needs it.
    ///
    /// Before selecting, the pool is warmed up: while it is empty or below
    /// `min_size`, new connections are created and queued until the bound
    /// stops it. Selection then takes idle connections in FIFO order, waiting
    /// if none is idle, and replaces any it finds stale.
    ///
    /// Connector failures are returned as `PoolError::Connect` without retry.
    pub async fn acquire(&self) -> Result<Connection<C::Stream>, PoolError> {
        loop {
            let size = self.size();
            if size != 0 && size >= self.inner.min_size {
                break;
            }
            if !matches!(self.create_connection(Placement::Idle).await?, Created::Queued) {
                break;
            }
        }

        loop {
            let mut conn = match self.next_idle().await {
                Next::Idle(conn) => conn,
                Next::SlotFreed => {
                    if let Created::CheckedOut(conn) =
                        self.create_connection(Placement::CheckedOut).await?
                    {
                        return Ok(conn);
                    }
                    continue;
                }
            };

            if conn.is_stale() {
                debug!(
                    id = %conn.id(),
                    state = ?conn.read_state(),
                    "Discarding stale idle connection"
                );
                self.inner.state.lock().in_use.remove(&conn.id());
                self.inner.counters.stale_evicted.fetch_add(1, Ordering::Relaxed);
                drop(conn);

                match self.create_connection(Placement::CheckedOut).await? {
                    Created::CheckedOut(fresh) => return Ok(fresh),
                    _ => continue,
                }
            }

            if conn.use_count() > 0 {
                self.inner.counters.total_reused.fetch_add(1, Ordering::Relaxed);
            }
            conn.mark_checked_out();
            debug!(
                id = %conn.id(),
                use_count = conn.use_count(),
                age_ms = conn.age().as_millis() as u64,
                "Checked out idle connection"
            );
            return Ok(conn);
        }
    }

    /// Check out a connection wrapped in a guard that releases it on drop
    pub async fn get(&self) -> Result<PooledConnection<C>, PoolError> {
        let conn = self.acquire().await?;
        Ok(PooledConnection {
            pool: self.clone(),
            conn: Some(conn),
        })
    }

    /// Return a checked-out connection to the pool.
    ///
    /// Connections whose read side has seen end-of-stream or an error are
    /// destroyed instead of being queued again.
    pub fn release(&self, mut conn: Connection<C::Stream>) -> Result<(), PoolError> {
        let stale = conn.is_stale();
        let mut state = self.inner.state.lock();

        if !state.in_use.remove(&conn.id()) {
            drop(state);
            warn!(id = %conn.id(), "Released connection is not checked out from this pool");
            return Err(PoolError::NotCheckedOut(conn.id()));
        }

        let wake = if stale {
            let wake = state.free_slot();
            drop(state);
            self.inner.counters.stale_evicted.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %conn.id(),
                state = ?conn.read_state(),
                "Destroying stale connection on release"
            );
            drop(conn);
            wake
        } else {
            state.idle.push_back(conn);
            drop(state);
            true
        };

        if wake {
            self.inner.available.notify_one();
        }
        Ok(())
    }

    /// Destroy a checked-out connection, for callers that hit a fatal error on it
    pub fn discard(&self, conn: Connection<C::Stream>) -> Result<(), PoolError> {
        let wake = {
            let mut state = self.inner.state.lock();
            if !state.in_use.remove(&conn.id()) {
                drop(state);
                warn!(id = %conn.id(), "Discarded connection is not checked out from this pool");
                return Err(PoolError::NotCheckedOut(conn.id()));
            }
            state.free_slot()
        };

        debug!(id = %conn.id(), "Discarding connection at caller request");
        drop(conn);
        if wake {
            self.inner.available.notify_one();
        }
        Ok(())
    }

    /// Close every idle connection. Checked-out connections are untouched.
    pub async fn clear(&self) {
        let (drained, wake) = {
            let mut state = self.inner.state.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            let mut wake = 0;
            for _ in &drained {
                if state.free_slot() {
                    wake += 1;
                }
            }
            (drained, wake)
        };
        for _ in 0..wake {
            self.inner.available.notify_one();
        }
        if drained.is_empty() {
            return;
        }

        info!(closed = drained.len(), "Clearing idle connections");
        for conn in drained {
            conn.close().await;
        }
    }

    /// Idle plus checked-out connections
    pub fn size(&self) -> usize {
        self.inner.state.lock().size()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().in_use.len()
    }

    pub fn min_size(&self) -> usize {
        self.inner.min_size
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Arguments passed to the connector on every connect
    pub fn conn_args(&self) -> &ConnArgs {
        &self.inner.args
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let (idle, in_use, pending, waiting) = {
            let state = self.inner.state.lock();
            (state.idle.len(), state.in_use.len(), state.pending, state.waiters)
        };
        let counters = &self.inner.counters;

        PoolStats {
            idle,
            in_use,
            pending,
            waiting,
            total_created: counters.total_created.load(Ordering::Relaxed),
            total_reused: counters.total_reused.load(Ordering::Relaxed),
            stale_evicted: counters.stale_evicted.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
        }
    }

    /// Pop the oldest idle connection, waiting until one is queued.
    ///
    /// The popped connection is moved into `in_use` under the same lock, so
    /// it is counted by `size()` while the caller checks it for staleness.
    ///
    /// A parked task also wakes when a slot it may use was freed (a stale
    /// connection destroyed, a connect failed), and then gets `SlotFreed`.
    async fn next_idle(&self) -> Next<C::Stream> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(conn) = state.idle.pop_front() {
                    state.in_use.insert(conn.id());
                    return Next::Idle(conn);
                }
                if state.slot_grants > 0 {
                    state.slot_grants -= 1;
                    return Next::SlotFreed;
                }
                state.waiters += 1;
            }

            let mut waiter = Waiter {
                inner: &self.inner,
                woken: false,
            };
            notified.await;
            waiter.woken = true;
        }
    }

    /// Open a new connection if the pool bound allows it.
    ///
    /// The slot is reserved before connecting, so concurrent creations can
    /// never push the pool past `max_size`.
    async fn create_connection(
        &self,
        placement: Placement,
    ) -> Result<Created<C::Stream>, PoolError> {
        let Some(reservation) = Reservation::try_new(&self.inner) else {
            debug!(max_size = self.inner.max_size, "Pool at capacity, not connecting");
            return Ok(Created::AtCapacity);
        };

        let stream = match self.inner.connector.connect(&self.inner.args).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to open connection");
                return Err(PoolError::Connect(e));
            }
        };

        let conn = Connection::new(stream);
        let id = conn.id();
        let created = reservation.commit(conn, placement);

        if !matches!(created, Created::Surplus) {
            let total = self.inner.counters.total_created.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                id = %id,
                size = self.size(),
                max_size = self.inner.max_size,
                total_created = total,
                "Created new connection"
            );
        }

        Ok(created)
    }
}

/// A checked-out connection that goes back to its pool when dropped
pub struct PooledConnection<C: Connector> {
    pool: ConnectionPool<C>,
    conn: Option<Connection<C::Stream>>,
}

impl<C: Connector> PooledConnection<C> {
    /// Destroy the connection instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.pool.discard(conn);
        }
    }

    /// Take the connection out of the guard.
    ///
    /// It stays checked out; hand it back with `ConnectionPool::release`.
    pub fn detach(mut self) -> Connection<C::Stream> {
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("guard always holds its connection until consumed"),
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = Connection<C::Stream>;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("guard always holds its connection until consumed"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("guard always holds its connection until consumed"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// In-memory backend that hands out duplex pairs and keeps the server ends
    #[derive(Clone, Default)]
    struct TestBackend {
        calls: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
        delay: Duration,
        peers: Arc<Mutex<Vec<DuplexStream>>>,
    }

    impl TestBackend {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn take_peers(&self) -> Vec<DuplexStream> {
            std::mem::take(&mut *self.peers.lock())
        }
    }

    impl Connector for TestBackend {
        type Stream = DuplexStream;

        async fn connect(&self, _args: &ConnArgs) -> io::Result<DuplexStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "backend down"));
            }
            let (client, server) = duplex(1024);
            self.peers.lock().push(server);
            Ok(client)
        }
    }

    fn pool(backend: &TestBackend, min_size: usize, max_size: usize) -> ConnectionPool<TestBackend> {
        ConnectionPool::with_connector(
            backend.clone(),
            ConnArgs::new(),
            PoolConfig::new(min_size, max_size),
        )
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 1);
        assert_eq!(config.max_size, 10);
    }

    #[test]
    fn test_from_config_endpoint_overrides_conn_args() {
        let mut config = Config::new(Endpoint::Tcp {
            host: "10.0.0.5".to_string(),
            port: 11211,
        });
        config.conn_args = ConnArgs::new()
            .with("host", "ignored.example.com")
            .with("nodelay", false);

        let pool = ConnectionPool::from_config(&config);
        let args = pool.conn_args();

        assert_eq!(args.require_str("host").unwrap(), "10.0.0.5");
        assert_eq!(args.require_int("port").unwrap(), 11211);
        assert_eq!(args.get_bool("nodelay").unwrap(), Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_checked_out_connection_counted_during_stale_check() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 1);

        let conn = pool.acquire().await.unwrap();
        pool.release(conn).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let conn = pool.acquire().await.unwrap();
                    {
                        let state = pool.inner.state.lock();
                        assert!(state.in_use.contains(&conn.id()));
                        assert!(state.size() + state.pending <= 1);
                    }
                    pool.release(conn).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(backend.calls(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_first_acquire_connects_once() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 2);

        let conn = pool.acquire().await.unwrap();

        assert_eq!(backend.calls(), 1);
        assert_eq!(conn.use_count(), 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_reaches_min_size() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 3, 5);

        let _conn = pool.acquire().await.unwrap();

        assert_eq!(backend.calls(), 3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.in_use_count(), 1);
    }

    #[tokio::test]
    async fn test_warm_up_stops_at_max_size() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 4, 2);

        let _conn = pool.acquire().await.unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_release_makes_connection_reusable() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 2);

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn).unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(conn.use_count(), 2);
        assert_eq!(backend.calls(), 1);

        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_reused, 1);
    }

    #[tokio::test]
    async fn test_connector_failure_propagates() {
        let backend = TestBackend::default();
        backend.set_failing(true);
        let pool = pool(&backend, 1, 2);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(_)));
        assert_eq!(
            err.io_error().map(|e| e.kind()),
            Some(io::ErrorKind::ConnectionRefused)
        );

        // No retry, and the failed attempt left nothing behind
        assert_eq!(backend.calls(), 1);
        let stats = pool.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed_attempts, 1);
        assert_eq!(pool.size(), 0);

        backend.set_failing(false);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 1);
        pool.release(conn).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_returns_reservation() {
        let backend = TestBackend::with_delay(Duration::from_secs(5));
        let pool = pool(&backend, 1, 1);

        let result = tokio::time::timeout(Duration::from_millis(100), pool.acquire()).await;
        assert!(result.is_err());
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(pool.size(), 0);

        // The slot is usable again
        let conn = pool.acquire().await.unwrap();
        assert_eq!(backend.calls(), 2);
        pool.release(conn).unwrap();
    }

    #[tokio::test]
    async fn test_release_foreign_connection() {
        let backend = TestBackend::default();
        let pool_a = pool(&backend, 1, 1);
        let pool_b = pool(&backend, 1, 1);

        let _held = pool_a.acquire().await.unwrap();
        let foreign = pool_b.acquire().await.unwrap();
        let foreign_id = foreign.id();

        let err = pool_a.release(foreign).unwrap_err();
        assert!(matches!(err, PoolError::NotCheckedOut(id) if id == foreign_id));
        assert_eq!(pool_a.in_use_count(), 1);
        assert_eq!(pool_a.idle_count(), 0);
        assert_eq!(pool_b.in_use_count(), 1);
    }

    #[tokio::test]
    async fn test_release_stale_connection_destroys_it() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 1);

        let conn = pool.acquire().await.unwrap();
        drop(backend.take_peers());
        pool.release(conn).unwrap();

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().stale_evicted, 1);
    }

    #[tokio::test]
    async fn test_discard_frees_capacity() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 1);

        let conn = pool.acquire().await.unwrap();
        pool.discard(conn).unwrap();
        assert_eq!(pool.size(), 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(backend.calls(), 2);
        let id = conn.id();
        pool.discard(conn).unwrap();

        // A connection this pool never handed out
        let (stream, _peer) = duplex(8);
        let mut stray = Connection::new(stream);
        assert_ne!(stray.id(), id);
        assert!(!stray.is_stale());
        assert!(matches!(
            pool.discard(stray),
            Err(PoolError::NotCheckedOut(_))
        ));
    }

    #[tokio::test]
    async fn test_pooled_connection_guard() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 2);

        {
            let guard = pool.get().await.unwrap();
            assert_eq!(guard.use_count(), 1);
            assert_eq!(pool.in_use_count(), 1);
        }
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        let guard = pool.get().await.unwrap();
        guard.discard();
        assert_eq!(pool.size(), 0);

        let guard = pool.get().await.unwrap();
        let conn = guard.detach();
        assert_eq!(pool.in_use_count(), 1);
        pool.release(conn).unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_closes_idle_only() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 3, 3);

        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 3);

        pool.clear().await;
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use_count(), 1);

        // Idempotent
        pool.clear().await;
        assert_eq!(pool.size(), 1);

        // FIFO: the first connection created is the one checked out,
        // the other two were shut down
        let mut peers = backend.take_peers();
        for peer in peers.iter_mut().skip(1) {
            let mut buf = Vec::new();
            assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
        }

        pool.release(held).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_waiter_recovers_when_held_connection_goes_stale() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 1);

        let held = pool.acquire().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });

        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());

        drop(backend.take_peers());
        let held_id = held.id();
        pool.release(held).unwrap();

        let conn = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should not stall")
            .unwrap()
            .unwrap();
        assert_ne!(conn.id(), held_id);
        assert_eq!(backend.calls(), 2);
        assert_eq!(pool.size(), 1);

        let state = pool.inner.state.lock();
        assert_eq!(state.waiters, 0);
        assert_eq!(state.slot_grants, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_grant() {
        let backend = TestBackend::default();
        let pool = pool(&backend, 1, 1);

        let held = pool.acquire().await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(result.is_err());

        {
            let state = pool.inner.state.lock();
            assert_eq!(state.waiters, 0);
            assert_eq!(state.slot_grants, 0);
        }

        pool.discard(held).unwrap();
        let state = pool.inner.state.lock();
        assert_eq!(state.slot_grants, 0);
    }
}
