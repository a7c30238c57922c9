//! Bounded pool of credential-bound connections.
//!
//! Each connection is opened with a freshly fetched access token and is only
//! trusted for `token_ttl`; older connections are closed instead of being handed
//! out. Bookkeeping lives behind one `std::sync::Mutex` that is never held across
//! an `.await`: token fetches, connects and closes all run outside it.
//!
//! # Usage
//!
//! ```ignore
//! let (mut conn, waited) = pool.acquire().await?;
//! let result = conn.fetch_rows(sql, &params, timeout).await;
//! conn.release(result.is_err()).await;
//! ```
//!
//! A [`PooledConnection`] dropped without `release` is treated as failed: its
//! slot is freed immediately and the handle is closed on a spawned task.

use crate::credentials::{Credential, CredentialProvider};
use crate::error::{LookupError, LookupResult};
use schemars::JsonSchema;
use serde::Serialize;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const DEREF_ERR: &str = "BUG: PooledConnection used after release";

/// Opens and closes the handles a [`ConnectionPool`] manages.
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a handle authenticated with `credential`.
    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = LookupResult<Self::Connection>> + Send;

    /// Close a handle. Failures are logged by the implementation, not returned.
    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send;
}

/// Pool sizing and lifetime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum live connections. 0 disables pooling.
    pub max_size: usize,
    /// Age after which a connection's token is no longer trusted.
    pub token_ttl: Duration,
    /// How long `acquire` waits for a release. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct PoolStatus {
    /// Configured maximum (0 = unpooled)
    pub max_size: usize,
    /// Live connections, idle plus checked out
    pub live: usize,
    /// Connections waiting in the pool
    pub idle: usize,
    /// Connections currently checked out
    pub in_use: usize,
    /// Connections opened since start
    pub total_created: u64,
    /// Acquisitions served by an idle connection
    pub total_reused: u64,
    /// Connections closed since start
    pub total_disposed: u64,
    /// Connections closed because their token expired
    pub total_expired: u64,
    /// Acquisitions that gave up waiting
    pub total_timeouts: u64,
}

struct Idle<T> {
    conn: T,
    created_at: Instant,
}

struct PoolState<T> {
    /// LIFO: the most recently released connection is reused first.
    available: Vec<Idle<T>>,
    /// Idle plus checked-out connections, including slots reserved for creation.
    created: usize,
    closed: bool,
}

impl<T> PoolState<T> {
    fn forget_slot(&mut self) {
        if self.created == 0 {
            warn!("Pool slot count underflow prevented: created is already 0");
        } else {
            self.created -= 1;
        }
    }
}

#[derive(Default)]
struct PoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    disposed: AtomicU64,
    expired: AtomicU64,
    timeouts: AtomicU64,
}

enum Step<'a, C: Connector> {
    Reuse(Idle<C::Connection>),
    Create(SlotReservation<'a, C>),
    Wait,
}

/// Bounded, token-aware connection pool.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    credentials: Arc<CredentialProvider>,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    released: Notify,
    stats: PoolStats,
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, credentials: Arc<CredentialProvider>, config: PoolConfig) -> Self {
        Self {
            connector,
            credentials,
            state: Mutex::new(PoolState {
                available: Vec::with_capacity(config.max_size),
                created: 0,
                closed: false,
            }),
            config,
            released: Notify::new(),
            stats: PoolStats::default(),
        }
    }


    fn state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection, waiting up to the configured acquire timeout.
    ///
    /// Returns the connection and the time spent acquiring it.
    pub async fn acquire(self: &Arc<Self>) -> LookupResult<(PooledConnection<C>, Duration)> {
        let deadline = self.config.acquire_timeout.map(|t| Instant::now() + t);
        self.acquire_until(deadline).await
    }

    /// Check out a connection, failing with `PoolExhausted` at `deadline`.
    pub async fn acquire_with_deadline(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> LookupResult<(PooledConnection<C>, Duration)> {
        self.acquire_until(Some(deadline)).await
    }

    async fn acquire_until(
        self: &Arc<Self>,
        deadline: Option<Instant>,
    ) -> LookupResult<(PooledConnection<C>, Duration)> {
        let start = Instant::now();

        loop {
            // Register for a wakeup before inspecting state so a release that
            // lands between the check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Everything decided here is settled before the next await: a reserved
            // slot is owned by its guard and stale handles are closed off-task, so
            // dropping this future at any await leaves the counts consistent.
            let step = {
                let mut state = self.state();
                if state.closed {
                    return Err(LookupError::connection(
                        "Connection pool is closed",
                        "The server is shutting down",
                    ));
                }

                let mut reuse = None;
                while let Some(idle) = state.available.pop() {
                    if idle.created_at.elapsed() >= self.config.token_ttl {
                        state.forget_slot();
                        self.stats.expired.fetch_add(1, Ordering::Relaxed);
                        self.dispose_detached(idle.conn, "expired");
                    } else {
                        reuse = Some(idle);
                        break;
                    }
                }

                match reuse {
                    Some(idle) => Step::Reuse(idle),
                    None if self.config.max_size == 0 || state.created < self.config.max_size => {
                        state.created += 1;
                        Step::Create(SlotReservation { pool: self })
                    }
                    None => Step::Wait,
                }
            };

            match step {
                Step::Reuse(idle) => {
                    self.stats.reused.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        age_ms = idle.created_at.elapsed().as_millis() as u64,
                        "Reusing pooled connection"
                    );
                    return Ok((PooledConnection::new(Arc::clone(self), idle), start.elapsed()));
                }
                Step::Create(reservation) => {
                    let idle = self.create(reservation).await?;
                    return Ok((PooledConnection::new(Arc::clone(self), idle), start.elapsed()));
                }
                Step::Wait => {
                    debug!(max_size = self.config.max_size, "Pool saturated, waiting for a release");
                    match deadline {
                        Some(deadline) => {
                            let deadline = tokio::time::Instant::from_std(deadline);
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                                let waited_ms = start.elapsed().as_millis() as u64;
                                warn!(waited_ms, "Timed out waiting for a pooled connection");
                                return Err(LookupError::PoolExhausted { waited_ms });
                            }
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    /// Open a connection into the slot `reservation` holds.
    async fn create(
        &self,
        reservation: SlotReservation<'_, C>,
    ) -> LookupResult<Idle<C::Connection>> {
        let credential = self.credentials.token().await.inspect_err(|e| {
            warn!(error = %e, "Could not obtain a database token");
        })?;

        let conn = self.connector.connect(&credential).await.inspect_err(|e| {
            warn!(error = %e, "Could not open a database connection");
        })?;

        reservation.keep();
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        info!(
            token_age_ms = credential.age().as_millis() as u64,
            "Opened new pooled connection"
        );
        Ok(Idle {
            conn,
            created_at: credential.acquired_at(),
        })
    }

    /// Close `conn` on a spawned task. Its slot must already be forgotten.
    fn dispose_detached(self: &Arc<Self>, conn: C::Connection, reason: &'static str) {
        self.stats.disposed.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "Closing connection in the background");
        self.released.notify_one();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move {
                    pool.connector.close(conn).await;
                });
            }
            Err(_) => {
                debug!("No runtime available, dropping connection without close");
            }
        }
    }

    async fn dispose(&self, conn: C::Connection, reason: &'static str) {
        self.stats.disposed.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "Closing connection");
        // The slot is already free; let a waiter claim it.
        self.released.notify_one();
        self.connector.close(conn).await;
    }

    async fn put_back(&self, idle: Idle<C::Connection>, had_error: bool) {
        let reason = if had_error {
            Some("error")
        } else if idle.created_at.elapsed() >= self.config.token_ttl {
            Some("expired")
        } else if self.config.max_size == 0 {
            Some("unpooled")
        } else {
            None
        };

        let to_close = {
            let mut state = self.state();
            match reason {
                None if !state.closed && state.available.len() < self.config.max_size => {
                    state.available.push(idle);
                    None
                }
                None => {
                    state.forget_slot();
                    Some((idle.conn, if state.closed { "closed" } else { "full" }))
                }
                Some(reason) => {
                    state.forget_slot();
                    Some((idle.conn, reason))
                }
            }
        };

        match to_close {
            Some((conn, reason)) => {
                if reason == "expired" {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                }
                self.dispose(conn, reason).await;
            }
            None => self.released.notify_one(),
        }
    }

    /// Snapshot of pool occupancy and lifetime counters.
    pub fn status(&self) -> PoolStatus {
        let (live, idle) = {
            let state = self.state();
            (state.created, state.available.len())
        };
        PoolStatus {
            max_size: self.config.max_size,
            live,
            idle,
            in_use: live.saturating_sub(idle),
            total_created: self.stats.created.load(Ordering::Relaxed),
            total_reused: self.stats.reused.load(Ordering::Relaxed),
            total_disposed: self.stats.disposed.load(Ordering::Relaxed),
            total_expired: self.stats.expired.load(Ordering::Relaxed),
            total_timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Close idle connections and refuse further acquisitions.
    ///
    /// Checked-out connections are closed as they are released.
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            let drained: Vec<_> = state.available.drain(..).collect();
            state.created = state.created.saturating_sub(drained.len());
            drained
        };
        self.released.notify_waiters();

        let count = drained.len();
        for idle in drained {
            self.dispose(idle.conn, "shutdown").await;
        }
        info!(closed = count, "Connection pool closed");
    }
}

/// Frees a reserved slot unless creation completes.
struct SlotReservation<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
}

impl<C: Connector> SlotReservation<'_, C> {
    fn keep(self) {
        std::mem::forget(self);
    }
}

impl<C: Connector> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        self.pool.state().forget_slot();
        self.pool.released.notify_one();
    }
}

/// A checked-out connection.
///
/// Call [`release`](Self::release) when done. Dropping it instead disposes the
/// connection.
pub struct PooledConnection<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    idle: Option<Idle<C::Connection>>,
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("age", &self.age())
            .field("released", &self.idle.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    fn new(pool: Arc<ConnectionPool<C>>, idle: Idle<C::Connection>) -> Self {
        Self {
            pool,
            idle: Some(idle),
        }
    }

    /// Time since this connection's token was obtained.
    pub fn age(&self) -> Duration {
        self.idle
            .as_ref()
            .map(|idle| idle.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Return the connection to the pool. `had_error` forces disposal.
    pub async fn release(mut self, had_error: bool) {
        if let Some(idle) = self.idle.take() {
            self.pool.put_back(idle, had_error).await;
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        &self.idle.as_ref().expect(DEREF_ERR).conn
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.idle.as_mut().expect(DEREF_ERR).conn
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(idle) = self.idle.take() else {
            return;
        };

        // Bookkeeping happens now; only the close is deferred.
        self.pool.state().forget_slot();
        warn!("Connection dropped without release; disposing it");
        self.pool.dispose_detached(idle.conn, "dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    struct FakeConnector {
        counters: Arc<Counters>,
        fail: bool,
    }

    impl Connector for FakeConnector {
        type Connection = usize;

        async fn connect(&self, _credential: &Credential) -> LookupResult<usize> {
            if self.fail {
                return Err(LookupError::connection("refused", "start the server"));
            }
            Ok(self.counters.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _conn: usize) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max_size: usize, ttl: Duration) -> (Arc<ConnectionPool<FakeConnector>>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let connector = FakeConnector {
            counters: counters.clone(),
            fail: false,
        };
        let credentials = Arc::new(CredentialProvider::fixed(StaticToken::new("t")));
        let pool = ConnectionPool::new(
            connector,
            credentials,
            PoolConfig {
                max_size,
                token_ttl: ttl,
                acquire_timeout: Some(Duration::from_millis(200)),
            },
        );
        (Arc::new(pool), counters)
    }

    #[tokio::test]
    async fn test_release_makes_connection_reusable() {
        let (pool, counters) = pool(2, Duration::from_secs(60));

        let (conn, _) = pool.acquire().await.unwrap();
        let first = *conn;
        conn.release(false).await;

        let (conn, _) = pool.acquire().await.unwrap();
        assert_eq!(*conn, first);
        conn.release(false).await;

        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        let status = pool.status();
        assert_eq!(status.live, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.total_reused, 1);
    }

    #[tokio::test]
    async fn test_lifo_reuse() {
        let (pool, _) = pool(2, Duration::from_secs(60));

        let (a, _) = pool.acquire().await.unwrap();
        let (b, _) = pool.acquire().await.unwrap();
        let (first, second) = (*a, *b);
        a.release(false).await;
        b.release(false).await;

        let (conn, _) = pool.acquire().await.unwrap();
        assert_eq!(*conn, second);
        assert_ne!(*conn, first);
        conn.release(false).await;
    }

    #[tokio::test]
    async fn test_error_release_disposes() {
        let (pool, counters) = pool(2, Duration::from_secs(60));

        let (conn, _) = pool.acquire().await.unwrap();
        conn.release(true).await;

        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn test_zero_max_size_never_pools() {
        let (pool, counters) = pool(0, Duration::from_secs(60));

        for _ in 0..3 {
            let (conn, _) = pool.acquire().await.unwrap();
            conn.release(false).await;
        }

        assert_eq!(counters.opened.load(Ordering::SeqCst), 3);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_saturated_acquire_times_out() {
        let (pool, _) = pool(1, Duration::from_secs(60));

        let (held, _) = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, LookupError::PoolExhausted { .. }));
        assert_eq!(pool.status().total_timeouts, 1);
        held.release(false).await;
    }

    #[tokio::test]
    async fn test_waiter_receives_released_connection() {
        let (pool, counters) = pool(1, Duration::from_secs(60));

        let (held, _) = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let (conn, waited) = pool.acquire().await?;
                conn.release(false).await;
                Ok::<_, LookupError>(waited)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release(false).await;

        let waited = waiter.await.unwrap().unwrap();
        assert!(waited >= Duration::from_millis(10));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_frees_slot() {
        let counters = Arc::new(Counters::default());
        let connector = FakeConnector {
            counters,
            fail: true,
        };
        let credentials = Arc::new(CredentialProvider::fixed(StaticToken::new("t")));
        let pool = Arc::new(ConnectionPool::new(
            connector,
            credentials,
            PoolConfig {
                max_size: 1,
                token_ttl: Duration::from_secs(60),
                acquire_timeout: Some(Duration::from_millis(50)),
            },
        ));

        for _ in 0..2 {
            let err = pool.acquire().await.unwrap_err();
            assert!(matches!(err, LookupError::ConnectionUnavailable { .. }));
        }
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn test_credential_failure_is_auth_unavailable() {
        let counters = Arc::new(Counters::default());
        let connector = FakeConnector {
            counters: counters.clone(),
            fail: false,
        };
        let credentials = Arc::new(CredentialProvider::new(|| {
            Err(LookupError::auth("no identity"))
        }));
        let pool = Arc::new(ConnectionPool::new(
            connector,
            credentials,
            PoolConfig {
                max_size: 1,
                token_ttl: Duration::from_secs(60),
                acquire_timeout: None,
            },
        ));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, LookupError::AuthUnavailable { .. }));
        assert_eq!(pool.status().live, 0);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_without_release_frees_slot() {
        let (pool, counters) = pool(1, Duration::from_secs(60));

        {
            let (_conn, _) = pool.acquire().await.unwrap();
        }
        assert_eq!(pool.status().live, 0);

        let (conn, _) = pool.acquire().await.unwrap();
        conn.release(false).await;

        tokio::task::yield_now().await;
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_drains_idle() {
        let (pool, counters) = pool(2, Duration::from_secs(60));

        let (conn, _) = pool.acquire().await.unwrap();
        conn.release(false).await;
        pool.close().await;

        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().live, 0);
        assert!(pool.acquire().await.is_err());
    }
}
