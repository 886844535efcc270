//! Generic connection pool for reusable connections
//!
//! Provides bounded connection reuse with keepalive limits, idle timeouts,
//! health checking, and retried execution with exponential backoff.
//!
//! Connections are leased as [`PoolHandle`]s. A handle is never shared while
//! leased, and its slot is always returned to the pool: either explicitly
//! through [`ConnectionPool::release`], or on drop, in which case the
//! connection is assumed broken and discarded.

use super::error::ResilienceError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Smoothing factor for the response time moving average
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + leased)
    pub max_connections: usize,
    /// Maximum number of idle connections kept for reuse
    pub max_keepalive: usize,
    /// Maximum time a connection can remain idle before being closed
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime of a connection
    pub max_lifetime: Option<Duration>,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
    /// Timeout for a single attempt inside [`ConnectionPool::execute`]
    pub request_timeout: Duration,
    /// Number of retries after the first failed attempt
    pub retry_count: usize,
    /// Base of the exponential backoff: `backoff_factor * 2^attempt`
    pub backoff_factor: Duration,
    /// Upper bound for a single backoff delay
    pub max_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_keepalive: 50,
            idle_timeout: Some(Duration::from_secs(300)), // 5 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            acquire_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            retry_count: 3,
            backoff_factor: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Delay before retry number `attempt + 1` (attempts are counted from 0)
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.backoff_factor.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a connection is still healthy
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup)
    fn close(&self, conn: T) {
        drop(conn);
    }
}

/// A connection waiting in the idle set
#[derive(Debug)]
struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl<T> IdleConnection<T> {
    fn is_expired(&self, config: &PoolConfig) -> bool {
        if let Some(idle_timeout) = config.idle_timeout {
            if self.last_used.elapsed() > idle_timeout {
                return true;
            }
        }
        exceeds_lifetime(self.created_at, config)
    }
}

fn exceeds_lifetime(created_at: Instant, config: &PoolConfig) -> bool {
    config
        .max_lifetime
        .map(|max| created_at.elapsed() > max)
        .unwrap_or(false)
}

/// Internal pool state
struct PoolState<T> {
    idle: Vec<IdleConnection<T>>,
    active_count: usize,
}

struct PoolShared<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    semaphore: Arc<Semaphore>,
    total_requests: AtomicU64,
    errors: AtomicU64,
    avg_response_time: Mutex<f64>,
}

impl<T: Send + 'static> PoolShared<T> {
    /// Return a leased connection to the idle set, or close it
    fn check_in(&self, conn: T, created_at: Instant, use_count: u64, healthy: bool) {
        let mut state = self.state.lock();
        state.active_count = state.active_count.saturating_sub(1);

        let keep = healthy
            && state.idle.len() < self.config.max_keepalive
            && !exceeds_lifetime(created_at, &self.config)
            && !self.semaphore.is_closed();

        if keep {
            state.idle.push(IdleConnection {
                conn,
                created_at,
                last_used: Instant::now(),
                use_count,
            });
        } else {
            drop(state);
            self.factory.close(conn);
        }
    }
}

/// A leased connection
///
/// Dereferences to the underlying connection. Dropping a handle without
/// calling [`ConnectionPool::release`] discards the connection.
pub struct PoolHandle<T: Send + 'static> {
    conn: Option<T>,
    created_at: Instant,
    acquired_at: Instant,
    use_count: u64,
    owner: Option<String>,
    pool: Arc<PoolShared<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> PoolHandle<T> {
    /// When this lease started
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// How many times the underlying connection has been leased, this lease included
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Caller that holds the lease, if one was named
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    fn finish(&mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .check_in(conn, self.created_at, self.use_count, healthy);
        }
    }
}

impl<T: Send + 'static> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `conn` is only taken by `finish`, after which the handle is gone
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pool handle used after release"))
    }
}

impl<T: Send + 'static> DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pool handle used after release"))
    }
}

impl<T: Send + 'static> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            debug!("pool handle dropped without release, discarding connection");
            self.finish(false);
        }
    }
}

impl<T: Send + Debug + 'static> Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("conn", &self.conn)
            .field("use_count", &self.use_count)
            .field("owner", &self.owner)
            .finish()
    }
}

/// A generic connection pool
///
/// # Example
/// ```no_run
/// use dispatch_core_resilience::{ConnectionPool, PoolConfig, ConnectionFactory, ResilienceError};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[derive(Clone)]
/// # struct MyConnection { id: usize }
/// struct MyConnectionFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<MyConnection> for MyConnectionFactory {
///     async fn create(&self) -> Result<MyConnection, ResilienceError> {
///         Ok(MyConnection { id: 1 })
///     }
///
///     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(Arc::new(MyConnectionFactory), PoolConfig::default());
///
/// let conn = pool.acquire(Duration::from_secs(1)).await?;
/// // Use connection...
/// pool.release(conn, true);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a new connection pool
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let max_connections = config.max_connections;
        Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    active_count: 0,
                }),
                semaphore: Arc::new(Semaphore::new(max_connections)),
                total_requests: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                avg_response_time: Mutex::new(0.0),
            }),
        }
    }

    /// Create a connection pool with default configuration
    pub fn new_default(factory: Arc<dyn ConnectionFactory<T>>) -> Self {
        Self::new(factory, PoolConfig::default())
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire a connection, waiting at most `timeout` for a free slot.
    ///
    /// Idle connections are reused when healthy; otherwise a new connection
    /// is created. A saturated pool fails with `PoolExhausted` once the
    /// timeout passes instead of queueing indefinitely.
    pub async fn acquire(&self, timeout: Duration) -> Result<PoolHandle<T>, ResilienceError> {
        self.acquire_inner(None, timeout).await
    }

    /// Like [`acquire`](Self::acquire), recording `owner` on the lease
    pub async fn acquire_for(
        &self,
        owner: impl Into<String>,
        timeout: Duration,
    ) -> Result<PoolHandle<T>, ResilienceError> {
        self.acquire_inner(Some(owner.into()), timeout).await
    }

    async fn acquire_inner(
        &self,
        owner: Option<String>,
        timeout: Duration,
    ) -> Result<PoolHandle<T>, ResilienceError> {
        let semaphore = Arc::clone(&self.shared.semaphore);
        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| ResilienceError::PoolExhausted(timeout))?
            .map_err(|_| ResilienceError::PoolExhausted(timeout))?;

        // Try to reuse an idle connection
        loop {
            let (candidate, expired) = {
                let mut state = self.shared.state.lock();
                let config = &self.shared.config;
                let (expired, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                    .into_iter()
                    .partition(|conn| conn.is_expired(config));
                state.idle = fresh;
                (state.idle.pop(), expired)
            };

            for stale in expired {
                self.shared.factory.close(stale.conn);
            }

            let Some(idle) = candidate else { break };

            if self.shared.factory.is_healthy(&idle.conn).await {
                self.shared.state.lock().active_count += 1;
                return Ok(PoolHandle {
                    conn: Some(idle.conn),
                    created_at: idle.created_at,
                    acquired_at: Instant::now(),
                    use_count: idle.use_count + 1,
                    owner,
                    pool: Arc::clone(&self.shared),
                    _permit: permit,
                });
            }

            debug!("discarding unhealthy idle connection");
            self.shared.factory.close(idle.conn);
        }

        // No idle connections, create a new one. The permit is released on
        // error when it goes out of scope.
        let conn = self.shared.factory.create().await?;
        self.shared.state.lock().active_count += 1;

        let now = Instant::now();
        Ok(PoolHandle {
            conn: Some(conn),
            created_at: now,
            acquired_at: now,
            use_count: 1,
            owner,
            pool: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Return a connection to the pool.
    ///
    /// Healthy connections go back to the idle set unless it already holds
    /// `max_keepalive` connections; unhealthy ones are discarded.
    pub fn release(&self, mut handle: PoolHandle<T>, healthy: bool) {
        handle.finish(healthy);
    }

    /// Run `op` against a pooled connection, retrying transient failures.
    ///
    /// Each attempt leases a fresh handle and is bounded by `request_timeout`.
    /// After a transient failure the handle is discarded and the next attempt
    /// waits `backoff_factor * 2^attempt` (capped at `max_backoff`). The last
    /// error is returned once `retry_count` retries are used up.
    pub async fn execute<R, F>(&self, op: F) -> Result<R, ResilienceError>
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<R, ResilienceError>>,
    {
        let config = &self.shared.config;
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            let outcome = match self.acquire(config.acquire_timeout).await {
                Ok(mut handle) => {
                    let result =
                        match tokio::time::timeout(config.request_timeout, op(&mut *handle)).await {
                            Ok(result) => result,
                            Err(_) => Err(ResilienceError::Timeout(config.request_timeout)),
                        };
                    let healthy = match &result {
                        Ok(_) => true,
                        Err(e) => !e.is_transient(),
                    };
                    self.release(handle, healthy);
                    result
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => {
                    self.record_request(started.elapsed(), true);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < config.retry_count => {
                    let delay = config.backoff_delay(attempt);
                    debug!(attempt, ?delay, error = %e, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!(attempts = attempt + 1, error = %e, "giving up after retries");
                    }
                    self.record_request(started.elapsed(), false);
                    return Err(e);
                }
            }
        }
    }

    fn record_request(&self, elapsed: Duration, success: bool) {
        self.shared.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.shared.errors.fetch_add(1, Ordering::Relaxed);
        }

        let mut avg = self.shared.avg_response_time.lock();
        *avg = RESPONSE_TIME_ALPHA * elapsed.as_secs_f64() + (1.0 - RESPONSE_TIME_ALPHA) * *avg;
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let (idle, active) = {
            let state = self.shared.state.lock();
            (state.idle.len(), state.active_count)
        };

        PoolStats {
            idle,
            active,
            pool_size: idle + active,
            max_size: self.shared.config.max_connections,
            requests: self.shared.total_requests.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            avg_response_time: *self.shared.avg_response_time.lock(),
        }
    }

    /// Close all idle connections
    pub fn clear_idle(&self) {
        let idle = std::mem::take(&mut self.shared.state.lock().idle);
        for pooled in idle {
            self.shared.factory.close(pooled.conn);
        }
    }

    /// Stop handing out connections and close the idle set.
    ///
    /// Leased handles stay valid; they are closed when released.
    pub fn close(&self) {
        self.shared.semaphore.close();
        self.clear_idle();
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Number of idle connections
    pub idle: usize,
    /// Number of leased connections
    pub active: usize,
    /// Total connections (idle + active)
    pub pool_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Requests run through `execute`
    pub requests: u64,
    /// Requests that failed after all retries
    pub errors: u64,
    /// Moving average of request latency in seconds
    pub avg_response_time: f64,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.pool_size as f64 / self.max_size as f64) * 100.0
        }
    }
}
