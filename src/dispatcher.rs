/*!
 * The dispatch context
 *
 * [`Dispatcher`] owns one instance of every component and runs a unit of
 * work through them in a fixed order:
 *
 * ```text
 *   capability load ─► rate limit ─► cache lookup ─┬─ hit ──────────────► value
 *                                                  └─ miss (one filler)
 *                                                       │
 *                                     breaker check ◄───┘
 *                                          │
 *                                     worker pool ─► write-through ─► value
 *                                          │
 *                                     breaker verdict
 * ```
 *
 * Callers waiting on the same fingerprint share the filler's result.
 */

use crate::cache::{CacheWarmer, SmartCache};
use crate::config::{secs, DispatchConfig};
use crate::error::{CacheError, DispatchError, Result};
use crate::fingerprint::{Fingerprint, WorkDescriptor};
use crate::monitor::{
    HealthReport, HostSampler, MonitoredComponents, PerformanceMonitor, PerformanceSnapshot,
    SysinfoSampler,
};
use crate::registry::LazyRegistry;
use crate::worker_pool::{WorkItem, WorkerPool};
use bytes::Bytes;
use dispatch_core_resilience::{
    BreakerRegistry, CircuitBreaker, ConnectionFactory, ConnectionPool, PoolStats, RateLimiter,
    ResilienceError,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What to run, against which target, and how to cache it
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    descriptor: WorkDescriptor,
    target: String,
    capability: Option<String>,
    ttl: Option<Duration>,
    cacheable: bool,
}

impl DispatchRequest {
    /// `target` identifies the downstream host or service the work talks to;
    /// it selects the circuit breaker
    pub fn new(descriptor: WorkDescriptor, target: impl Into<String>) -> Self {
        Self {
            descriptor,
            target: target.into(),
            capability: None,
            ttl: None,
            cacheable: true,
        }
    }

    /// Registry entry that must be loaded before the work runs
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Override the per-tool TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Always run; never read or write the cache
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.descriptor.fingerprint()
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Settles a breaker admission exactly once, including when the waiting
/// caller is dropped mid-flight
struct Admission {
    breaker: Arc<CircuitBreaker>,
    settled: bool,
}

impl Admission {
    fn acquire(breakers: &BreakerRegistry, target: &str) -> Result<Self> {
        let breaker = breakers.breaker(target);
        breaker.try_acquire()?;
        Ok(Self {
            breaker,
            settled: false,
        })
    }

    fn settle(mut self, outcome: std::result::Result<(), &DispatchError>) {
        self.settled = true;
        match outcome {
            Ok(()) => self.breaker.record_success(),
            Err(e) if e.trips_breaker() => self.breaker.record_failure(),
            Err(_) => self.breaker.release_trial(),
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial();
        }
    }
}

/// Map a cache outcome back to the error the caller should see
fn unwrap_cache_error(e: CacheError) -> DispatchError {
    match e {
        // Our own failure, wrapped to pass through the cache
        CacheError::Compute(source) => source
            .downcast::<DispatchError>()
            .unwrap_or_else(DispatchError::Operation),
        // The shared fill was refused; so are we
        CacheError::FillFailed {
            rejection: Some(rejection),
            ..
        } => rejection.into(),
        other => other.into(),
    }
}

/// Connection pool whose calls go through the dispatcher's admission path:
/// rate limiter, then the target's circuit breaker, then the pool's own
/// acquire/retry loop
pub struct GuardedPool<T: Send + 'static> {
    pool: ConnectionPool<T>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
}

impl<T: Send + 'static> Clone for GuardedPool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            limiter: Arc::clone(&self.limiter),
            breakers: Arc::clone(&self.breakers),
        }
    }
}

impl<T: Send + 'static> GuardedPool<T> {
    /// Run `op` on a pooled connection to `target`.
    ///
    /// Transient failures are retried inside the pool; only the final
    /// outcome reaches the breaker.
    pub async fn execute<R, F>(&self, target: &str, op: F) -> Result<R>
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, std::result::Result<R, ResilienceError>>,
    {
        self.limiter.check(1.0)?;
        let admission = Admission::acquire(&self.breakers, target)?;

        let outcome = self.pool.execute(op).await.map_err(DispatchError::from);
        if let Err(e) = &outcome {
            debug!(target_id = %target, error = %e, "pooled call failed");
        }
        admission.settle(outcome.as_ref().map(|_| ()));
        outcome
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the underlying pool; idle connections are dropped
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Owns every component; explicitly created and shut down
pub struct Dispatcher {
    config: DispatchConfig,
    cache: Arc<SmartCache>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    workers: Arc<WorkerPool>,
    registry: Arc<LazyRegistry>,
    warmer: Arc<CacheWarmer>,
    monitor: Arc<PerformanceMonitor>,
    sampler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Validate `config` and start every component. Must run inside a tokio
    /// runtime.
    pub fn new(config: DispatchConfig) -> Result<Self> {
        Self::with_sampler(config, Arc::new(SysinfoSampler::new()))
    }

    /// Like [`new`](Self::new) with a custom host sampler
    pub fn with_sampler(config: DispatchConfig, sampler: Arc<dyn HostSampler>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(SmartCache::open(&config.cache)?);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.burst_size,
            config.rate_limit.requests_per_second,
        ));
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.to_breaker_config()));
        let workers = Arc::new(WorkerPool::new(&config.workers, Arc::clone(&sampler)));
        let registry = Arc::new(LazyRegistry::new());
        let warmer = Arc::new(CacheWarmer::new(Arc::clone(&cache)));

        let monitor = Arc::new(PerformanceMonitor::new(
            config.monitor.clone(),
            MonitoredComponents {
                cache: Arc::clone(&cache),
                limiter: Arc::clone(&limiter),
                breakers: Arc::clone(&breakers),
                workers: Arc::clone(&workers),
                registry: Arc::clone(&registry),
                sampler,
            },
        ));
        let sampler_task = monitor.spawn_sampler(secs(config.monitor.interval_secs));

        info!(
            rps = config.rate_limit.requests_per_second,
            burst = config.rate_limit.burst_size,
            disk_cache = cache.has_disk_tier(),
            "dispatcher started"
        );

        Ok(Self {
            config,
            cache,
            limiter,
            breakers,
            workers,
            registry,
            warmer,
            monitor,
            sampler_task: Mutex::new(Some(sampler_task)),
        })
    }

    /// Run `work` for `request`, serving it from the cache when possible
    pub async fn dispatch(&self, request: DispatchRequest, work: WorkItem<Bytes>) -> Result<Bytes> {
        if let Some(capability) = &request.capability {
            self.registry.ensure_loaded(capability).await?;
        }
        self.limiter.check(1.0)?;

        if !request.cacheable {
            return self.run_guarded(&request.target, work).await;
        }

        let key = request.fingerprint();
        let target = request.target.as_str();
        self.cache
            .get_or_compute(&key, request.ttl, || async move {
                self.run_guarded(target, work).await.map_err(anyhow::Error::new)
            })
            .await
            .map_err(unwrap_cache_error)
    }

    /// Run `work` against `target` without caching, behind the limiter and
    /// the target's breaker
    pub async fn execute<T: Send + 'static>(&self, target: &str, work: WorkItem<T>) -> Result<T> {
        self.limiter.check(1.0)?;
        self.run_guarded(target, work).await
    }

    async fn run_guarded<T: Send + 'static>(&self, target: &str, work: WorkItem<T>) -> Result<T> {
        let admission = Admission::acquire(&self.breakers, target)?;

        let handle = self.workers.submit(work)?;
        let id = handle.id();
        let outcome = handle.await.map_err(DispatchError::from);

        if let Err(e) = &outcome {
            debug!(target_id = %target, id, error = %e, "dispatched work failed");
        }
        admission.settle(outcome.as_ref().map(|_| ()));
        outcome
    }

    /// Create a connection pool from the configured pool settings and include
    /// it in performance snapshots. Every call through the returned pool
    /// passes the rate limiter and the target's breaker first.
    pub fn connection_pool<T: Send + 'static>(
        &self,
        factory: Arc<dyn ConnectionFactory<T>>,
    ) -> GuardedPool<T> {
        let pool = ConnectionPool::new(factory, self.config.pool.to_pool_config());
        self.monitor.attach_pool(pool.clone());
        GuardedPool {
            pool,
            limiter: Arc::clone(&self.limiter),
            breakers: Arc::clone(&self.breakers),
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.monitor.snapshot()
    }

    pub fn health_status(&self) -> HealthReport {
        self.monitor.health_status()
    }

    /// Stop accepting work, finish or cancel what is queued, and write the
    /// memory tier to disk
    pub async fn shutdown(&self, drain: bool) {
        let sampler = self.sampler_task.lock().take();
        if let Some(sampler) = sampler {
            sampler.abort();
        }

        self.workers.shutdown(drain).await;
        let persisted = self.cache.persist().await;
        info!(drain, persisted, "dispatcher stopped");
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SmartCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn registry(&self) -> &Arc<LazyRegistry> {
        &self.registry
    }

    pub fn warmer(&self) -> &Arc<CacheWarmer> {
        &self.warmer
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler_task.get_mut().take() {
            sampler.abort();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers)
            .field("registry", &self.registry)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}
