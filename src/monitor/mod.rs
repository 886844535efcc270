/*!
 * Performance monitoring
 *
 * [`PerformanceMonitor`] copies the counters of every component plus a host
 * reading into one serializable [`PerformanceSnapshot`], and derives the
 * service health from it. The host reading is refreshed on the blocking
 * pool by the periodic sampler; snapshots only read the latest one. No component lock is held longer than it takes
 * that component to copy its own counters.
 */

mod health;
mod system;

pub use health::{Advisory, HealthAssessor, HealthInputs, HealthReport, HealthStatus};
pub use system::{refresh_host, HostSample, HostSampler, StaticSampler, SysinfoSampler};

use crate::cache::{CacheStats, SmartCache};
use crate::config::MonitorSettings;
use crate::registry::{LazyRegistry, RegistryStats};
use crate::worker_pool::{WorkerPool, WorkerStats};
use chrono::{DateTime, Utc};
use dispatch_core_resilience::{
    BreakerRegistry, BreakerSnapshot, CircuitState, ConnectionPool, LimiterStats, PoolStats,
    RateLimiter,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

type PoolStatsFn = Arc<dyn Fn() -> PoolStats + Send + Sync>;

/// Everything the monitor reads from
#[derive(Clone)]
pub struct MonitoredComponents {
    pub cache: Arc<SmartCache>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub workers: Arc<WorkerPool>,
    pub registry: Arc<LazyRegistry>,
    pub sampler: Arc<dyn HostSampler>,
}

/// Combined, read-only view of every component
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    /// `None` until a connection pool is attached
    pub connection_pool: Option<PoolStats>,
    pub rate_limiter: LimiterStats,
    /// Worst state across all targets
    pub circuit_breaker_state: CircuitState,
    pub circuit_breakers: BTreeMap<String, BreakerSnapshot>,
    pub worker_pool: WorkerStats,
    pub cache: CacheStats,
    pub lazy_imports: RegistryStats,
    pub system: HostSample,
    pub taken_at: DateTime<Utc>,
}

impl PerformanceSnapshot {
    pub fn open_breakers(&self) -> Vec<String> {
        self.circuit_breakers
            .values()
            .filter(|breaker| breaker.state == CircuitState::Open)
            .map(|breaker| breaker.target.clone())
            .collect()
    }
}

pub struct PerformanceMonitor {
    settings: MonitorSettings,
    components: MonitoredComponents,
    pool_stats: RwLock<Option<PoolStatsFn>>,
    assessor: Mutex<HealthAssessor>,
    last_status: Mutex<HealthStatus>,
}

impl PerformanceMonitor {
    pub fn new(settings: MonitorSettings, components: MonitoredComponents) -> Self {
        Self {
            assessor: Mutex::new(HealthAssessor::new(&settings)),
            last_status: Mutex::new(HealthStatus::Operational),
            pool_stats: RwLock::new(None),
            settings,
            components,
        }
    }

    /// Include `pool` in snapshots. A later call replaces the earlier pool.
    pub fn attach_pool<T: Send + 'static>(&self, pool: ConnectionPool<T>) {
        *self.pool_stats.write() = Some(Arc::new(move || pool.stats()));
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let components = &self.components;
        let connection_pool = self.pool_stats.read().as_ref().map(|stats| stats());

        let breakers = components.breakers.snapshots();
        let circuit_breaker_state = breakers
            .iter()
            .map(|breaker| breaker.state)
            .max()
            .unwrap_or(CircuitState::Closed);
        let circuit_breakers = breakers
            .into_iter()
            .map(|breaker| (breaker.target.clone(), breaker))
            .collect();

        PerformanceSnapshot {
            connection_pool,
            rate_limiter: components.limiter.stats(),
            circuit_breaker_state,
            circuit_breakers,
            worker_pool: components.workers.stats(),
            cache: components.cache.stats(),
            lazy_imports: components.registry.stats(),
            system: components.sampler.sample(),
            taken_at: Utc::now(),
        }
    }

    /// Health derived from a fresh snapshot.
    ///
    /// Read-only: queue saturation is judged against the streak recorded
    /// by the periodic sampler, which this call does not advance.
    pub fn health_status(&self) -> HealthReport {
        let snapshot = self.snapshot();
        let report = self.assessor.lock().evaluate(&Self::inputs(&snapshot));
        self.note_status(&report);
        report
    }

    /// Periodic step: snapshot, advance the assessment and log any change
    /// of status
    pub fn sample(&self) -> (PerformanceSnapshot, HealthReport) {
        let snapshot = self.snapshot();
        let report = self.assessor.lock().observe(&Self::inputs(&snapshot));
        self.note_status(&report);
        (snapshot, report)
    }

    fn inputs(snapshot: &PerformanceSnapshot) -> HealthInputs {
        HealthInputs {
            host: snapshot.system,
            open_breakers: snapshot.open_breakers(),
            queue_saturation: snapshot.worker_pool.queue_saturation(),
        }
    }

    fn note_status(&self, report: &HealthReport) {
        let previous = std::mem::replace(&mut *self.last_status.lock(), report.status);
        match (previous, report.status) {
            (HealthStatus::Operational, HealthStatus::Degraded) => {
                warn!(reasons = ?report.reasons, "service degraded");
            }
            (HealthStatus::Degraded, HealthStatus::Operational) => {
                info!("service operational again");
            }
            _ => {}
        }
    }

    /// Number of periodic health samples taken so far
    pub fn health_checks(&self) -> u64 {
        self.assessor.lock().check_count()
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Refresh the host reading and sample every `interval` until the
    /// returned task is aborted
    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                refresh_host(&monitor.components.sampler).await;
                let (snapshot, report) = monitor.sample();
                if monitor.settings.log_performance {
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => info!(status = ?report.status, snapshot = %json, "performance snapshot"),
                        Err(e) => warn!(error = %e, "failed to serialize performance snapshot"),
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("settings", &self.settings)
            .field("status", &*self.last_status.lock())
            .finish_non_exhaustive()
    }
}
