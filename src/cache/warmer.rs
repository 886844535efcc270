//! Pre-population of frequently requested results

use super::SmartCache;
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type WarmFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

#[derive(Clone)]
struct WarmupTask {
    key: Fingerprint,
    ttl: Option<Duration>,
    compute: WarmFn,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmerStats {
    pub registered: usize,
    /// Tasks whose value is now cached (computed or already present)
    pub warmed: u64,
    pub failed: u64,
    pub last_warmup: Option<DateTime<Utc>>,
}

/// Runs registered warmup computations through the cache
pub struct CacheWarmer {
    cache: Arc<SmartCache>,
    tasks: Mutex<Vec<WarmupTask>>,
    warmed: AtomicU64,
    failed: AtomicU64,
    last_warmup: Mutex<Option<DateTime<Utc>>>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<SmartCache>) -> Self {
        Self {
            cache,
            tasks: Mutex::new(Vec::new()),
            warmed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_warmup: Mutex::new(None),
        }
    }

    /// Add a value to pre-compute on the next [`warm`](Self::warm)
    pub fn register<F, Fut>(&self, key: Fingerprint, ttl: Option<Duration>, compute: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        self.tasks.lock().push(WarmupTask {
            key,
            ttl,
            compute: Arc::new(move || compute().boxed()),
        });
    }

    /// Run every registered task concurrently; failures are counted and logged
    pub async fn warm(&self) -> WarmerStats {
        let tasks: Vec<WarmupTask> = self.tasks.lock().clone();
        let total = tasks.len();

        let outcomes = join_all(tasks.into_iter().map(|task| async move {
            let compute = Arc::clone(&task.compute);
            let result = self
                .cache
                .get_or_compute(&task.key, task.ttl, move || compute())
                .await;
            (task.key, result)
        }))
        .await;

        let mut failed = 0;
        for (key, result) in outcomes {
            match result {
                Ok(_) => {
                    self.warmed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    failed += 1;
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "cache warmup task failed");
                }
            }
        }

        *self.last_warmup.lock() = Some(Utc::now());
        info!(tasks = total, failed, "cache warmup finished");
        self.stats()
    }

    /// Run [`warm`](Self::warm) on the runtime without waiting for it
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<WarmerStats> {
        let warmer = Arc::clone(self);
        tokio::spawn(async move { warmer.warm().await })
    }

    pub fn stats(&self) -> WarmerStats {
        WarmerStats {
            registered: self.tasks.lock().len(),
            warmed: self.warmed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_warmup: *self.last_warmup.lock(),
        }
    }
}
