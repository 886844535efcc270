/*!
 * Lazily initialized capabilities
 *
 * Expensive dependencies (tool adapters, wordlists, parsers) are registered
 * under a name together with a [`Loader`] and built on first use. Each name
 * is loaded at most once at a time: concurrent first accesses share one
 * loader run and receive the same `Arc`. A failed load is not remembered,
 * so the next access tries again.
 */

use crate::error::RegistryError;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A loaded capability, type-erased
pub type Capability = Arc<dyn Any + Send + Sync>;

type SyncLoad = Arc<dyn Fn() -> anyhow::Result<Capability> + Send + Sync>;
type AsyncLoad = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Capability>> + Send + Sync>;

/// How a capability is built
#[derive(Clone)]
pub enum Loader {
    /// Runs inline on the task that first asks for the capability
    Sync(SyncLoad),
    Async(AsyncLoad),
}

impl Loader {
    pub fn sync<T, F>(load: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Loader::Sync(Arc::new(move || load().map(|value| Arc::new(value) as Capability)))
    }

    pub fn future<T, F, Fut>(load: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Loader::Async(Arc::new(move || {
            load()
                .map(|result| result.map(|value| Arc::new(value) as Capability))
                .boxed()
        }))
    }

    async fn load(&self) -> anyhow::Result<Capability> {
        match self {
            Loader::Sync(load) => load(),
            Loader::Async(load) => load().await,
        }
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Loader::Sync(_) => f.write_str("Loader::Sync"),
            Loader::Async(_) => f.write_str("Loader::Async"),
        }
    }
}

struct Slot {
    loader: Loader,
    cell: OnceCell<Capability>,
    load_time: Mutex<Option<Duration>>,
}

impl Slot {
    fn new(loader: Loader) -> Self {
        Self {
            loader,
            cell: OnceCell::new(),
            load_time: Mutex::new(None),
        }
    }

    async fn load(&self, name: &str) -> Result<Capability, RegistryError> {
        let started = Instant::now();
        match self.loader.load().await {
            Ok(capability) => {
                let elapsed = started.elapsed();
                *self.load_time.lock() = Some(elapsed);
                info!(name, elapsed_ms = elapsed.as_millis() as u64, "capability loaded");
                Ok(capability)
            }
            Err(e) => {
                warn!(name, error = %e, "capability failed to load");
                Err(RegistryError::LoaderFailure {
                    name: name.to_string(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }
}

/// Load statistics of a [`LazyRegistry`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub loaded: usize,
    /// Seconds each loaded capability took to build
    pub load_times: BTreeMap<String, f64>,
}

/// Name-keyed registry of lazily loaded capabilities
#[derive(Default)]
pub struct LazyRegistry {
    slots: DashMap<String, Arc<Slot>>,
}

impl LazyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the loader for `name`. Replacing drops any
    /// value loaded by the previous loader.
    pub fn register(&self, name: impl Into<String>, loader: Loader) {
        let name = name.into();
        debug!(name = %name, ?loader, "capability registered");
        self.slots.insert(name, Arc::new(Slot::new(loader)));
    }

    fn slot(&self, name: &str) -> Result<Arc<Slot>, RegistryError> {
        self.slots
            .get(name)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    /// Type-erased access; loads on first use
    pub async fn get_any(&self, name: &str) -> Result<Capability, RegistryError> {
        // The map guard is released before any loader runs
        let slot = self.slot(name)?;
        let capability = slot.cell.get_or_try_init(|| slot.load(name)).await?;
        Ok(Arc::clone(capability))
    }

    /// Typed access; loads on first use
    pub async fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.get_any(name)
            .await?
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Make sure `name` is loaded without needing its type
    pub async fn ensure_loaded(&self, name: &str) -> Result<(), RegistryError> {
        self.get_any(name).await.map(|_| ())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .map(|slot| slot.cell.initialized())
            .unwrap_or(false)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Load `names` in the background. Failures and unknown names are logged
    /// and otherwise ignored; a later `get` retries them.
    pub fn preload<I, S>(self: &Arc<Self>, names: I) -> JoinHandle<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Arc::clone(self);
        let names: Vec<String> = names.into_iter().map(Into::into).collect();

        tokio::spawn(async move {
            let results = join_all(names.iter().map(|name| registry.ensure_loaded(name))).await;
            let failed = results.iter().filter(|result| result.is_err()).count();
            for (name, result) in names.iter().zip(&results) {
                if let Err(RegistryError::NotRegistered(_)) = result {
                    warn!(name = %name, "preload requested for unregistered capability");
                }
            }
            info!(requested = names.len(), failed, "capability preload finished");
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            registered: self.slots.len(),
            ..Default::default()
        };
        for entry in self.slots.iter() {
            if entry.cell.initialized() {
                stats.loaded += 1;
            }
            if let Some(elapsed) = *entry.load_time.lock() {
                stats.load_times.insert(entry.key().clone(), elapsed.as_secs_f64());
            }
        }
        stats
    }
}

impl std::fmt::Debug for LazyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRegistry")
            .field("registered", &self.slots.len())
            .finish_non_exhaustive()
    }
}
