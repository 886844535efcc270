//! Two-tier result cache with TTL, LRU eviction and request coalescing
//!
//! The memory tier is split into independently locked shards, each owning an
//! equal slice of the byte budget. Entries evicted from memory are demoted to
//! the disk tier (when one is configured) and promoted back on the next hit.
//! A key lives in at most one tier at a time.
//!
//! ```text
//!   get_or_compute(key)
//!         │
//!         ▼
//!   memory shard ──hit──▶ value
//!         │ miss
//!         ▼
//!   disk tier ──hit──▶ promote ──▶ value
//!         │ miss
//!         ▼
//!   in-flight table ──fill running──▶ wait for its outcome
//!         │ first caller
//!         ▼
//!   compute() ──▶ insert ──▶ publish to waiters
//! ```

mod coalesce;
mod disk;
mod entry;
mod shard;
mod warmer;

pub use coalesce::FillToken;
pub use disk::DiskTier;
pub use entry::{CacheEntry, Tier};
pub use warmer::{CacheWarmer, WarmerStats};

pub use crate::config::CoalescePolicy;

use crate::config::{secs, CacheSettings};
use crate::error::{CacheError, DispatchError};
use crate::fingerprint::{normalize_tool, Fingerprint};
use bytes::Bytes;
use coalesce::{wait_for_fill, Claim, FillFailure, FillState, InFlight};
use disk::{Checkout, DiskLookup};
use parking_lot::Mutex;
use serde::Serialize;
use shard::{Insert, Lookup, MemoryShard};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits over lookups (0.0 - 1.0)
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub memory_bytes: usize,
    pub memory_budget: usize,
    pub memory_entries: usize,
    pub disk_bytes: u64,
    pub disk_entries: usize,
    pub coalesced_waits: u64,
    pub fills_in_flight: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    demotions: AtomicU64,
    promotions: AtomicU64,
    coalesced_waits: AtomicU64,
}

/// An entry leaving memory with a disk write version already claimed
#[derive(Debug)]
struct Demotion {
    entry: CacheEntry,
    version: u64,
}

/// Dual-tier cache keyed by [`Fingerprint`]
pub struct SmartCache {
    shards: Vec<Mutex<MemoryShard>>,
    memory_budget: usize,
    disk: Option<DiskTier>,
    inflight: InFlight,
    default_ttl: Option<Duration>,
    tool_ttl: HashMap<String, Duration>,
    policy: CoalescePolicy,
    fill_wait_timeout: Option<Duration>,
    counters: CacheCounters,
}

impl std::fmt::Debug for SmartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartCache")
            .field("shards", &self.shards.len())
            .field("memory_budget", &self.memory_budget)
            .field("disk", &self.disk.as_ref().map(|d| d.dir().to_path_buf()))
            .field("policy", &self.policy)
            .finish()
    }
}

impl SmartCache {
    /// Build a cache from settings, opening the disk tier if it has a budget
    pub fn open(settings: &CacheSettings) -> Result<Self, CacheError> {
        let disk = if settings.disk_budget > 0 {
            Some(DiskTier::open(&settings.cache_dir, settings.disk_budget)?)
        } else {
            None
        };
        Ok(Self::with_disk(settings, disk))
    }

    /// Memory-only cache; `settings.disk_budget` and `cache_dir` are ignored
    pub fn in_memory(settings: &CacheSettings) -> Self {
        Self::with_disk(settings, None)
    }

    fn with_disk(settings: &CacheSettings, disk: Option<DiskTier>) -> Self {
        let memory_budget = settings.memory_budget.max(1);
        let shard_count = settings.shards.clamp(1, memory_budget);
        let per_shard = memory_budget / shard_count;

        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(MemoryShard::new(per_shard)))
                .collect(),
            memory_budget,
            disk,
            inflight: InFlight::new(),
            default_ttl: settings.default_ttl_secs.map(Duration::from_secs),
            tool_ttl: settings
                .tool_ttl
                .iter()
                .map(|(tool, secs)| (normalize_tool(tool), Duration::from_secs(*secs)))
                .collect(),
            policy: settings.coalesce,
            fill_wait_timeout: settings.fill_wait_timeout_secs.map(secs),
            counters: CacheCounters::default(),
        }
    }

    fn shard_for(&self, key: &Fingerprint) -> &Mutex<MemoryShard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// TTL applied when the caller does not choose one
    pub fn ttl_for(&self, key: &Fingerprint) -> Option<Duration> {
        self.tool_ttl
            .get(key.tool())
            .copied()
            .or(self.default_ttl)
    }

    /// Look up a value. Expired entries count as misses and are removed.
    pub async fn get(&self, key: &Fingerprint) -> Option<Bytes> {
        self.lookup(key, true).await
    }

    async fn lookup(&self, key: &Fingerprint, record: bool) -> Option<Bytes> {
        let now = Instant::now();
        let checkout = {
            let mut shard = self.shard_for(key).lock();
            match shard.get(key, now) {
                Lookup::Hit(value) => {
                    drop(shard);
                    if record {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(key = %key, tier = "memory", "cache hit");
                    return Some(value);
                }
                Lookup::Expired => {
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Lookup::Miss => self.disk.as_ref().and_then(|disk| disk.checkout(key)),
            }
        };

        if let Some(checkout) = checkout {
            if let Some(value) = self.promote(key, checkout).await {
                if record {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                }
                debug!(key = %key, tier = "disk", "cache hit");
                return Some(value);
            }
        }

        if record {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Read a checked-out disk record and move it back into memory
    async fn promote(&self, key: &Fingerprint, checkout: Checkout) -> Option<Bytes> {
        let disk = self.disk.as_ref()?;
        let version = checkout.version;

        let restored = match disk.read(checkout).await {
            Ok(DiskLookup::Found(restored)) => restored,
            Ok(DiskLookup::Expired) => {
                disk.settle(key, version);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Ok(DiskLookup::Missing) => {
                disk.settle(key, version);
                return None;
            }
            Err(e) => {
                disk.settle(key, version);
                warn!(key = %key, error = %e, "failed to read disk cache record");
                return None;
            }
        };

        let value = restored.value.clone();
        let demotions = {
            let mut shard = self.shard_for(key).lock();
            // Replaced or invalidated while the record was being read
            if !disk.settle(key, version) {
                return Some(value);
            }
            let entry = CacheEntry::new(key.clone(), restored.value, restored.ttl);
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            self.place(&mut shard, entry, Instant::now())
        };
        self.demote(demotions).await;
        Some(value)
    }

    /// Insert into memory under the shard lock, claiming disk writes for
    /// whatever falls out. The writes happen in [`SmartCache::demote`].
    fn place(&self, shard: &mut MemoryShard, entry: CacheEntry, now: Instant) -> Vec<Demotion> {
        let mut demotions = Vec::new();
        match shard.insert(entry, now) {
            Insert::Stored { evicted, expired } => {
                if expired > 0 {
                    self.counters
                        .expirations
                        .fetch_add(expired as u64, Ordering::Relaxed);
                }
                self.counters
                    .evictions
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                demotions.extend(evicted.into_iter().filter_map(|victim| self.claim(victim)));
            }
            Insert::TooLarge(entry) if self.disk.is_some() => demotions.extend(self.claim(entry)),
            Insert::TooLarge(entry) => debug!(
                key = %entry.key,
                size = entry.size_bytes,
                "entry exceeds cache budgets, not cached"
            ),
        }
        demotions
    }

    fn claim(&self, entry: CacheEntry) -> Option<Demotion> {
        let disk = self.disk.as_ref()?;
        Some(Demotion {
            version: disk.claim(&entry.key),
            entry,
        })
    }

    /// Write claimed entries to disk; returns how many were kept
    async fn demote(&self, demotions: Vec<Demotion>) -> usize {
        let Some(disk) = &self.disk else {
            return 0;
        };

        let mut written = 0;
        for Demotion { entry, version } in demotions {
            match disk.write(&entry, version).await {
                Ok(true) => {
                    self.counters.demotions.fetch_add(1, Ordering::Relaxed);
                    written += 1;
                }
                Ok(false) => debug!(
                    key = %entry.key,
                    size = entry.size_bytes,
                    "entry not kept on disk"
                ),
                Err(e) => warn!(key = %entry.key, error = %e, "failed to demote entry to disk"),
            }
        }
        written
    }

    /// Store a value. `ttl` of `None` uses the tool's configured TTL.
    pub async fn insert(&self, key: &Fingerprint, value: Bytes, ttl: Option<Duration>) {
        let ttl = ttl.or_else(|| self.ttl_for(key));
        let entry = CacheEntry::new(key.clone(), value, ttl);
        let now = Instant::now();

        let (stale, demotions) = {
            let mut shard = self.shard_for(key).lock();
            // Drop any stale copy so the key occupies one tier
            let stale = self.disk.as_ref().map(|disk| disk.detach(key));
            (stale, self.place(&mut shard, entry, now))
        };
        if let Some(stale) = stale {
            stale.discard().await;
        }
        self.demote(demotions).await;
    }

    /// Return the cached value or compute it, running `compute` at most once
    /// across concurrent callers for the same key.
    ///
    /// A failed computation is never cached. The caller that ran it gets
    /// [`CacheError::Compute`]; callers that were waiting on it get
    /// [`CacheError::FillFailed`], which carries the filler's admission
    /// rejection when its error was one. If the computing caller is
    /// cancelled, one of the waiters takes over.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &Fingerprint,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Bytes>>,
    {
        let mut record = true;
        let token = loop {
            if let Some(value) = self.lookup(key, record).await {
                return Ok(value);
            }
            record = false;

            match self.inflight.claim(key) {
                Claim::Filler(token) => break token,
                Claim::Waiter(receiver) => {
                    if self.policy == CoalescePolicy::FailFast {
                        return Err(CacheError::ComputeInProgress(key.to_string()));
                    }
                    self.counters.coalesced_waits.fetch_add(1, Ordering::Relaxed);

                    let state = match self.fill_wait_timeout {
                        Some(limit) => tokio::time::timeout(limit, wait_for_fill(receiver))
                            .await
                            .map_err(|_| CacheError::FillTimeout(limit))?,
                        None => wait_for_fill(receiver).await,
                    };

                    match state {
                        FillState::Ready(value) => return Ok(value),
                        FillState::Failed(FillFailure { reason, rejection }) => {
                            return Err(CacheError::FillFailed {
                                key: key.to_string(),
                                reason,
                                rejection,
                            })
                        }
                        FillState::Abandoned | FillState::Pending => {
                            debug!(key = %key, "in-flight fill abandoned, retrying");
                        }
                    }
                }
            }
        };

        // A fill may have completed between our miss and the claim
        if let Some(value) = self.lookup(key, false).await {
            token.complete(value.clone());
            return Ok(value);
        }

        match compute().await {
            Ok(value) => {
                self.insert(key, value.clone(), ttl).await;
                token.complete(value.clone());
                Ok(value)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "cache fill failed");
                token.fail(FillFailure {
                    reason: format!("{e:#}"),
                    rejection: e.downcast_ref::<DispatchError>().and_then(DispatchError::rejection),
                });
                Err(CacheError::Compute(e))
            }
        }
    }

    /// Remove a key from both tiers
    pub async fn invalidate(&self, key: &Fingerprint) -> bool {
        let (in_memory, on_disk) = {
            let mut shard = self.shard_for(key).lock();
            (
                shard.remove(key).is_some(),
                self.disk.as_ref().map(|disk| disk.detach(key)),
            )
        };
        match on_disk {
            Some(detached) => {
                let found = detached.found();
                detached.discard().await;
                in_memory || found
            }
            None => in_memory,
        }
    }

    /// Remove every entry produced by `tool`
    pub async fn invalidate_tool(&self, tool: &str) -> usize {
        let tool = normalize_tool(tool);
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.lock().remove_where(|entry| entry.key.tool() == tool);
        }
        if let Some(disk) = &self.disk {
            removed += disk.remove_where(|key| key.tool() == tool).await;
        }
        debug!(tool = %tool, removed, "invalidated tool results");
        removed
    }

    /// Drop everything from both tiers
    pub async fn clear(&self) {
        for shard in &self.shards {
            shard.lock().drain();
        }
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
    }

    /// Sweep expired entries from both tiers
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for shard in &self.shards {
            purged += shard.lock().purge_expired(now);
        }
        if let Some(disk) = &self.disk {
            purged += disk.purge_expired().await;
        }
        if purged > 0 {
            self.counters
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// Demote every live memory entry to disk so it survives a restart.
    ///
    /// Returns the number of entries written. Without a disk tier this is a no-op.
    pub async fn persist(&self) -> usize {
        if self.disk.is_none() {
            return 0;
        }

        let mut written = 0;
        for shard in &self.shards {
            let demotions: Vec<Demotion> = {
                let mut shard = shard.lock();
                shard
                    .drain()
                    .into_iter()
                    .filter_map(|entry| self.claim(entry))
                    .collect()
            };
            written += self.demote(demotions).await;
        }
        written
    }

    /// Whether the disk tier is enabled
    pub fn has_disk_tier(&self) -> bool {
        self.disk.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let (mut memory_bytes, mut memory_entries) = (0, 0);
        for shard in &self.shards {
            let shard = shard.lock();
            memory_bytes += shard.bytes();
            memory_entries += shard.len();
        }

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: self.counters.evictions.load(Ordering::Relaxed)
                + self.disk.as_ref().map(|d| d.evictions()).unwrap_or(0),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            demotions: self.counters.demotions.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            memory_bytes,
            memory_budget: self.memory_budget,
            memory_entries,
            disk_bytes: self.disk.as_ref().map(|d| d.bytes()).unwrap_or(0),
            disk_entries: self.disk.as_ref().map(|d| d.len()).unwrap_or(0),
            coalesced_waits: self.counters.coalesced_waits.load(Ordering::Relaxed),
            fills_in_flight: self.inflight.len(),
        }
    }
}
