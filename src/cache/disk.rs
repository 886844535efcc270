//! Disk tier: one bincode record per write under the cache directory
//!
//! Expiry on disk is tracked in wall-clock milliseconds so that entries
//! survive restarts with their remaining lifetime intact. The in-memory
//! index is rebuilt from the directory when the tier is opened; expired or
//! unreadable records are deleted at that point.
//!
//! File I/O after open goes through `tokio::fs` and never runs while the
//! index lock is held. Each write gets its own versioned file name; a write
//! only becomes visible if it is still the latest one for its key when it
//! finishes, so a slow demotion can never resurrect a value that was
//! replaced or invalidated meanwhile.

use super::entry::{footprint, CacheEntry};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

/// On-disk representation of a cached value
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    key: String,
    created_at_ms: i64,
    expires_at_ms: Option<i64>,
    value: Vec<u8>,
}

#[derive(Debug)]
struct DiskSlot {
    path: PathBuf,
    size: u64,
    expires_at_ms: Option<i64>,
    tick: u64,
}

impl DiskSlot {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map(|at| now_ms >= at).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct DiskIndex {
    slots: HashMap<Fingerprint, DiskSlot>,
    recency: BTreeMap<u64, Fingerprint>,
    /// Latest write version started per key and not yet committed
    pending: HashMap<Fingerprint, u64>,
    bytes: u64,
    next_tick: u64,
}

impl DiskIndex {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &Fingerprint) -> Option<DiskSlot> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        self.bytes -= slot.size;
        Some(slot)
    }

    /// Pop least recently used slots until `incoming` more bytes fit
    fn make_room(&mut self, incoming: u64, budget: u64) -> Vec<PathBuf> {
        let mut freed = Vec::new();
        while self.bytes + incoming > budget {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                self.bytes -= slot.size;
                freed.push(slot.path);
            }
        }
        freed
    }
}

/// A value read back from disk
#[derive(Debug)]
pub(crate) struct Restored {
    pub value: Bytes,
    /// Remaining lifetime; `None` never expires
    pub ttl: Option<Duration>,
}

/// Outcome of a disk lookup
#[derive(Debug)]
pub(crate) enum DiskLookup {
    Found(Restored),
    Expired,
    Missing,
}

/// A record detached from the index, with a claim on its key
#[derive(Debug)]
pub(crate) struct Checkout {
    slot: DiskSlot,
    pub version: u64,
}

/// What [`DiskTier::detach`] took out of the index
#[derive(Debug)]
pub(crate) struct Detached {
    path: Option<PathBuf>,
    cancelled: bool,
}

impl Detached {
    /// Whether a record or an in-flight write existed
    pub fn found(&self) -> bool {
        self.path.is_some() || self.cancelled
    }

    pub async fn discard(self) {
        if let Some(path) = self.path {
            remove_file_quietly(&path).await;
        }
    }
}

/// Byte-budgeted LRU store of cache records on the local filesystem
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    budget: u64,
    index: Mutex<DiskIndex>,
    evictions: AtomicU64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DiskTier {
    /// Open (or create) the tier at `dir`, indexing any surviving records.
    ///
    /// Reads the directory synchronously; call it at startup, not from a
    /// request path.
    pub fn open(dir: impl Into<PathBuf>, budget: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let tier = Self {
            dir,
            budget,
            index: Mutex::new(DiskIndex::default()),
            evictions: AtomicU64::new(0),
        };
        tier.rebuild_index()?;
        Ok(tier)
    }

    fn rebuild_index(&self) -> Result<(), CacheError> {
        let now = now_ms();
        let mut found: Vec<(i64, Fingerprint, DiskSlot)> = Vec::new();
        let mut discarded = 0usize;

        let listing = fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        for dir_entry in listing.flatten() {
            let path = dir_entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(RECORD_EXTENSION) => {}
                // Leftover from a write interrupted by a crash
                Some(TEMP_EXTENSION) => {
                    discard_file(&path);
                    continue;
                }
                _ => continue,
            }

            let parsed = fs::read(&path)
                .map_err(|e| CacheError::io(&path, e))
                .and_then(|raw| decode(&raw));
            match parsed {
                Ok(record) if record.expires_at_ms.map(|at| now >= at).unwrap_or(false) => {
                    discarded += 1;
                    discard_file(&path);
                }
                Ok(record) => match Fingerprint::parse(&record.key) {
                    Some(key) => {
                        let size = footprint(&key, &record.value) as u64;
                        found.push((
                            record.created_at_ms,
                            key,
                            DiskSlot {
                                path,
                                size,
                                expires_at_ms: record.expires_at_ms,
                                tick: 0,
                            },
                        ));
                    }
                    None => {
                        discarded += 1;
                        discard_file(&path);
                    }
                },
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "discarding unreadable cache record");
                    discarded += 1;
                    discard_file(&path);
                }
            }
        }

        // Oldest records are treated as least recently used
        found.sort_by_key(|(created_at, _, _)| *created_at);

        let mut index = self.index.lock();
        let mut superseded = Vec::new();
        for (_, key, mut slot) in found {
            // Two records for one key: the newer one wins
            if let Some(older) = index.remove(&key) {
                superseded.push(older.path);
            }
            slot.tick = index.tick();
            index.bytes += slot.size;
            index.recency.insert(slot.tick, key.clone());
            index.slots.insert(key, slot);
        }
        let trimmed = index.make_room(0, self.budget);
        let restored = index.slots.len();
        drop(index);

        for path in superseded.iter().chain(&trimmed) {
            discard_file(path);
        }

        if restored > 0 || discarded > 0 {
            info!(
                dir = %self.dir.display(),
                restored,
                discarded,
                trimmed = trimmed.len(),
                "disk cache index rebuilt"
            );
        }
        Ok(())
    }

    fn path_for(&self, key: &Fingerprint, version: u64) -> PathBuf {
        let digest = Sha256::digest(key.as_str().as_bytes());
        self.dir.join(format!(
            "{}-{version}.{RECORD_EXTENSION}",
            hex::encode(&digest[..16])
        ))
    }

    /// Reserve a write version for `key`, superseding any write still in flight.
    ///
    /// Cheap and synchronous so callers can order it with their own locks.
    pub(crate) fn claim(&self, key: &Fingerprint) -> u64 {
        let mut index = self.index.lock();
        let version = index.tick();
        index.pending.insert(key.clone(), version);
        version
    }

    /// Release a claim; `true` when nothing superseded it in the meantime
    pub(crate) fn settle(&self, key: &Fingerprint, version: u64) -> bool {
        let mut index = self.index.lock();
        if index.pending.get(key) == Some(&version) {
            index.pending.remove(key);
            true
        } else {
            false
        }
    }

    /// Write `entry` to disk, evicting least recently used records to fit
    #[cfg(test)]
    pub(crate) async fn put(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let version = self.claim(&entry.key);
        self.write(entry, version).await
    }

    /// Write `entry` under a version from [`DiskTier::claim`].
    ///
    /// Returns `false` when the entry is expired, larger than the whole
    /// budget, or its claim was superseded by a newer write or removal of the
    /// same key before the write finished.
    pub(crate) async fn write(&self, entry: &CacheEntry, version: u64) -> Result<bool, CacheError> {
        let size = entry.size_bytes as u64;
        let now = Instant::now();
        if size > self.budget || entry.is_expired_at(now) {
            self.settle(&entry.key, version);
            return Ok(false);
        }

        let wall_now = now_ms();
        let expires_at_ms = entry
            .remaining_ttl(now)
            .map(|remaining| wall_now.saturating_add(remaining.as_millis() as i64));
        let record = DiskRecord {
            key: entry.key.as_str().to_string(),
            created_at_ms: wall_now,
            expires_at_ms,
            value: entry.value.to_vec(),
        };
        let encoded = match bincode::serialize(&record) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.settle(&entry.key, version);
                return Err(CacheError::Codec(e.to_string()));
            }
        };

        let path = self.path_for(&entry.key, version);
        if let Err(e) = write_atomically(&path, &encoded).await {
            self.settle(&entry.key, version);
            return Err(e);
        }

        let (committed, doomed) = {
            let mut index = self.index.lock();
            if index.pending.get(&entry.key) != Some(&version) {
                (false, vec![path])
            } else {
                index.pending.remove(&entry.key);
                let mut doomed: Vec<PathBuf> =
                    index.remove(&entry.key).map(|previous| previous.path).into_iter().collect();
                let evicted = index.make_room(size, self.budget);
                if !evicted.is_empty() {
                    self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
                }
                doomed.extend(evicted);

                let tick = index.tick();
                index.bytes += size;
                index.recency.insert(tick, entry.key.clone());
                index.slots.insert(
                    entry.key.clone(),
                    DiskSlot {
                        path,
                        size,
                        expires_at_ms,
                        tick,
                    },
                );
                (true, doomed)
            }
        };

        if !committed {
            debug!(key = %entry.key, "disk write superseded, discarding");
        }
        remove_files(&doomed).await;
        Ok(committed)
    }

    /// Detach the record for `key` from the index for reading.
    ///
    /// The checkout holds a claim on the key; settle it once the caller has
    /// decided what to do with the value. A key with a newer write in flight
    /// is reported as absent.
    pub(crate) fn checkout(&self, key: &Fingerprint) -> Option<Checkout> {
        let mut index = self.index.lock();
        if index.pending.contains_key(key) {
            return None;
        }
        let slot = index.remove(key)?;
        let version = index.tick();
        index.pending.insert(key.clone(), version);
        Some(Checkout { slot, version })
    }

    /// Read and delete a checked-out record
    pub(crate) async fn read(&self, checkout: Checkout) -> Result<DiskLookup, CacheError> {
        let Checkout { slot, .. } = checkout;
        let wall_now = now_ms();
        if slot.is_expired(wall_now) {
            remove_file_quietly(&slot.path).await;
            return Ok(DiskLookup::Expired);
        }

        let raw = tokio::fs::read(&slot.path)
            .await
            .map_err(|e| CacheError::io(&slot.path, e));
        remove_file_quietly(&slot.path).await;
        let record = decode(&raw?)?;

        let ttl = record
            .expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(wall_now).max(0) as u64));
        Ok(DiskLookup::Found(Restored {
            value: Bytes::from(record.value),
            ttl,
        }))
    }

    /// Remove the record for `key` and return its value
    #[cfg(test)]
    pub(crate) async fn take(&self, key: &Fingerprint) -> Result<DiskLookup, CacheError> {
        let Some(checkout) = self.checkout(key) else {
            return Ok(DiskLookup::Missing);
        };
        let version = checkout.version;
        let lookup = self.read(checkout).await;
        self.settle(key, version);
        lookup
    }

    /// Unindex `key` and cancel any write of it still in flight; the file is
    /// left for the caller to discard outside its locks
    pub(crate) fn detach(&self, key: &Fingerprint) -> Detached {
        let mut index = self.index.lock();
        Detached {
            path: index.remove(key).map(|slot| slot.path),
            cancelled: index.pending.remove(key).is_some(),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &Fingerprint) -> bool {
        self.index.lock().slots.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) async fn remove(&self, key: &Fingerprint) -> bool {
        let detached = self.detach(key);
        let found = detached.found();
        detached.discard().await;
        found
    }

    /// Remove every record whose key matches `predicate`
    pub(crate) async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Fingerprint) -> bool,
    {
        let paths: Vec<PathBuf> = {
            let mut index = self.index.lock();
            index.pending.retain(|key, _| !predicate(key));
            let doomed: Vec<Fingerprint> = index
                .slots
                .keys()
                .filter(|key| predicate(key))
                .cloned()
                .collect();
            doomed
                .iter()
                .filter_map(|key| index.remove(key).map(|slot| slot.path))
                .collect()
        };

        remove_files(&paths).await;
        paths.len()
    }

    pub(crate) async fn purge_expired(&self) -> usize {
        let now = now_ms();
        let paths: Vec<PathBuf> = {
            let mut index = self.index.lock();
            let doomed: Vec<Fingerprint> = index
                .slots
                .iter()
                .filter(|(_, slot)| slot.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            doomed
                .iter()
                .filter_map(|key| index.remove(key).map(|slot| slot.path))
                .collect()
        };

        remove_files(&paths).await;
        paths.len()
    }

    pub(crate) async fn clear(&self) -> usize {
        let index = {
            let mut index = self.index.lock();
            let next_tick = index.next_tick;
            let taken = std::mem::take(&mut *index);
            // Versions must keep increasing so in-flight writes stay superseded
            index.next_tick = next_tick;
            taken
        };
        let paths: Vec<PathBuf> = index.slots.into_values().map(|slot| slot.path).collect();
        remove_files(&paths).await;
        paths.len()
    }

    pub fn len(&self) -> usize {
        self.index.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.index.lock().bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn decode(raw: &[u8]) -> Result<DiskRecord, CacheError> {
    bincode::deserialize(raw).map_err(|e| CacheError::Codec(e.to_string()))
}

async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension(TEMP_EXTENSION);
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| CacheError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        remove_file_quietly(&tmp).await;
        return Err(CacheError::io(path, e));
    }
    Ok(())
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        remove_file_quietly(path).await;
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache record");
        }
    }
}

/// Startup-only removal, before the tier is shared
fn discard_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache record");
        }
    }
}
