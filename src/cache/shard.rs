//! One shard of the memory tier: a byte-budgeted strict LRU
//!
//! Recency is tracked with a monotonically increasing access tick per entry;
//! the ordered tick index makes the least recently used entry the first key
//! of a `BTreeMap`.

use super::entry::{CacheEntry, Tier};
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

pub(crate) enum Lookup {
    Hit(Bytes),
    /// Present but past its TTL; it has been removed
    Expired,
    Miss,
}

pub(crate) enum Insert {
    Stored {
        /// Live entries pushed out to make room, least recent first
        evicted: Vec<CacheEntry>,
        /// Expired entries dropped while making room
        expired: usize,
    },
    /// Larger than the whole shard budget; handed back untouched
    TooLarge(CacheEntry),
}

pub(crate) struct MemoryShard {
    slots: HashMap<Fingerprint, Slot>,
    recency: BTreeMap<u64, Fingerprint>,
    bytes: usize,
    budget: usize,
    next_tick: u64,
}

impl MemoryShard {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            bytes: 0,
            budget,
            next_tick: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    pub(crate) fn get(&mut self, key: &Fingerprint, now: Instant) -> Lookup {
        let Some(slot) = self.slots.get(key) else {
            return Lookup::Miss;
        };

        if slot.entry.is_expired_at(now) {
            self.remove(key);
            return Lookup::Expired;
        }

        let tick = self.tick();
        let Some(slot) = self.slots.get_mut(key) else {
            return Lookup::Miss;
        };
        self.recency.remove(&slot.tick);
        self.recency.insert(tick, key.clone());
        slot.tick = tick;
        slot.entry.touch(now);
        Lookup::Hit(slot.entry.value.clone())
    }

    /// Store `entry`, evicting least recently used entries until it fits
    pub(crate) fn insert(&mut self, mut entry: CacheEntry, now: Instant) -> Insert {
        if entry.size_bytes > self.budget {
            return Insert::TooLarge(entry);
        }

        self.remove(&entry.key);

        let mut expired = 0;
        if self.bytes + entry.size_bytes > self.budget {
            expired = self.purge_expired(now);
        }

        let mut evicted = Vec::new();
        while self.bytes + entry.size_bytes > self.budget {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                self.bytes -= slot.entry.size_bytes;
                evicted.push(slot.entry);
            }
        }

        let tick = self.tick();
        entry.tier = Tier::Memory;
        entry.touch(now);
        self.bytes += entry.size_bytes;
        self.recency.insert(tick, entry.key.clone());
        self.slots.insert(entry.key.clone(), Slot { entry, tick });

        Insert::Stored { evicted, expired }
    }

    pub(crate) fn remove(&mut self, key: &Fingerprint) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        self.bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }

    /// Remove every entry matching `predicate`, returning how many went
    pub(crate) fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let doomed: Vec<Fingerprint> = self
            .slots
            .values()
            .filter(|slot| predicate(&slot.entry))
            .map(|slot| slot.entry.key.clone())
            .collect();

        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        self.remove_where(|entry| entry.is_expired_at(now))
    }

    /// Take every entry out, least recently used first
    pub(crate) fn drain(&mut self) -> Vec<CacheEntry> {
        let order = std::mem::take(&mut self.recency);
        let mut entries = Vec::with_capacity(order.len());
        for (_, key) in order {
            if let Some(slot) = self.slots.remove(&key) {
                entries.push(slot.entry);
            }
        }
        self.slots.clear();
        self.bytes = 0;
        entries
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    #[cfg(test)]
    pub(crate) fn budget(&self) -> usize {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn entry(name: &str, size: usize, ttl: Option<Duration>) -> CacheEntry {
        let key = Fingerprint::named("t", name);
        let value_len = size - key.len();
        CacheEntry::new(key, Bytes::from(vec![0u8; value_len]), ttl)
    }

    fn key(name: &str) -> Fingerprint {
        Fingerprint::named("t", name)
    }

    fn stored(outcome: Insert) -> Vec<CacheEntry> {
        match outcome {
            Insert::Stored { evicted, .. } => evicted,
            Insert::TooLarge(_) => panic!("entry unexpectedly too large"),
        }
    }

    #[tokio::test]
    async fn test_lru_order_respects_access() {
        let mut shard = MemoryShard::new(300);
        let now = Instant::now();

        stored(shard.insert(entry("a", 100, None), now));
        stored(shard.insert(entry("b", 100, None), now));
        stored(shard.insert(entry("c", 100, None), now));

        // Touch "a" so "b" becomes least recently used
        assert!(matches!(shard.get(&key("a"), now), Lookup::Hit(_)));

        let evicted = stored(shard.insert(entry("d", 100, None), now));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, key("b"));
        assert!(matches!(shard.get(&key("b"), now), Lookup::Miss));
        assert_eq!(shard.bytes(), 300);
    }

    #[tokio::test]
    async fn test_large_insert_evicts_several() {
        let mut shard = MemoryShard::new(300);
        let now = Instant::now();

        stored(shard.insert(entry("a", 100, None), now));
        stored(shard.insert(entry("b", 100, None), now));
        stored(shard.insert(entry("c", 100, None), now));

        let evicted = stored(shard.insert(entry("big", 250, None), now));
        let keys: Vec<_> = evicted.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![key("a"), key("b"), key("c")]);
        assert_eq!(shard.len(), 1);
        assert!(shard.bytes() <= shard.budget());
    }

    #[tokio::test]
    async fn test_too_large_entry_is_returned() {
        let mut shard = MemoryShard::new(50);
        let outcome = shard.insert(entry("huge", 51, None), Instant::now());
        assert!(matches!(outcome, Insert::TooLarge(e) if e.key == key("huge")));
        assert_eq!(shard.len(), 0);
    }

    #[tokio::test]
    async fn test_replace_same_key_updates_size() {
        let mut shard = MemoryShard::new(500);
        let now = Instant::now();

        stored(shard.insert(entry("a", 100, None), now));
        stored(shard.insert(entry("a", 200, None), now));

        assert_eq!(shard.len(), 1);
        assert_eq!(shard.bytes(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_swept_before_eviction() {
        let mut shard = MemoryShard::new(200);

        stored(shard.insert(entry("short", 100, Some(Duration::from_secs(1))), Instant::now()));
        stored(shard.insert(entry("long", 100, None), Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;

        match shard.insert(entry("new", 100, None), Instant::now()) {
            Insert::Stored { evicted, expired } => {
                assert!(evicted.is_empty());
                assert_eq!(expired, 1);
            }
            Insert::TooLarge(_) => panic!("unexpected"),
        }
        assert!(matches!(shard.get(&key("long"), Instant::now()), Lookup::Hit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_read_is_removed() {
        let mut shard = MemoryShard::new(200);
        stored(shard.insert(entry("a", 100, Some(Duration::from_secs(5))), Instant::now()));

        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(matches!(shard.get(&key("a"), Instant::now()), Lookup::Expired));
        assert_eq!(shard.len(), 0);
        assert_eq!(shard.bytes(), 0);
    }

    #[tokio::test]
    async fn test_drain_returns_lru_first() {
        let mut shard = MemoryShard::new(1000);
        let now = Instant::now();
        stored(shard.insert(entry("a", 100, None), now));
        stored(shard.insert(entry("b", 100, None), now));
        shard.get(&key("a"), now);

        let drained: Vec<_> = shard.drain().into_iter().map(|e| e.key).collect();
        assert_eq!(drained, vec![key("b"), key("a")]);
        assert_eq!(shard.bytes(), 0);
    }

    proptest! {
        #[test]
        fn prop_bytes_never_exceed_budget(
            ops in proptest::collection::vec((0u8..16, 40usize..260), 1..64)
        ) {
            let mut shard = MemoryShard::new(600);
            let now = Instant::now();
            for (name, size) in ops {
                let _ = shard.insert(entry(&format!("k{name}"), size, None), now);
                prop_assert!(shard.bytes() <= shard.budget());
            }
        }
    }
}
