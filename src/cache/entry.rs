//! Cached values and their bookkeeping

use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Storage tier an entry currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Disk,
}

/// A cached result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Fingerprint,
    pub value: Bytes,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    /// `None` never expires
    pub ttl: Option<Duration>,
    /// Bytes charged against the tier budget (key + value)
    pub size_bytes: usize,
    pub tier: Tier,
}

impl CacheEntry {
    pub fn new(key: Fingerprint, value: Bytes, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        let size_bytes = footprint(&key, &value);
        Self {
            key,
            value,
            created_at: now,
            last_accessed_at: now,
            ttl,
            size_bytes,
            tier: Tier::Memory,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.ttl
            .map(|ttl| now.saturating_duration_since(self.created_at) >= ttl)
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry; `None` for entries without a TTL
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(now.saturating_duration_since(self.created_at)))
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
    }
}

pub(crate) fn footprint(key: &Fingerprint, value: &[u8]) -> usize {
    key.len() + value.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Fingerprint {
        Fingerprint::named("test", "entry")
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_follows_ttl() {
        let entry = CacheEntry::new(key(), Bytes::from_static(b"v"), Some(Duration::from_secs(10)));
        assert!(!entry.is_expired());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            entry.remaining_ttl(Instant::now()),
            Some(Duration::from_secs(6))
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(Instant::now()), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ttl_never_expires() {
        let entry = CacheEntry::new(key(), Bytes::from_static(b"v"), None);
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert!(!entry.is_expired());
        assert_eq!(entry.remaining_ttl(Instant::now()), None);
    }

    #[test]
    fn test_size_counts_key_and_value() {
        let entry = CacheEntry::new(key(), Bytes::from(vec![0u8; 100]), None);
        assert_eq!(entry.size_bytes, "test:entry".len() + 100);
        assert_eq!(entry.tier, Tier::Memory);
    }
}
