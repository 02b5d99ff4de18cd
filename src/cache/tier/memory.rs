//! Memory Tier - RAM-based Hot Cache
//!
//! Sharded hashmap for concurrent reads plus an LRU list for capacity
//! enforcement.
//!
//! # Design
//!
//! - ShardedMap: readers and writers of different shards never contend
//! - LruList under one narrow mutex holds recency order and byte accounting
//! - Lock order is LRU then shard; shard locks are never held while taking
//!   the LRU lock
//! - Budget of zero bytes disables the tier entirely

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Evicted, TierKind};
use crate::cache::entry::CacheEntry;
use crate::cache::lru::{LruBudget, LruList};
use crate::cache::shard::ShardedMap;
use crate::error::{Error, Result};

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum bytes (key + stored value); 0 disables the tier
    pub budget_bytes: u64,
    /// Optional maximum number of entries
    pub max_entries: Option<usize>,
    /// Fraction of the budget eviction drains down to
    pub low_watermark: f64,
    /// Number of map shards
    pub shard_count: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 64 * 1024 * 1024, // 64MB
            max_entries: None,
            low_watermark: 0.80,
            shard_count: 64,
        }
    }
}

/// Memory tier
pub struct MemoryTier {
    storage: ShardedMap<CacheEntry>,
    lru: Mutex<LruList>,
    budget: LruBudget,
    used_bytes: AtomicU64,
}

impl MemoryTier {
    /// Create a memory tier
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            storage: ShardedMap::new(config.shard_count),
            lru: Mutex::new(LruList::new()),
            budget: LruBudget {
                max_bytes: config.budget_bytes,
                max_entries: config.max_entries,
                low_watermark: config.low_watermark,
            },
            used_bytes: AtomicU64::new(0),
        }
    }

    /// A zero budget turns the tier off
    pub fn is_enabled(&self) -> bool {
        self.budget.max_bytes > 0 && self.budget.max_entries != Some(0)
    }

    /// Get an entry and mark it most recently used
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.storage.get(key)?;
        self.lru.lock().touch(key);
        Some(entry)
    }

    /// Get an entry without touching recency
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.storage.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    /// Reject entries that could never fit, before anything is written
    pub fn check_capacity(&self, key: &str, size: u64) -> Result<()> {
        if self.is_enabled() && size > self.budget.max_bytes {
            return Err(Error::CapacityExceeded {
                key: key.to_string(),
                size,
                budget: self.budget.max_bytes,
            });
        }
        Ok(())
    }

    /// Insert an entry and evict least recently used peers if over budget
    pub fn set(&self, entry: CacheEntry) -> Result<Evicted> {
        if !self.is_enabled() {
            return Ok(Evicted::default());
        }
        let size = entry.size_bytes();
        self.check_capacity(entry.key(), size)?;

        let key = entry.key().to_string();
        let mut lru = self.lru.lock();
        lru.insert(&key, size);
        self.storage
            .insert(key.clone(), entry.with_tier(TierKind::Memory));

        let mut evicted = Evicted::default();
        for (victim, bytes) in lru.evict(&self.budget, &key) {
            self.storage.remove(&victim);
            evicted.count += 1;
            evicted.bytes += bytes;
        }
        self.used_bytes.store(lru.bytes(), Ordering::Relaxed);

        if evicted.count > 0 {
            tracing::debug!(
                "Memory tier evicted {} entries ({} bytes)",
                evicted.count,
                evicted.bytes
            );
        }
        Ok(evicted)
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        let mut lru = self.lru.lock();
        lru.remove(key);
        let removed = self.storage.remove(key).is_some();
        self.used_bytes.store(lru.bytes(), Ordering::Relaxed);
        removed
    }

    /// Remove an entry only if it is still expired at `now`, so a concurrent
    /// rewrite is never lost to a stale expiry decision
    pub fn delete_if_expired(&self, key: &str, now: u64) -> bool {
        let mut lru = self.lru.lock();
        if self
            .storage
            .remove_if(key, |e| e.is_expired(now))
            .is_some()
        {
            lru.remove(key);
            self.used_bytes.store(lru.bytes(), Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Remove the entry only if it still holds the write `entry` came from
    pub fn delete_if_same(&self, entry: &CacheEntry) -> bool {
        let mut lru = self.lru.lock();
        if self
            .storage
            .remove_if(entry.key(), |e| e.same_write(entry))
            .is_some()
        {
            lru.remove(entry.key());
            self.used_bytes.store(lru.bytes(), Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Sliding expiration: push the entry's deadline out from `now`
    pub fn refresh(&self, key: &str, now: u64) -> bool {
        self.storage.update(key, |e| e.refresh(now))
    }

    /// Keys with the given prefix
    pub fn scan(&self, prefix: &str) -> Vec<String> {
        self.storage.keys_where(|k, _| k.starts_with(prefix))
    }

    /// Keys whose entries are expired at `now`
    pub fn expired_keys(&self, now: u64) -> Vec<String> {
        self.storage.keys_where(|_, e| e.is_expired(now))
    }

    /// Remove every entry expired at `now`, one removal per lock hold
    pub fn purge_expired(&self, now: u64) -> usize {
        self.expired_keys(now)
            .iter()
            .filter(|key| self.delete_if_expired(key, now))
            .count()
    }

    /// Keys from most to least recently used
    pub fn recency(&self) -> Vec<String> {
        self.lru.lock().keys()
    }

    /// Bytes in use
    pub fn size(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Configured byte budget
    pub fn capacity(&self) -> u64 {
        self.budget.max_bytes
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Clear the tier
    pub fn clear(&self) {
        let mut lru = self.lru.lock();
        lru.clear();
        self.storage.clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    /// Get utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.budget.max_bytes == 0 {
            return 0.0;
        }
        self.size() as f64 / self.budget.max_bytes as f64
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(&MemoryConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn make_entry(key: &str, data: &[u8], now: u64, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            Bytes::copy_from_slice(data),
            data.len() as u64,
            false,
            now,
            Duration::from_secs(ttl_secs),
        )
    }

    fn tier_with(budget_bytes: u64, max_entries: Option<usize>) -> MemoryTier {
        MemoryTier::new(&MemoryConfig {
            budget_bytes,
            max_entries,
            low_watermark: 0.8,
            shard_count: 8,
        })
    }

    #[test]
    fn test_put_get() {
        let tier = MemoryTier::default();
        tier.set(make_entry("cart:1", b"Hello, World!", 0, 60)).unwrap();

        let entry = tier.get("cart:1").unwrap();
        assert_eq!(entry.value().as_ref(), b"Hello, World!");
        assert_eq!(entry.tier(), TierKind::Memory);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size(), 6 + 13);
    }

    #[test]
    fn test_replace_updates_size() {
        let tier = MemoryTier::default();
        tier.set(make_entry("k", b"original", 0, 60)).unwrap();
        tier.set(make_entry("k", b"replaced content", 0, 60)).unwrap();
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size(), 1 + 16);
    }

    #[test]
    fn test_delete() {
        let tier = MemoryTier::default();
        tier.set(make_entry("k", b"v", 0, 60)).unwrap();
        assert!(tier.delete("k"));
        assert!(!tier.delete("k"));
        assert_eq!(tier.size(), 0);
        assert!(tier.recency().is_empty());
    }

    #[test]
    fn test_entry_budget_evicts_lru() {
        let tier = tier_with(1024, Some(2));
        tier.set(make_entry("A", b"a", 0, 60)).unwrap();
        tier.set(make_entry("B", b"b", 0, 60)).unwrap();
        tier.get("A");
        let evicted = tier.set(make_entry("C", b"c", 0, 60)).unwrap();

        assert_eq!(evicted.count, 1);
        assert!(tier.contains("A"));
        assert!(!tier.contains("B"));
        assert!(tier.contains("C"));
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let tier = tier_with(16, None);
        tier.set(make_entry("small", b"x", 0, 60)).unwrap();

        let err = tier.set(make_entry("huge", &[0u8; 64], 0, 60)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { budget: 16, .. }));
        // Unrelated key was not sacrificed
        assert!(tier.contains("small"));
    }

    #[test]
    fn test_zero_budget_disables_tier() {
        let tier = tier_with(0, None);
        assert!(!tier.is_enabled());
        tier.set(make_entry("k", b"v", 0, 60)).unwrap();
        assert!(tier.get("k").is_none());
        assert!(tier.check_capacity("k", 1_000_000).is_ok());
    }

    #[test]
    fn test_purge_expired() {
        let tier = MemoryTier::default();
        tier.set(make_entry("short", b"v", 0, 1)).unwrap();
        tier.set(make_entry("long", b"v", 0, 3600)).unwrap();

        assert_eq!(tier.purge_expired(500), 0);
        assert_eq!(tier.purge_expired(1_000), 1);
        assert!(!tier.contains("short"));
        assert!(tier.contains("long"));
        assert_eq!(tier.recency(), vec!["long".to_string()]);
    }

    #[test]
    fn test_delete_if_expired_keeps_fresh_rewrite() {
        let tier = MemoryTier::default();
        tier.set(make_entry("k", b"old", 0, 1)).unwrap();
        let stale = tier.expired_keys(2_000);
        tier.set(make_entry("k", b"new", 2_000, 60)).unwrap();

        assert_eq!(stale, vec!["k".to_string()]);
        assert!(!tier.delete_if_expired("k", 2_000));
        assert_eq!(tier.peek("k").unwrap().value().as_ref(), b"new");
    }

    #[test]
    fn test_scan_prefix() {
        let tier = MemoryTier::default();
        tier.set(make_entry("cart:1", b"v", 0, 60)).unwrap();
        tier.set(make_entry("cart:2", b"v", 0, 60)).unwrap();
        tier.set(make_entry("offer:1", b"v", 0, 60)).unwrap();
        let mut keys = tier.scan("cart:");
        keys.sort();
        assert_eq!(keys, vec!["cart:1", "cart:2"]);
    }

    #[test]
    fn test_sliding_refresh() {
        let tier = MemoryTier::default();
        tier.set(make_entry("k", b"v", 0, 10)).unwrap();
        assert!(tier.refresh("k", 5_000));
        assert_eq!(tier.peek("k").unwrap().expires_at(), 15_000);
        assert!(!tier.refresh("missing", 5_000));
    }
}
