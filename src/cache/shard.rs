//! Sharded Map Implementation
//!
//! Concurrent string-keyed hashmap used by the Memory tier.
//!
//! # Design
//!
//! - Each shard has its own RwLock, so readers of different keys never block
//!   each other and writers serialize per shard
//! - Power-of-2 shard count enables fast modulo via bitwise AND

use std::collections::HashMap;

use parking_lot::RwLock;

use super::entry::fx_hash;

/// Sharded map keyed by cache key
pub struct ShardedMap<V> {
    shards: Box<[RwLock<HashMap<String, V>>]>,
    mask: usize,
}

impl<V> ShardedMap<V> {
    /// Create a map with `shard_count` shards (rounded up to a power of two)
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Vec<RwLock<HashMap<String, V>>> =
            (0..count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: count - 1,
        }
    }

    /// Get the shard count
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        &self.shards[(fx_hash(key.as_bytes()) as usize) & self.mask]
    }

    /// Get a clone of the value
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Remove a value, returning it if present
    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Remove only if the predicate holds for the current value
    pub fn remove_if<F>(&self, key: &str, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.shard(key).write();
        match guard.get(key) {
            Some(v) if predicate(v) => guard.remove(key),
            _ => None,
        }
    }

    /// Update a value in place
    pub fn update<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        match self.shard(key).write().get_mut(key) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Keys matching a predicate on key and value, one shard lock at a time
    pub fn keys_where<F>(&self, mut predicate: F) -> Vec<String>
    where
        F: FnMut(&str, &V) -> bool,
    {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.read();
            keys.extend(
                guard
                    .iter()
                    .filter(|(k, v)| predicate(k, v))
                    .map(|(k, _)| k.clone()),
            );
        }
        keys
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}
