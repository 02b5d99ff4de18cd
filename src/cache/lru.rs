//! LRU Recency List
//!
//! Doubly-linked recency ordering over Memory-tier keys with O(1) touch,
//! insert and remove. Nodes live in a slab and link by index.
//!
//! - Head = most recently used
//! - Tail = least recently used
//!
//! The list also owns the byte/item accounting the eviction decision is
//! made from, so a single lock covers both.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: String,
    size: u64,
    prev: usize,
    next: usize,
}

/// Budget the list is held to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LruBudget {
    /// Maximum bytes before eviction kicks in (0 = tier disabled)
    pub max_bytes: u64,
    /// Optional maximum number of entries
    pub max_entries: Option<usize>,
    /// Fraction of each budget eviction stops at
    pub low_watermark: f64,
}

impl LruBudget {
    /// Byte level eviction drains down to
    pub fn low_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.low_watermark) as u64
    }

    /// Entry count eviction drains down to (rounded up, so a two-entry
    /// budget evicts a single victim)
    pub fn low_entries(&self) -> Option<usize> {
        self.max_entries
            .map(|max| ((max as f64 * self.low_watermark).ceil() as usize).clamp(1, max.max(1)))
    }

    fn exceeded(&self, bytes: u64, entries: usize) -> bool {
        bytes > self.max_bytes || self.max_entries.is_some_and(|max| entries > max)
    }

    fn above_low(&self, bytes: u64, entries: usize) -> bool {
        bytes > self.low_bytes() || self.low_entries().is_some_and(|low| entries > low)
    }
}

/// LRU recency list
#[derive(Debug, Default)]
pub struct LruList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
    bytes: u64,
}

impl LruList {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            bytes: 0,
        }
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sum of tracked entry sizes
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Move a key to the head. Returns false if the key is not tracked.
    pub fn touch(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.unlink(idx);
                self.push_front(idx);
                true
            }
            None => false,
        }
    }

    /// Insert or update a key at the head. Returns the previous size, if any.
    pub fn insert(&mut self, key: &str, size: u64) -> Option<u64> {
        if let Some(&idx) = self.index.get(key) {
            let old = self.nodes[idx].size;
            self.nodes[idx].size = size;
            self.bytes = self.bytes - old + size;
            self.unlink(idx);
            self.push_front(idx);
            return Some(old);
        }

        let node = Node {
            key: key.to_string(),
            size,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key.to_string(), idx);
        self.bytes += size;
        self.push_front(idx);
        None
    }

    /// Stop tracking a key, returning its size
    pub fn remove(&mut self, key: &str) -> Option<u64> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let size = self.nodes[idx].size;
        self.nodes[idx].key.clear();
        self.free.push(idx);
        self.bytes -= size;
        Some(size)
    }

    /// Least recently used key
    pub fn peek_lru(&self) -> Option<&str> {
        (self.tail != NIL).then(|| self.nodes[self.tail].key.as_str())
    }

    /// Remove and return the least recently used key and its size
    pub fn pop_lru(&mut self) -> Option<(String, u64)> {
        if self.tail == NIL {
            return None;
        }
        let key = self.nodes[self.tail].key.clone();
        let size = self.remove(&key)?;
        Some((key, size))
    }

    /// Whether the budget is currently exceeded
    pub fn over_budget(&self, budget: &LruBudget) -> bool {
        budget.exceeded(self.bytes, self.len())
    }

    /// Evict from the tail, in one batch, down to the low water mark.
    ///
    /// Does nothing unless the budget is exceeded. `protect` is never
    /// chosen as a victim.
    pub fn evict(&mut self, budget: &LruBudget, protect: &str) -> Vec<(String, u64)> {
        let mut victims = Vec::new();
        if !self.over_budget(budget) {
            return victims;
        }

        let mut cursor = self.tail;
        while cursor != NIL && budget.above_low(self.bytes, self.len()) {
            let prev = self.nodes[cursor].prev;
            if self.nodes[cursor].key != protect {
                let key = self.nodes[cursor].key.clone();
                if let Some(size) = self.remove(&key) {
                    victims.push((key, size));
                }
            }
            cursor = prev;
        }
        victims
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            keys.push(self.nodes[cursor].key.clone());
            cursor = self.nodes[cursor].next;
        }
        keys
    }

    /// Forget everything
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
