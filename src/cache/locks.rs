//! Per-key population locks
//!
//! `remember` serializes producers for the same key through a lock table.
//! A slot lives only while someone holds or waits on it; the last guard to
//! drop removes it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by cache key
#[derive(Default)]
pub struct KeyLocks {
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive population rights on `key`
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Keys with a holder or waiter
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Held population lock
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the slot's only remaining references are the
        // table's and those of waiters
        drop(self.guard.take());
        // The table holds one reference; anything more is a waiter
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
