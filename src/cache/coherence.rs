//! Cross-Tier Coherence
//!
//! Bookkeeping that keeps the tiers from disagreeing about a key.
//!
//! # Write versions
//!
//! A striped counter per key hash, bumped before any write or delete reaches
//! a tier. A read snapshots the key's stripe before it looks at any tier.
//! If the stripe moved by the time the read has promoted its entry, the
//! promotion may carry a value that was deleted or overwritten meanwhile, so
//! it is taken back.
//!
//! # Dirty marks
//!
//! A slower tier that failed a write and then failed to drop its previous
//! copy still holds a value older than the latest write. The key is marked
//! dirty for that tier and reads skip it until a later write or delete on
//! that tier succeeds.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;

use super::entry::fx_hash;
use super::tier::TierKind;

/// Version stripes; power of two
const VERSION_STRIPES: usize = 256;

/// Write versions and dirty marks shared by every cache operation
pub struct Coherence {
    versions: Box<[AtomicU64]>,
    dirty: DashSet<(TierKind, String)>,
}

impl Coherence {
    pub fn new() -> Self {
        Self {
            versions: (0..VERSION_STRIPES).map(|_| AtomicU64::new(0)).collect(),
            dirty: DashSet::new(),
        }
    }

    fn stripe(&self, key: &str) -> &AtomicU64 {
        &self.versions[fx_hash(key.as_bytes()) as usize & (VERSION_STRIPES - 1)]
    }

    /// Current write version of `key`'s stripe
    pub fn version(&self, key: &str) -> u64 {
        self.stripe(key).load(Ordering::SeqCst)
    }

    /// Announce a write or delete of `key`
    pub fn bump(&self, key: &str) {
        self.stripe(key).fetch_add(1, Ordering::SeqCst);
    }

    /// Whether `tier` may hold a stale copy of `key`
    pub fn is_dirty(&self, tier: TierKind, key: &str) -> bool {
        !self.dirty.is_empty() && self.dirty.contains(&(tier, key.to_string()))
    }

    pub fn mark_dirty(&self, tier: TierKind, key: &str) {
        tracing::warn!("{} tier may hold a stale copy of {}; skipping it for reads", tier, key);
        self.dirty.insert((tier, key.to_string()));
    }

    /// `tier` now agrees with the latest write or delete of `key`
    pub fn settle(&self, tier: TierKind, key: &str) {
        if !self.dirty.is_empty() {
            self.dirty.remove(&(tier, key.to_string()));
        }
    }

    /// Forget every mark for `tier`, after it was emptied
    pub fn settle_tier(&self, tier: TierKind) {
        self.dirty.retain(|(kind, _)| *kind != tier);
    }

    /// Keys marked dirty in any tier
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }
}

impl Default for Coherence {
    fn default() -> Self {
        Self::new()
    }
}
