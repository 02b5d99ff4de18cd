//! Storage Tiers
//!
//! A closed set of backing stores behind one capability:
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬──────────────────────────┐
//! │ Memory           │ File                 │ External                 │
//! │ ShardedMap + LRU │ one record per key   │ ExternalStore over HTTP  │
//! │ ~ns              │ ~µs-ms               │ ~ms, bounded by timeout  │
//! └──────────────────┴──────────────────────┴──────────────────────────┘
//! ```
//!
//! Tiers are consulted in that order. Every tier stores the same encoded
//! [`CacheEntry`]; expiry is checked by the caller so the policy is uniform.

mod external;
mod file;
mod memory;

pub use external::{ExternalStore, ExternalTier, HttpExternalStore, InMemoryExternalStore};
pub use file::FileTier;
pub use memory::{MemoryConfig, MemoryTier};

use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use crate::error::Result;

/// Tier identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process memory (hot)
    Memory,
    /// Local file store (warm)
    File,
    /// External shared store (cold)
    External,
}

impl TierKind {
    /// All tiers in read order
    pub const ALL: [TierKind; 3] = [TierKind::Memory, TierKind::File, TierKind::External];

    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::File => "file",
            TierKind::External => "external",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Entries pushed out of a tier by a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evicted {
    /// Number of entries evicted
    pub count: u64,
    /// Bytes freed
    pub bytes: u64,
}

/// One configured storage tier
pub enum Tier {
    Memory(MemoryTier),
    File(FileTier),
    External(ExternalTier),
}

impl Tier {
    /// Which tier this is
    pub fn kind(&self) -> TierKind {
        match self {
            Tier::Memory(_) => TierKind::Memory,
            Tier::File(_) => TierKind::File,
            Tier::External(_) => TierKind::External,
        }
    }

    /// Look up an entry. Memory lookups bump recency.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self {
            Tier::Memory(t) => Ok(t.get(key)),
            Tier::File(t) => t.get(key).await,
            Tier::External(t) => t.get(key).await,
        }
    }

    /// Store an entry, replacing any previous one for the same key
    pub async fn set(&self, entry: CacheEntry) -> Result<Evicted> {
        match self {
            Tier::Memory(t) => t.set(entry),
            Tier::File(t) => t.set(entry).await.map(|_| Evicted::default()),
            Tier::External(t) => t.set(entry).await.map(|_| Evicted::default()),
        }
    }

    /// Remove an entry, returning whether one was present
    pub async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            Tier::Memory(t) => Ok(t.delete(key)),
            Tier::File(t) => t.delete(key).await,
            Tier::External(t) => t.delete(key).await,
        }
    }

    /// Keys starting with `prefix`
    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Tier::Memory(t) => Ok(t.scan(prefix)),
            Tier::File(t) => t.scan(prefix).await,
            Tier::External(t) => t.scan(prefix).await,
        }
    }

    /// Remove entries expired at `now`, returning how many went
    pub async fn purge_expired(&self, now: u64) -> Result<usize> {
        match self {
            Tier::Memory(t) => Ok(t.purge_expired(now)),
            Tier::File(t) => t.purge_expired(now).await,
            // The shared store expires records itself from the TTL hint sent on
            // write; reads still apply the lazy check.
            Tier::External(_) => Ok(0),
        }
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<()> {
        match self {
            Tier::Memory(t) => {
                t.clear();
                Ok(())
            }
            Tier::File(t) => t.clear().await,
            Tier::External(t) => {
                for key in t.scan("").await? {
                    t.delete(&key).await?;
                }
                Ok(())
            }
        }
    }

    /// Memory tier, if this is one
    pub fn as_memory(&self) -> Option<&MemoryTier> {
        match self {
            Tier::Memory(t) => Some(t),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tier").field(&self.kind()).finish()
    }
}
