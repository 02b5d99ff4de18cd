//! Multi-Tier Cache
//!
//! Read-through caching across in-process memory, local files and an
//! external shared store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Cache (facade)                              │
//! │        get / set / remember / delete / invalidate_pattern / warm         │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Strategy Registry   │  Key Locks   │  Codec (LZ4)  │  Metrics           │
//! ├──────────────────────┴──────────────┴───────────────┴────────────────────┤
//! │  Memory Tier            │ File Tier             │ External Tier          │
//! │  ┌──────────────────┐   │ ┌─────────────────┐   │ ┌──────────────────┐   │
//! │  │ ShardedMap + LRU │   │ │ record per key  │   │ │ ExternalStore    │   │
//! │  │ byte/item budget │   │ │ temp + rename   │   │ │ bounded timeout  │   │
//! │  └──────────────────┘   │ └─────────────────┘   │ └──────────────────┘   │
//! │         ▲               │         ▲             │          │             │
//! │         └───────────────┴─────────┴─ promotion ─┴──────────┘             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Expiry: lazy check on read + background sweep (CancellationToken)       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Entry lifecycle
//!
//! `ABSENT -> LIVE` on set or produce, `LIVE -> ABSENT` on expiry, delete,
//! eviction or invalidation. Nothing returns to `LIVE` without a new write.
//!
//! # Keys
//!
//! Keys are `namespace:...:identifier`. The first segment is the key's
//! category, which selects its [`Strategy`].

mod clock;
mod coherence;
mod entry;
mod expiry;
mod invalidator;
mod locks;
mod lru;
mod manager;
mod metrics;
mod shard;
mod strategy;
mod tier;
mod warmer;
pub mod compression;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coherence::Coherence;
pub use compression::{Codec, CodecConfig, Compressor, Lz4Compressor};
pub use entry::{category_of, CacheEntry};
pub use expiry::{ExpiryScheduler, SweepReport};
pub use invalidator::{Invalidation, Pattern};
pub use locks::{KeyGuard, KeyLocks};
pub use lru::{LruBudget, LruList};
pub use manager::{Cache, CacheBuilder, TierStats};
pub use metrics::{CacheMetrics, CacheStats, Histogram, HistogramBucket, LatencyTracker, Operation};
pub use shard::ShardedMap;
pub use strategy::{Strategy, StrategyLookup, StrategyRegistry};
pub use tier::{
    Evicted, ExternalStore, ExternalTier, FileTier, HttpExternalStore, InMemoryExternalStore,
    MemoryConfig, MemoryTier, Tier, TierKind,
};
pub use warmer::{WarmEntry, WarmReport, WarmTarget, DEFAULT_WARM_CONCURRENCY};

pub use entry::NAMESPACE_SEPARATOR;
