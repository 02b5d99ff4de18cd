//! tiercache - Multi-Tier Cache Engine
//!
//! Read-through caching across three tiers of increasing latency: an
//! in-process memory tier bounded by an LRU budget, a persistent file tier,
//! and an external shared store reached over HTTP.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ Cache ──▶ Memory ──▶ File ──▶ External
//!              │          ▲         ▲
//!              │          └─────────┴── promotion on hit
//!              └── remember(): per-key lock ─▶ producer ─▶ write-through
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::{Cache, CacheConfig};
//!
//! # async fn example() -> tiercache::Result<()> {
//! let cache = Cache::new(CacheConfig::default()).await?;
//! cache.start();
//!
//! let offer = cache
//!     .remember("offer:7", Some(Duration::from_secs(60)), || async {
//!         Ok::<_, tiercache::Error>(b"{\"discount\":15}".to_vec())
//!     })
//!     .await?;
//! assert_eq!(offer.as_ref(), b"{\"discount\":15}");
//!
//! cache.invalidate_pattern("offer:*").await?;
//! cache.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, eviction, expiry, codec, invalidation, warming and the facade
//! - [`config`] - YAML + environment configuration
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus export and health probes

pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;

pub use cache::{
    Cache, CacheBuilder, CacheStats, Strategy, StrategyLookup, StrategyRegistry, TierKind,
    WarmEntry, WarmReport,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
