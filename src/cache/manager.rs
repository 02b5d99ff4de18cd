//! Cache Manager - Unified Multi-Tier Cache
//!
//! [`Cache`] is the public entry point. It routes reads through the
//! configured tiers in latency order, promotes hits into faster tiers, writes
//! through to every tier a key's strategy allows, and implements the
//! read-through `remember` pattern with per-key stampede protection.
//!
//! # Degradation
//!
//! File and External tier failures never fail a call: they are logged,
//! counted in `tier_errors` and treated as a miss (reads) or skipped
//! (writes). Only `CapacityExceeded`, `InvalidPattern`, `InvalidTtl` and
//! `Config` reach callers, plus whatever error a producer returns.
//!
//! # Stampede protection
//!
//! `remember` takes a per-key lock before running the producer, and re-reads
//! the key once the lock is held. Waiters therefore see the value stored by
//! the caller that populated it. If that value could not be stored in any
//! tier (every eligible tier failed), a waiter runs the producer again.
//! Warming takes the same lock.
//!
//! # Coherence
//!
//! Writes and deletes reach the slowest tier first and Memory last, each
//! step announced through [`Coherence`]. A read that promoted a value while
//! the key was being rewritten or deleted takes its copies back. A slower
//! tier that failed a write drops its previous copy, or is skipped for that
//! key until a later write or delete on it succeeds.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::coherence::Coherence;
use super::compression::{Codec, Compressor};
use super::entry::{category_of, CacheEntry};
use super::expiry::{self, ExpiryScheduler, SweepReport};
use super::invalidator::{self, Pattern};
use super::locks::{KeyGuard, KeyLocks};
use super::metrics::{CacheMetrics, CacheStats, LatencyTracker, Operation};
use super::strategy::{Strategy, StrategyLookup, StrategyRegistry};
use super::tier::{
    ExternalStore, ExternalTier, FileTier, HttpExternalStore, MemoryTier, Tier, TierKind,
};
use super::warmer::{self, WarmEntry, WarmReport, WarmTarget};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Per-tier usage
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TierStats {
    /// Configured tiers in read order
    pub tiers: Vec<TierKind>,
    pub memory_bytes: u64,
    pub memory_entries: usize,
    pub memory_capacity: u64,
    pub memory_utilization: f64,
    /// Record count, when the file tier is configured and readable
    pub file_entries: Option<usize>,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Cache`] from configuration and optional collaborators
pub struct CacheBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    strategies: Option<Arc<dyn StrategyLookup>>,
    external_store: Option<Arc<dyn ExternalStore>>,
    compressor: Option<Box<dyn Compressor>>,
    metrics: Option<Arc<CacheMetrics>>,
}

impl CacheBuilder {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: None,
            strategies: None,
            external_store: None,
            compressor: None,
            metrics: None,
        }
    }

    /// Time source (defaults to the system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Category lookup (defaults to the configured strategy table)
    pub fn strategies(mut self, strategies: Arc<dyn StrategyLookup>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// External store backend, enabling the External tier even without an
    /// endpoint
    pub fn external_store(mut self, store: Arc<dyn ExternalStore>) -> Self {
        self.external_store = Some(store);
        self
    }

    /// Replace the LZ4 compressor
    pub fn compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Share a metrics collector
    pub fn metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and open every configured tier
    pub async fn build(self) -> Result<Cache> {
        let config = self.config;
        config.validate()?;

        let mut tiers = Vec::with_capacity(3);

        let memory = MemoryTier::new(&config.memory_config());
        if memory.is_enabled() {
            tiers.push(Tier::Memory(memory));
        }

        if config.file_tier_enabled {
            tiers.push(Tier::File(FileTier::open(&config.file_tier_path).await?));
        }

        let store = match (self.external_store, &config.external_tier_endpoint) {
            (Some(store), _) => Some(store),
            (None, Some(endpoint)) => Some(Arc::new(HttpExternalStore::new(
                endpoint,
                config.external_timeout,
            )?) as Arc<dyn ExternalStore>),
            (None, None) => None,
        };
        if let Some(store) = store {
            if config.external_timeout.is_zero() {
                return Err(Error::Config(
                    "external_timeout must be positive when an external tier is configured"
                        .to_string(),
                ));
            }
            info!("External tier using {} store", store.name());
            tiers.push(Tier::External(ExternalTier::new(store, config.external_timeout)));
        }

        let codec = match self.compressor {
            Some(compressor) => Codec::with_compressor(config.codec_config(), compressor),
            None => Codec::new(config.codec_config()),
        };

        let strategies = self.strategies.unwrap_or_else(|| {
            Arc::new(StrategyRegistry::from_table(
                config.default_ttl,
                &config.strategy_table,
            ))
        });

        let cancel = CancellationToken::new();
        let cache = Cache {
            inner: Arc::new(CacheInner {
                tiers,
                codec,
                default_strategy: Strategy::new("default", config.default_ttl),
                strategies,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                metrics: self.metrics.unwrap_or_default(),
                locks: KeyLocks::new(),
                coherence: Coherence::new(),
                sweeper: ExpiryScheduler::new(cancel.clone()),
                cancel,
                closed: AtomicBool::new(false),
                config,
            }),
        };

        info!(
            "Cache ready with tiers {:?}",
            cache.inner.tiers.iter().map(Tier::kind).collect::<Vec<_>>()
        );
        Ok(cache)
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Multi-tier cache handle. Clones share the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: CacheConfig,
    /// Configured tiers in read order
    tiers: Vec<Tier>,
    codec: Codec,
    strategies: Arc<dyn StrategyLookup>,
    default_strategy: Strategy,
    clock: Arc<dyn Clock>,
    metrics: Arc<CacheMetrics>,
    locks: KeyLocks,
    coherence: Coherence,
    cancel: CancellationToken,
    sweeper: ExpiryScheduler,
    closed: AtomicBool,
}

impl Cache {
    /// Start building a cache
    pub fn builder(config: CacheConfig) -> CacheBuilder {
        CacheBuilder::new(config)
    }

    /// Build a cache with default collaborators
    pub async fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Get a value
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        let value = self.inner.lookup(key, true).await;
        self.inner
            .metrics
            .record_latency(Operation::Get, tracker.elapsed());
        value
    }

    /// Store a value. `ttl` defaults to the key's strategy.
    #[instrument(skip(self, value))]
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.inner.set(key, value.into(), ttl).await.map(|_| ())
    }

    /// Read-through: return the cached value, or run `producer` under the
    /// key's lock, store its result and return it. A producer error is
    /// returned unchanged and nothing is stored.
    #[instrument(skip(self, producer))]
    pub async fn remember<F, Fut, V, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> std::result::Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        V: Into<Bytes>,
        E: From<Error>,
    {
        self.inner.remember(key, ttl, producer, true).await
    }

    /// Remove a key from every tier
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.remove(key).await;
        self.inner.metrics.record_delete();
        self.inner.refresh_gauges();
        removed
    }

    /// Remove every key matching a glob pattern from every tier, returning the
    /// number of distinct keys removed
    #[instrument(skip(self))]
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let pattern = Pattern::parse(pattern)?;
        let outcome =
            invalidator::invalidate(&self.inner.tiers, &pattern, &self.inner.coherence).await;
        let metrics = &self.inner.metrics;
        metrics.record_invalidations(outcome.count() as u64);
        for _ in 0..outcome.failures {
            metrics.record_tier_error();
        }
        self.inner.refresh_gauges();
        Ok(outcome.count())
    }

    /// Populate keys ahead of demand, at most `concurrency` producers at a
    /// time (defaults to `warm_concurrency`)
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub async fn warm(&self, entries: Vec<WarmEntry>, concurrency: Option<usize>) -> WarmReport {
        let concurrency = concurrency.unwrap_or(self.inner.config.warm_concurrency);
        warmer::warm(&*self.inner, entries, concurrency, &self.inner.cancel).await
    }

    /// With probability `probability`, warm `entries` in the background.
    /// Never waits on the producers; returns whether a warm was scheduled.
    pub fn warm_on_miss(&self, entries: Vec<WarmEntry>, probability: f64) -> bool {
        if entries.is_empty() || self.is_closed() || rand::random::<f64>() >= probability {
            return false;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let report = cache.warm(entries, None).await;
            debug!("Background warm finished: {:?}", report);
        });
        true
    }

    /// Snapshot of counters and memory usage
    pub fn stats(&self) -> CacheStats {
        self.inner.refresh_gauges();
        self.inner.metrics.snapshot()
    }

    /// Zero all counters and latency samples
    pub fn reset_stats(&self) {
        self.inner.metrics.reset();
    }

    /// Per-tier usage
    pub async fn tier_stats(&self) -> TierStats {
        let mut stats = TierStats {
            tiers: self.tiers(),
            ..Default::default()
        };
        for tier in &self.inner.tiers {
            match tier {
                Tier::Memory(memory) => {
                    stats.memory_bytes = memory.size();
                    stats.memory_entries = memory.len();
                    stats.memory_capacity = memory.capacity();
                    stats.memory_utilization = memory.utilization();
                }
                Tier::File(file) => match file.len().await {
                    Ok(count) => stats.file_entries = Some(count),
                    Err(e) => warn!("Cannot count file tier records: {}", e),
                },
                Tier::External(_) => {}
            }
        }
        stats
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Typed read. A stored value that does not decode as `T` is dropped and
    /// reported as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Dropping {}: stored value does not decode: {}", key, e);
                self.inner.metrics.record_serialization_error();
                self.inner.remove(key).await;
                None
            }
        }
    }

    /// Typed write
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }

    /// Typed read-through
    pub async fn remember_json<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        if let Some(value) = self.get_json(key).await {
            return Ok(value);
        }
        let bytes = self
            .inner
            .remember(
                key,
                ttl,
                move || async move {
                    let value = producer().await?;
                    serde_json::to_vec(&value)
                        .map_err(|e| E::from(Error::from(e)))
                },
                false,
            )
            .await?;
        serde_json::from_slice(&bytes).map_err(|e| E::from(Error::from(e)))
    }

    /// Whether a live entry exists in any tier. Touches neither recency nor
    /// metrics.
    pub async fn exists(&self, key: &str) -> bool {
        self.inner.find_live(key).await.is_some()
    }

    /// Remaining lifetime of a live entry
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.inner.clock.now_millis();
        self.inner
            .find_live(key)
            .await
            .map(|entry| entry.remaining(now))
    }

    /// Remove every entry from every tier
    #[instrument(skip(self))]
    pub async fn clear(&self) {
        for tier in &self.inner.tiers {
            match tier.clear().await {
                Ok(()) => self.inner.coherence.settle_tier(tier.kind()),
                Err(e) => {
                    warn!("Clearing {} tier failed: {}", tier.kind(), e);
                    self.inner.metrics.record_tier_error();
                }
            }
        }
        self.inner.refresh_gauges();
        info!("Cache cleared");
    }

    /// Run one active-expiry pass now, returning the entries removed
    pub async fn sweep_expired(&self) -> usize {
        self.inner.sweep().await.removed
    }

    /// Start the background sweeper. Returns false if it is already running,
    /// disabled (zero interval) or the cache is closed.
    pub fn start(&self) -> bool {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        self.inner
            .sweeper
            .start(self.inner.config.active_sweep_interval, move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => Some(inner.sweep().await),
                        None => None,
                    }
                }
            })
    }

    /// Stop background work: the sweeper and any in-flight warm. Idempotent.
    /// Tiers stay usable; the file tier is written through so nothing needs
    /// flushing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.sweeper.stop().await;
        info!("Cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the sweeper task is alive
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeper.is_running()
    }

    /// Effective configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Configured tiers in read order
    pub fn tiers(&self) -> Vec<TierKind> {
        self.inner.tiers.iter().map(Tier::kind).collect()
    }

    /// Policy applied to `key`
    pub fn strategy_for(&self, key: &str) -> Strategy {
        self.inner.resolve(key)
    }

    pub(crate) fn tier_handles(&self) -> &[Tier] {
        &self.inner.tiers
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("tiers", &self.tiers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl CacheInner {
    fn resolve(&self, key: &str) -> Strategy {
        self.strategies
            .lookup(category_of(key))
            .unwrap_or_else(|| self.default_strategy.clone())
    }

    fn memory(&self) -> Option<&MemoryTier> {
        self.tiers.iter().find_map(Tier::as_memory)
    }

    fn refresh_gauges(&self) {
        if let Some(memory) = self.memory() {
            self.metrics
                .update_memory_stats(memory.size(), memory.len() as u64);
        }
    }

    /// Read path. `record` is false for the re-check under a key lock so a
    /// single call is never counted twice.
    async fn lookup(&self, key: &str, record: bool) -> Option<Bytes> {
        let now = self.clock.now_millis();
        let strategy = self.resolve(key);
        let version = self.coherence.version(key);

        for (index, tier) in self.tiers.iter().enumerate() {
            if self.coherence.is_dirty(tier.kind(), key) {
                continue;
            }
            let Some(mut entry) = self.read_tier(tier, key, now).await else {
                continue;
            };

            let value = match self.codec.decode(entry.value(), entry.is_compressed()) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Dropping {} from {} tier: {}", key, tier.kind(), e);
                    self.metrics.record_serialization_error();
                    self.drop_from(tier, key).await;
                    continue;
                }
            };

            let mut written = Vec::new();
            if strategy.sliding {
                entry.refresh(now);
                if self.slide(tier, &entry, now).await {
                    written.push(tier);
                }
            }

            for faster in &self.tiers[..index] {
                if strategy.uses(faster.kind())
                    && !self.coherence.is_dirty(faster.kind(), key)
                    && self.promote(faster, &entry).await
                {
                    written.push(faster);
                }
            }

            // The key was rewritten or deleted while this read was in flight
            if !written.is_empty() && self.coherence.version(key) != version {
                self.retract(&written, &entry).await;
            }

            if record {
                self.metrics.record_hit(tier.kind());
            }
            debug!("Hit {} in {} tier", key, tier.kind());
            return Some(value);
        }

        if record {
            self.metrics.record_miss();
        }
        None
    }

    /// One tier's live entry. Expired entries are removed, broken ones
    /// dropped, unavailable tiers skipped.
    async fn read_tier(&self, tier: &Tier, key: &str, now: u64) -> Option<CacheEntry> {
        match tier.get(key).await {
            Ok(Some(entry)) if entry.is_expired(now) => {
                self.expire(tier, key, now).await;
                None
            }
            Ok(found) => found,
            Err(Error::Serialization(reason)) => {
                warn!("Dropping {} from {} tier: {}", key, tier.kind(), reason);
                self.metrics.record_serialization_error();
                self.drop_from(tier, key).await;
                None
            }
            Err(e) => {
                warn!("Read of {} from {} tier failed: {}", key, tier.kind(), e);
                self.metrics.record_tier_error();
                None
            }
        }
    }

    /// Lazy expiry
    async fn expire(&self, tier: &Tier, key: &str, now: u64) {
        let removed = match tier {
            Tier::Memory(memory) => memory.delete_if_expired(key, now),
            _ => self.drop_from(tier, key).await,
        };
        if removed {
            self.metrics.record_expirations(1);
            debug!("Expired {} in {} tier", key, tier.kind());
        }
    }

    async fn drop_from(&self, tier: &Tier, key: &str) -> bool {
        match tier.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Delete of {} from {} tier failed: {}", key, tier.kind(), e);
                self.metrics.record_tier_error();
                false
            }
        }
    }

    /// Sliding expiration on the tier that served the read. Returns whether
    /// the entry was rewritten into a persistent tier.
    async fn slide(&self, tier: &Tier, entry: &CacheEntry, now: u64) -> bool {
        if let Tier::Memory(memory) = tier {
            memory.refresh(entry.key(), now);
            return false;
        }
        match tier.set(entry.clone()).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Refresh of {} in {} tier failed: {}", entry.key(), tier.kind(), e);
                self.metrics.record_tier_error();
                false
            }
        }
    }

    /// Back-fill a faster tier. The entry keeps its deadline.
    async fn promote(&self, tier: &Tier, entry: &CacheEntry) -> bool {
        match tier.set(entry.clone()).await {
            Ok(evicted) => {
                self.metrics.record_promotion();
                if evicted.count > 0 {
                    self.metrics.record_evictions(evicted.count, evicted.bytes);
                }
                debug!("Promoted {} into {} tier", entry.key(), tier.kind());
                true
            }
            Err(e) => {
                debug!("Promotion of {} into {} tier skipped: {}", entry.key(), tier.kind(), e);
                false
            }
        }
    }

    /// Take back copies of `entry` that a read wrote while the key was being
    /// rewritten or deleted. Copies of any other write are left alone.
    async fn retract(&self, tiers: &[&Tier], entry: &CacheEntry) {
        let key = entry.key();
        for tier in tiers {
            let withdrawn = match tier {
                Tier::Memory(memory) => Ok(memory.delete_if_same(entry)),
                _ => match tier.get(key).await {
                    Ok(Some(current)) if current.same_write(entry) => tier.delete(key).await,
                    Ok(_) => Ok(false),
                    Err(e) => Err(e),
                },
            };
            match withdrawn {
                Ok(true) => debug!("Withdrew stale copy of {} from {} tier", key, tier.kind()),
                Ok(false) => {}
                Err(e) => {
                    warn!("Withdrawing {} from {} tier failed: {}", key, tier.kind(), e);
                    self.metrics.record_tier_error();
                    self.coherence.mark_dirty(tier.kind(), key);
                }
            }
        }
    }

    /// A tier that missed a write must not keep serving the previous value
    async fn discard_stale(&self, tier: &Tier, key: &str) {
        match tier.delete(key).await {
            Ok(_) => self.coherence.settle(tier.kind(), key),
            Err(e) => {
                warn!("Dropping previous {} from {} tier failed: {}", key, tier.kind(), e);
                self.metrics.record_tier_error();
                self.coherence.mark_dirty(tier.kind(), key);
            }
        }
    }

    /// Live entry from the fastest tier holding one, without side effects
    async fn find_live(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        for tier in &self.tiers {
            if self.coherence.is_dirty(tier.kind(), key) {
                continue;
            }
            let found = match tier {
                Tier::Memory(memory) => memory.peek(key),
                _ => tier.get(key).await.ok().flatten(),
            };
            if let Some(entry) = found.filter(|e| !e.is_expired(now)) {
                return Some(entry);
            }
        }
        None
    }

    /// Write path. Returns how many tiers accepted the entry.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<usize> {
        let tracker = LatencyTracker::start();
        let strategy = self.resolve(key);
        let ttl = expiry::resolve_ttl(key, ttl, &strategy)?;

        let encoded = self.codec.encode(&value, strategy.compression);
        let entry = CacheEntry::new(
            key,
            encoded.bytes,
            encoded.original_size,
            encoded.compressed,
            self.clock.now_millis(),
            ttl,
        );

        // Reject before any tier is touched
        if let Some(memory) = self.memory().filter(|_| strategy.uses(TierKind::Memory)) {
            memory.check_capacity(key, entry.size_bytes())?;
        }
        if encoded.compressed {
            self.metrics.record_compression();
        }

        let mut stored = 0;
        for tier in self.tiers.iter().rev().filter(|t| strategy.uses(t.kind())) {
            self.coherence.bump(key);
            match tier.set(entry.clone()).await {
                Ok(evicted) => {
                    stored += 1;
                    self.coherence.settle(tier.kind(), key);
                    if evicted.count > 0 {
                        self.metrics.record_evictions(evicted.count, evicted.bytes);
                    }
                }
                Err(e) if e.is_caller_error() => return Err(e),
                Err(e) => {
                    warn!("Write of {} to {} tier failed: {}", key, tier.kind(), e);
                    self.metrics.record_tier_error();
                    self.discard_stale(tier, key).await;
                }
            }
        }

        self.metrics.record_set();
        self.refresh_gauges();
        self.metrics.record_latency(Operation::Set, tracker.elapsed());
        Ok(stored)
    }

    async fn remember<F, Fut, V, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
        check_first: bool,
    ) -> std::result::Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        V: Into<Bytes>,
        E: From<Error>,
    {
        let tracker = LatencyTracker::start();
        // A bad TTL is a caller error whether or not the key is cached
        expiry::resolve_ttl(key, ttl, &self.resolve(key))?;

        if check_first {
            if let Some(value) = self.lookup(key, true).await {
                self.metrics
                    .record_latency(Operation::Remember, tracker.elapsed());
                return Ok(value);
            }
        }

        let _guard = self.locks.acquire(key).await;
        if let Some(value) = self.lookup(key, false).await {
            debug!("{} populated while waiting", key);
            self.metrics
                .record_latency(Operation::Remember, tracker.elapsed());
            return Ok(value);
        }

        self.metrics.record_producer_call();
        let produce = LatencyTracker::start();
        let value: Bytes = producer().await?.into();
        self.metrics
            .record_latency(Operation::Produce, produce.elapsed());

        if self.set(key, value.clone(), ttl).await? == 0 {
            debug!("{} produced but not stored in any tier", key);
        }
        self.metrics
            .record_latency(Operation::Remember, tracker.elapsed());
        Ok(value)
    }

    /// Remove a key from every tier, Memory last
    async fn remove(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in self.tiers.iter().rev() {
            self.coherence.bump(key);
            match tier.delete(key).await {
                Ok(found) => {
                    removed |= found;
                    self.coherence.settle(tier.kind(), key);
                }
                Err(e) => {
                    warn!("Delete of {} from {} tier failed: {}", key, tier.kind(), e);
                    self.metrics.record_tier_error();
                    self.coherence.mark_dirty(tier.kind(), key);
                }
            }
        }
        removed
    }

    async fn sweep(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let report = expiry::purge_tiers(&self.tiers, now, &self.cancel).await;
        self.metrics.record_expirations(report.removed as u64);
        for _ in 0..report.failures {
            self.metrics.record_tier_error();
        }
        self.refresh_gauges();
        report
    }
}

#[async_trait]
impl WarmTarget for CacheInner {
    fn warm_eligible(&self, key: &str) -> bool {
        self.resolve(key).warm_eligible
    }

    async fn acquire(&self, key: &str) -> KeyGuard {
        self.locks.acquire(key).await
    }

    async fn is_live(&self, key: &str) -> bool {
        self.find_live(key).await.is_some()
    }

    async fn store(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.set(key, value, ttl).await?;
        self.metrics.record_warmed();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::tier::InMemoryExternalStore;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        cache: Cache,
        clock: Arc<ManualClock>,
        store: Arc<InMemoryExternalStore>,
    }

    fn ready(value: &'static [u8]) -> impl Future<Output = anyhow::Result<Bytes>> + Send {
        async move { Ok(Bytes::from_static(value)) }
    }

    fn base_config() -> CacheConfig {
        CacheConfig {
            active_sweep_interval: Duration::ZERO,
            default_ttl: Duration::from_secs(60),
            ..Default::default()
        }
    }

    async fn harness(config: CacheConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryExternalStore::new());
        let cache = Cache::builder(config)
            .clock(clock.clone())
            .external_store(store.clone())
            .build()
            .await
            .unwrap();
        Harness {
            cache,
            clock,
            store,
        }
    }

    async fn memory_only(config: CacheConfig) -> (Cache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = Cache::builder(config)
            .clock(clock.clone())
            .build()
            .await
            .unwrap();
        (cache, clock)
    }

    #[tokio::test]
    async fn test_cart_session_expires_after_ttl() {
        let h = harness(base_config()).await;
        let total = serde_json::json!({ "total": 100 });

        h.cache
            .set_json("cart:session:42", &total, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let cached: Option<serde_json::Value> = h.cache.get_json("cart:session:42").await;
        assert_eq!(cached, Some(total));

        h.clock.advance(Duration::from_secs(31));
        assert!(h.cache.get("cart:session:42").await.is_none());
        // Lazy expiry removed it from both tiers
        assert!(!h.store.contains("cart:session:42"));
        assert!(h.cache.stats().expirations >= 1);
    }

    #[tokio::test]
    async fn test_offer_stampede_runs_producer_once() {
        let h = harness(base_config()).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let produce = || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, Error>(Bytes::from(format!("offer-7-v{}", n)))
            }
        };

        let (a, b) = tokio::join!(
            h.cache.remember("offer:7", None, produce),
            h.cache.remember("offer:7", None, produce),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(h.cache.stats().producer_calls, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_remembers_share_one_value() {
        let h = harness(base_config()).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = h.cache.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .remember("offer:42", None, || async move {
                            let n = calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, Error>(format!("value-{}", n).into_bytes())
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v == &values[0]));
    }

    #[tokio::test]
    async fn test_lru_two_entry_budget() {
        let (cache, _) = memory_only(CacheConfig {
            memory_max_entries: Some(2),
            ..base_config()
        })
        .await;

        cache.set("A", "a", None).await.unwrap();
        cache.set("B", "b", None).await.unwrap();
        assert!(cache.get("A").await.is_some());
        cache.set("C", "c", None).await.unwrap();

        assert!(cache.exists("A").await);
        assert!(!cache.exists("B").await);
        assert!(cache.exists("C").await);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_invalidate_namespace() {
        let h = harness(base_config()).await;
        for key in ["cart:1", "cart:items:2", "offer:1"] {
            h.cache.set(key, "v", None).await.unwrap();
        }

        let removed = h.cache.invalidate_pattern("cart:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(!h.cache.exists("cart:1").await);
        assert!(!h.cache.exists("cart:items:2").await);
        assert!(h.cache.exists("offer:1").await);
        assert!(!h.store.contains("cart:1"));
        assert_eq!(h.cache.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_invalid_pattern_touches_nothing() {
        let h = harness(base_config()).await;
        h.cache.set("cart:1", "v", None).await.unwrap();

        let err = h.cache.invalidate_pattern("cart:[0-9]").await.unwrap_err();
        assert_matches!(err, Error::InvalidPattern { .. });
        assert_eq!(h.store.deletes(), 0);
        assert!(h.cache.exists("cart:1").await);
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let (cache, _) = memory_only(CacheConfig {
            compression_threshold_bytes: 64,
            ..base_config()
        })
        .await;
        let value = "offer terms and conditions ".repeat(200);

        cache.set("offer:terms", value.clone(), None).await.unwrap();
        assert_eq!(cache.get("offer:terms").await.unwrap(), value.as_bytes());

        let stats = cache.stats();
        assert_eq!(stats.compressions, 1);
        assert!(stats.bytes_used < value.len() as u64);
    }

    #[tokio::test]
    async fn test_hit_ratio() {
        let (cache, _) = memory_only(base_config()).await;
        cache.set("k", "v", None).await.unwrap();
        for _ in 0..3 {
            cache.get("k").await;
        }
        cache.get("missing").await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.75).abs() < f64::EPSILON);

        cache.reset_stats();
        assert_eq!(cache.stats().hit_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_promotion_from_external() {
        let h = harness(base_config()).await;
        h.cache.set("offer:1", "shared", None).await.unwrap();

        let other = Cache::builder(base_config())
            .clock(h.clock.clone())
            .external_store(h.store.clone())
            .build()
            .await
            .unwrap();

        assert_eq!(other.get("offer:1").await.unwrap(), "shared");
        assert_eq!(other.get("offer:1").await.unwrap(), "shared");

        let stats = other.stats();
        assert_eq!(stats.external_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.promotions, 1);
        // Promotion keeps the original deadline
        assert_eq!(other.ttl("offer:1").await, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_external_outage_degrades() {
        let h = harness(base_config()).await;
        h.store.set_available(false);

        h.cache.set("offer:1", "v", None).await.unwrap();
        assert_eq!(h.cache.get("offer:1").await.unwrap(), "v");
        assert!(h.cache.get("offer:2").await.is_none());
        assert!(h.cache.stats().tier_errors >= 2);
    }

    #[tokio::test]
    async fn test_slow_external_times_out() {
        let h = harness(CacheConfig {
            external_timeout: Duration::from_millis(20),
            ..base_config()
        })
        .await;
        h.store.set_latency(Duration::from_millis(500));

        h.cache.set("offer:1", "v", None).await.unwrap();
        assert!(!h.store.contains("offer:1"));
        // The write and the cleanup of the previous copy both timed out
        assert_eq!(h.cache.stats().tier_errors, 2);
    }

    #[tokio::test]
    async fn test_producer_error_propagates_and_stores_nothing() {
        let h = harness(base_config()).await;

        let result = h
            .cache
            .remember("offer:9", None, || async {
                Err::<Bytes, _>(anyhow::anyhow!("offers backend down"))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "offers backend down");
        assert!(!h.cache.exists("offer:9").await);
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.cache.stats().sets, 0);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_surfaced() {
        let h = harness(CacheConfig {
            memory_budget_bytes: 256,
            compression_threshold_bytes: 1 << 20,
            ..base_config()
        })
        .await;
        h.cache.set("small", "v", None).await.unwrap();

        let err = h.cache.set("big", vec![7u8; 1024], None).await.unwrap_err();
        assert_matches!(err, Error::CapacityExceeded { budget: 256, .. });
        assert!(h.cache.exists("small").await);
        assert!(!h.store.contains("big"));
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let h = harness(base_config()).await;
        let err = h
            .cache
            .set("k", "v", Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidTtl { .. });

        let called = AtomicBool::new(false);
        let flag = &called;
        let result = h
            .cache
            .remember("k", Some(Duration::ZERO), || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, Error>(Bytes::from_static(b"v"))
            })
            .await;
        assert_matches!(result, Err(Error::InvalidTtl { .. }));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_strategy_ttl_and_sliding() {
        let mut config = base_config();
        config.strategy_table = HashMap::from([
            (
                "session".to_string(),
                Strategy::new("session", Duration::from_secs(10)).with_sliding(true),
            ),
            (
                "cart".to_string(),
                Strategy::new("cart", Duration::from_secs(10)),
            ),
        ]);
        let (cache, clock) = memory_only(config).await;

        cache.set("session:1", "s", None).await.unwrap();
        cache.set("cart:1", "c", None).await.unwrap();

        clock.advance(Duration::from_secs(8));
        assert!(cache.get("session:1").await.is_some());
        assert!(cache.get("cart:1").await.is_some());

        clock.advance(Duration::from_secs(8));
        assert!(cache.get("session:1").await.is_some());
        assert!(cache.get("cart:1").await.is_none());
    }

    #[tokio::test]
    async fn test_strategy_tiers_limit_write_through() {
        let mut config = base_config();
        config.strategy_table = HashMap::from([(
            "local".to_string(),
            Strategy::new("local", Duration::from_secs(60)).with_tiers(vec![TierKind::Memory]),
        )]);
        let h = harness(config).await;

        h.cache.set("local:1", "v", None).await.unwrap();
        h.cache.set("shared:1", "v", None).await.unwrap();
        assert!(!h.store.contains("local:1"));
        assert!(h.store.contains("shared:1"));
    }

    #[tokio::test]
    async fn test_ttl_and_sweep() {
        let (cache, clock) = memory_only(base_config()).await;
        cache
            .set("a", "v", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        cache
            .set("b", "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.ttl("a").await, Some(Duration::from_secs(20)));
        assert_eq!(cache.ttl("b").await, None);

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_warm_respects_strategy_and_live_keys() {
        let mut config = base_config();
        config.strategy_table = HashMap::from([(
            "payments".to_string(),
            Strategy::new("payments", Duration::from_secs(60)).with_warm_eligible(false),
        )]);
        let h = harness(config).await;
        h.cache.set("offer:live", "old", None).await.unwrap();

        let report = h
            .cache
            .warm(
                vec![
                    WarmEntry::new("offer:1", ready(b"one")),
                    WarmEntry::new("offer:live", ready(b"new")),
                    WarmEntry::new("payments:1", ready(b"p")),
                ],
                Some(2),
            )
            .await;

        assert_eq!(report.warmed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(h.cache.get("offer:1").await.unwrap(), "one");
        assert_eq!(h.cache.get("offer:live").await.unwrap(), "old");
        assert!(h.store.contains("offer:1"));
        assert_eq!(h.cache.stats().warmed, 1);
    }

    #[tokio::test]
    async fn test_warm_on_miss() {
        let (cache, _) = memory_only(base_config()).await;

        let never = vec![WarmEntry::new("offer:1", ready(b"v"))];
        assert!(!cache.warm_on_miss(never, 0.0));

        let always = vec![WarmEntry::new("offer:2", ready(b"v"))];
        assert!(cache.warm_on_miss(always, 1.0));

        for _ in 0..100 {
            if cache.exists("offer:2").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.exists("offer:2").await);
        assert!(!cache.exists("offer:1").await);
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let (cache, _) = memory_only(CacheConfig {
            active_sweep_interval: Duration::from_millis(10),
            ..base_config()
        })
        .await;

        assert!(cache.start());
        assert!(!cache.start());
        assert!(cache.is_sweeping());

        cache.close().await;
        cache.close().await;
        assert!(cache.is_closed());
        assert!(!cache.is_sweeping());
        assert!(!cache.start());

        // Tiers stay usable, background work does not
        cache.set("k", "v", None).await.unwrap();
        let report = cache
            .warm(
                vec![WarmEntry::new("offer:1", ready(b"v"))],
                None,
            )
            .await;
        assert_eq!(report.cancelled, 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let (cache, clock) = memory_only(CacheConfig {
            active_sweep_interval: Duration::from_millis(10),
            ..base_config()
        })
        .await;
        cache
            .set("k", "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        cache.start();
        for _ in 0..100 {
            if cache.stats().entries == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.stats().entries, 0);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_file_tier_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            file_tier_enabled: true,
            file_tier_path: dir.path().to_path_buf(),
            ..base_config()
        };
        let clock = Arc::new(ManualClock::new(1_000_000));

        let first = Cache::builder(config.clone())
            .clock(clock.clone())
            .build()
            .await
            .unwrap();
        first.set("organizations:1", "acme", None).await.unwrap();
        assert_eq!(first.tier_stats().await.file_entries, Some(1));
        first.close().await;
        drop(first);

        let second = Cache::builder(config)
            .clock(clock)
            .build()
            .await
            .unwrap();
        assert_eq!(second.get("organizations:1").await.unwrap(), "acme");
        assert_eq!(second.stats().file_hits, 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_miss_and_dropped() {
        let h = harness(base_config()).await;
        h.store
            .put("offer:5", Bytes::from_static(b"junk"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(h.cache.get("offer:5").await.is_none());
        assert!(!h.store.contains("offer:5"));
        assert_eq!(h.cache.stats().serialization_errors, 1);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Offer {
        id: u32,
        discount: u8,
    }

    #[tokio::test]
    async fn test_remember_json() {
        let (cache, _) = memory_only(base_config()).await;
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        for _ in 0..2 {
            let offer: Offer = cache
                .remember_json("offer:3", None, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(Offer { id: 3, discount: 15 })
                })
                .await
                .unwrap();
            assert_eq!(offer, Offer { id: 3, discount: 15 });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_json_drops_undecodable_value() {
        let (cache, _) = memory_only(base_config()).await;
        cache.set("offer:4", "not json", None).await.unwrap();

        assert!(cache.get_json::<Offer>("offer:4").await.is_none());
        assert!(!cache.exists("offer:4").await);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let h = harness(base_config()).await;
        h.cache.set("a", "v", None).await.unwrap();
        h.cache.set("b", "v", None).await.unwrap();

        assert!(h.cache.delete("a").await);
        assert!(!h.cache.delete("a").await);
        assert!(!h.store.contains("a"));

        h.cache.clear().await;
        assert!(!h.cache.exists("b").await);
        assert!(h.store.is_empty());
        assert_eq!(h.cache.stats().bytes_used, 0);
    }

    #[tokio::test]
    async fn test_disabled_memory_tier() {
        let h = harness(CacheConfig {
            memory_budget_bytes: 0,
            ..base_config()
        })
        .await;
        assert_eq!(h.cache.tiers(), vec![TierKind::External]);

        h.cache.set("k", vec![0u8; 4096], None).await.unwrap();
        assert_eq!(h.cache.get("k").await.unwrap().len(), 4096);
    }

    // =========================================================================
    // Cross-tier coherence
    // =========================================================================

    /// A cache with only the shared store, and one reading the same store
    /// through a memory tier
    async fn writer_and_reader(store: &Arc<InMemoryExternalStore>) -> (Cache, Cache) {
        let writer = Cache::builder(CacheConfig {
            memory_budget_bytes: 0,
            ..base_config()
        })
        .external_store(store.clone())
        .build()
        .await
        .unwrap();
        let reader = Cache::builder(base_config())
            .external_store(store.clone())
            .build()
            .await
            .unwrap();
        (writer, reader)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_during_slow_read_stays_deleted() {
        let store = Arc::new(InMemoryExternalStore::new());
        let (writer, reader) = writer_and_reader(&store).await;
        writer.set("offer:1", "old", None).await.unwrap();
        store.set_latency(Duration::from_millis(50));

        let read = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.get("offer:1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(reader.delete("offer:1").await);
        read.await.unwrap();

        assert!(reader.get("offer:1").await.is_none());
        assert!(!reader.exists("offer:1").await);
        assert!(!store.contains("offer:1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidate_during_slow_read_stays_invalidated() {
        let store = Arc::new(InMemoryExternalStore::new());
        let (writer, reader) = writer_and_reader(&store).await;
        writer.set("cart:1", "old", None).await.unwrap();
        store.set_latency(Duration::from_millis(50));

        let read = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.get("cart:1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reader.invalidate_pattern("cart:*").await.unwrap(), 1);
        read.await.unwrap();

        assert!(reader.get("cart:1").await.is_none());
        assert!(!store.contains("cart:1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rewrite_during_slow_read_is_not_undone() {
        let store = Arc::new(InMemoryExternalStore::new());
        let (writer, reader) = writer_and_reader(&store).await;
        writer.set("offer:1", "old", None).await.unwrap();
        store.set_latency(Duration::from_millis(50));

        let read = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.get("offer:1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.set("offer:1", "new", None).await.unwrap();
        read.await.unwrap();

        assert_eq!(reader.get("offer:1").await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_failed_write_through_never_serves_previous_value() {
        let h = harness(CacheConfig {
            memory_max_entries: Some(1),
            ..base_config()
        })
        .await;
        h.cache.set("offer:1", "v1", None).await.unwrap();

        h.store.set_available(false);
        h.cache.set("offer:1", "v2", None).await.unwrap();
        h.store.set_available(true);

        // Pushes offer:1 out of memory; the store still holds v1
        h.cache.set("offer:2", "other", None).await.unwrap();
        assert!(h.store.contains("offer:1"));
        assert!(h.cache.get("offer:1").await.is_none());
        assert!(!h.cache.exists("offer:1").await);

        // A successful write makes the store trusted again
        h.cache.set("offer:1", "v3", None).await.unwrap();
        h.cache.set("offer:2", "other", None).await.unwrap();
        assert_eq!(h.cache.get("offer:1").await.unwrap(), "v3");
        assert_eq!(h.cache.inner.coherence.dirty_len(), 0);
    }

    /// Store that can refuse writes while reads and deletes keep working
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: InMemoryExternalStore,
        refuse_writes: AtomicBool,
    }

    #[async_trait]
    impl ExternalStore for ReadOnlyStore {
        fn name(&self) -> &str {
            "read-only"
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, record: Bytes, ttl: Duration) -> Result<()> {
            if self.refuse_writes.load(Ordering::SeqCst) {
                return Err(Error::tier(TierKind::External, "store is read-only"));
            }
            self.inner.put(key, record, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.scan(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_through_drops_previous_copy() {
        let store = Arc::new(ReadOnlyStore::default());
        let cache = Cache::builder(CacheConfig {
            memory_max_entries: Some(1),
            ..base_config()
        })
        .external_store(store.clone())
        .build()
        .await
        .unwrap();
        cache.set("offer:1", "v1", None).await.unwrap();

        store.refuse_writes.store(true, Ordering::SeqCst);
        cache.set("offer:1", "v2", None).await.unwrap();
        assert!(!store.inner.contains("offer:1"));
        assert_eq!(cache.inner.coherence.dirty_len(), 0);
        store.refuse_writes.store(false, Ordering::SeqCst);

        cache.set("offer:2", "other", None).await.unwrap();
        assert!(cache.get("offer:1").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_warm_waits_for_remember_on_same_key() {
        let (cache, _) = memory_only(base_config()).await;
        let remembering = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .remember("offer:5", None, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, Error>("remembered")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let polled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polled);
        let report = cache
            .warm(
                vec![WarmEntry::new("offer:5", async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(Bytes::from_static(b"warmed"))
                })],
                None,
            )
            .await;

        assert_eq!(remembering.await.unwrap().unwrap(), "remembered");
        assert_eq!(report.skipped, 1);
        assert_eq!(polled.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get("offer:5").await.unwrap(), "remembered");
    }

    #[tokio::test]
    async fn test_zero_external_timeout_rejected_for_injected_store() {
        let config = CacheConfig {
            external_timeout: Duration::ZERO,
            ..base_config()
        };
        let result = Cache::builder(config.clone())
            .external_store(Arc::new(InMemoryExternalStore::new()))
            .build()
            .await;
        assert_matches!(result, Err(Error::Config(_)));

        // Irrelevant without an external tier
        assert!(Cache::new(config).await.is_ok());
    }
}
