//! Cache Metrics Collection
//!
//! Lock-free counters and latency histograms for monitoring cache health.
//! Callers use the hit ratio to decide whether a region is cold and worth
//! warming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::tier::TierKind;

/// Histogram bucket
#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    /// Upper bound (inclusive), seconds
    pub le: f64,
    /// Count of observations
    pub count: u64,
}

/// Latency histogram (seconds)
pub struct Histogram {
    boundaries: Vec<f64>,
    buckets: Vec<AtomicU64>,
    /// Sum of observations in microseconds
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create for latency tracking (in seconds)
    pub fn latency() -> Self {
        Self::with_buckets(vec![
            0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
        ])
    }

    /// Create with custom buckets
    pub fn with_buckets(mut boundaries: Vec<f64>) -> Self {
        boundaries.sort_by(|a, b| a.total_cmp(b));
        let buckets = boundaries.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            boundaries,
            buckets,
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a duration
    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            if secs <= boundary {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observations
    pub fn sum(&self) -> Duration {
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed))
    }

    /// Mean observation
    pub fn average(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            n => self.sum() / n as u32,
        }
    }

    /// Cumulative buckets
    pub fn buckets(&self) -> Vec<HistogramBucket> {
        self.boundaries
            .iter()
            .zip(self.buckets.iter())
            .map(|(&le, count)| HistogramBucket {
                le,
                count: count.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::latency()
    }
}

/// Operation whose latency is sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
    Remember,
    Produce,
}

/// Cache metrics collector
#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    expirations: AtomicU64,
    compressions: AtomicU64,
    promotions: AtomicU64,
    invalidations: AtomicU64,
    warmed: AtomicU64,
    tier_errors: AtomicU64,
    serialization_errors: AtomicU64,
    producer_calls: AtomicU64,

    memory_hits: AtomicU64,
    file_hits: AtomicU64,
    external_hits: AtomicU64,

    bytes_used: AtomicU64,
    entries: AtomicU64,

    get_latency: Histogram,
    set_latency: Histogram,
    remember_latency: Histogram,
    produce_latency: Histogram,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            TierKind::Memory => &self.memory_hits,
            TierKind::File => &self.file_hits,
            TierKind::External => &self.external_hits,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64, bytes: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_compression(&self) {
        self.compressions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_warmed(&self) {
        self.warmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_error(&self) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serialization_error(&self) {
        self.serialization_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_call(&self) {
        self.producer_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a latency sample
    pub fn record_latency(&self, op: Operation, duration: Duration) {
        self.histogram(op).observe(duration);
    }

    /// Histogram for an operation
    pub fn histogram(&self, op: Operation) -> &Histogram {
        match op {
            Operation::Get => &self.get_latency,
            Operation::Set => &self.set_latency,
            Operation::Remember => &self.remember_latency,
            Operation::Produce => &self.produce_latency,
        }
    }

    /// Memory tier usage gauges
    pub fn update_memory_stats(&self, bytes: u64, entries: u64) {
        self.bytes_used.store(bytes, Ordering::Relaxed);
        self.entries.store(entries, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// hits / (hits + misses); 0 before any lookup
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
            sets: load(&self.sets),
            deletes: load(&self.deletes),
            evictions: load(&self.evictions),
            evicted_bytes: load(&self.evicted_bytes),
            expirations: load(&self.expirations),
            compressions: load(&self.compressions),
            promotions: load(&self.promotions),
            invalidations: load(&self.invalidations),
            warmed: load(&self.warmed),
            tier_errors: load(&self.tier_errors),
            serialization_errors: load(&self.serialization_errors),
            producer_calls: load(&self.producer_calls),
            memory_hits: load(&self.memory_hits),
            file_hits: load(&self.file_hits),
            external_hits: load(&self.external_hits),
            hit_ratio: self.hit_ratio(),
            bytes_used: load(&self.bytes_used),
            entries: load(&self.entries),
            get_latency_avg: self.get_latency.average(),
            set_latency_avg: self.set_latency.average(),
            remember_latency_avg: self.remember_latency.average(),
            produce_latency_avg: self.produce_latency.average(),
        }
    }

    /// Reset counters and latency samples. Usage gauges are left alone;
    /// they describe current state, not history.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.evictions,
            &self.evicted_bytes,
            &self.expirations,
            &self.compressions,
            &self.promotions,
            &self.invalidations,
            &self.warmed,
            &self.tier_errors,
            &self.serialization_errors,
            &self.producer_calls,
            &self.memory_hits,
            &self.file_hits,
            &self.external_hits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.get_latency.reset();
        self.set_latency.reset();
        self.remember_latency.reset();
        self.produce_latency.reset();
    }
}

/// Snapshot of cache metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub expirations: u64,
    pub compressions: u64,
    pub promotions: u64,
    pub invalidations: u64,
    pub warmed: u64,
    pub tier_errors: u64,
    pub serialization_errors: u64,
    pub producer_calls: u64,

    // Hits by tier
    pub memory_hits: u64,
    pub file_hits: u64,
    pub external_hits: u64,

    pub hit_ratio: f64,
    /// Bytes held by the memory tier
    pub bytes_used: u64,
    /// Entries held by the memory tier
    pub entries: u64,

    pub get_latency_avg: Duration,
    pub set_latency_avg: Duration,
    pub remember_latency_avg: Duration,
    pub produce_latency_avg: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
