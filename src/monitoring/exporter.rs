//! Metrics Export
//!
//! [`MetricsSink`] receives cache snapshots. [`PrometheusSink`] mirrors them
//! into a `prometheus::Registry` for the `/metrics` endpoint.

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::cache::{CacheStats, TierKind};
use crate::error::Result;

/// Destination for metric snapshots
pub trait MetricsSink: Send + Sync {
    /// Publish a snapshot
    fn export(&self, stats: &CacheStats);
}

/// Writes snapshots to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn export(&self, stats: &CacheStats) {
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_ratio = stats.hit_ratio,
            evictions = stats.evictions,
            bytes_used = stats.bytes_used,
            entries = stats.entries,
            tier_errors = stats.tier_errors,
            "Cache stats"
        );
    }
}

/// Prometheus-backed sink
pub struct PrometheusSink {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounter,
    sets: IntCounter,
    deletes: IntCounter,
    evictions: IntCounter,
    evicted_bytes: IntCounter,
    expirations: IntCounter,
    compressions: IntCounter,
    promotions: IntCounter,
    invalidations: IntCounter,
    warmed: IntCounter,
    tier_errors: IntCounter,
    serialization_errors: IntCounter,
    producer_calls: IntCounter,
    hit_ratio: Gauge,
    memory_bytes: IntGauge,
    memory_entries: IntGauge,
    latency: GaugeVec,
}

impl PrometheusSink {
    /// Create a sink with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the cache metrics into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(format!("tiercache_{}_total", name), help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let hits = IntCounterVec::new(
            Opts::new("tiercache_hits_total", "Lookups served, by tier"),
            &["tier"],
        )?;
        registry.register(Box::new(hits.clone()))?;

        let hit_ratio = Gauge::new("tiercache_hit_ratio", "hits / (hits + misses)")?;
        registry.register(Box::new(hit_ratio.clone()))?;
        let memory_bytes = IntGauge::new("tiercache_memory_bytes", "Bytes held by the memory tier")?;
        registry.register(Box::new(memory_bytes.clone()))?;
        let memory_entries =
            IntGauge::new("tiercache_memory_entries", "Entries held by the memory tier")?;
        registry.register(Box::new(memory_entries.clone()))?;
        let latency = GaugeVec::new(
            Opts::new(
                "tiercache_latency_avg_seconds",
                "Mean latency per operation since the last reset",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            misses: counter("misses", "Lookups that found nothing")?,
            sets: counter("sets", "Values written")?,
            deletes: counter("deletes", "Explicit deletes")?,
            evictions: counter("evictions", "Entries evicted from the memory tier")?,
            evicted_bytes: counter("evicted_bytes", "Bytes evicted from the memory tier")?,
            expirations: counter("expirations", "Entries removed after expiring")?,
            compressions: counter("compressions", "Values stored compressed")?,
            promotions: counter("promotions", "Entries copied into a faster tier")?,
            invalidations: counter("invalidations", "Keys removed by pattern")?,
            warmed: counter("warmed", "Entries populated by the warmer")?,
            tier_errors: counter("tier_errors", "Degraded tier operations")?,
            serialization_errors: counter("serialization_errors", "Entries dropped as undecodable")?,
            producer_calls: counter("producer_calls", "Producer invocations by remember")?,
            hits,
            hit_ratio,
            memory_bytes,
            memory_entries,
            latency,
            registry,
        })
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// Move a monotonic counter to `value`. A smaller value means the cache
/// metrics were reset, so the counter restarts too.
fn sync_counter(counter: &IntCounter, value: u64) {
    let seen = counter.get();
    if value >= seen {
        counter.inc_by(value - seen);
    } else {
        counter.reset();
        counter.inc_by(value);
    }
}

impl MetricsSink for PrometheusSink {
    fn export(&self, stats: &CacheStats) {
        for (tier, hits) in [
            (TierKind::Memory, stats.memory_hits),
            (TierKind::File, stats.file_hits),
            (TierKind::External, stats.external_hits),
        ] {
            sync_counter(&self.hits.with_label_values(&[tier.name()]), hits);
        }

        sync_counter(&self.misses, stats.misses);
        sync_counter(&self.sets, stats.sets);
        sync_counter(&self.deletes, stats.deletes);
        sync_counter(&self.evictions, stats.evictions);
        sync_counter(&self.evicted_bytes, stats.evicted_bytes);
        sync_counter(&self.expirations, stats.expirations);
        sync_counter(&self.compressions, stats.compressions);
        sync_counter(&self.promotions, stats.promotions);
        sync_counter(&self.invalidations, stats.invalidations);
        sync_counter(&self.warmed, stats.warmed);
        sync_counter(&self.tier_errors, stats.tier_errors);
        sync_counter(&self.serialization_errors, stats.serialization_errors);
        sync_counter(&self.producer_calls, stats.producer_calls);

        self.hit_ratio.set(stats.hit_ratio);
        self.memory_bytes.set(stats.bytes_used as i64);
        self.memory_entries.set(stats.entries as i64);

        for (op, avg) in [
            ("get", stats.get_latency_avg),
            ("set", stats.set_latency_avg),
            ("remember", stats.remember_latency_avg),
            ("produce", stats.produce_latency_avg),
        ] {
            self.latency
                .with_label_values(&[op])
                .set(avg.as_secs_f64());
        }
    }
}
