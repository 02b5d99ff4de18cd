//! Cache Warmer
//!
//! Runs caller-supplied producers ahead of demand with bounded concurrency.
//! Results are stored exactly like a normal `set`, so warmed entries are
//! indistinguishable from organically cached ones. Each key is warmed under
//! the same per-key lock `remember` takes, so a warm never runs a producer
//! alongside a read-through for that key or overwrites what it stored.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::locks::KeyGuard;
use crate::error::Result;

/// Producers run at once when the caller gives no limit
pub const DEFAULT_WARM_CONCURRENCY: usize = 8;

/// One key to warm
pub struct WarmEntry {
    pub key: String,
    /// Explicit TTL; the key's strategy decides when absent
    pub ttl: Option<Duration>,
    producer: BoxFuture<'static, anyhow::Result<Bytes>>,
}

impl WarmEntry {
    /// Entry whose value comes from `producer`. The producer is not polled
    /// until the warmer decides the key needs it.
    pub fn new<F>(key: impl Into<String>, producer: F) -> Self
    where
        F: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        Self {
            key: key.into(),
            ttl: None,
            producer: producer.boxed(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl std::fmt::Debug for WarmEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmEntry")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Summary of a warm run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub requested: usize,
    /// Produced and stored
    pub warmed: usize,
    /// Not eligible or already live
    pub skipped: usize,
    /// Producer or store failed
    pub failed: usize,
    /// Abandoned on shutdown
    pub cancelled: usize,
}

/// Where warmed values go
#[async_trait]
pub trait WarmTarget: Send + Sync {
    /// Whether the key's category may be warmed
    fn warm_eligible(&self, key: &str) -> bool;

    /// Population lock for `key`, held across the live check, the producer
    /// and the store
    async fn acquire(&self, key: &str) -> KeyGuard;

    /// Whether a live entry already exists
    async fn is_live(&self, key: &str) -> bool;

    /// Store a produced value
    async fn store(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Warmed,
    Skipped,
    Failed,
    Cancelled,
}

/// Warm `entries` into `target`, at most `concurrency` producers at a time
pub async fn warm<T>(
    target: &T,
    entries: Vec<WarmEntry>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> WarmReport
where
    T: WarmTarget + ?Sized,
{
    let mut report = WarmReport {
        requested: entries.len(),
        ..Default::default()
    };

    let outcomes: Vec<Outcome> = futures::stream::iter(entries)
        .map(|entry| warm_one(target, entry, cancel))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        match outcome {
            Outcome::Warmed => report.warmed += 1,
            Outcome::Skipped => report.skipped += 1,
            Outcome::Failed => report.failed += 1,
            Outcome::Cancelled => report.cancelled += 1,
        }
    }
    debug!("Warm finished: {:?}", report);
    report
}

async fn warm_one<T>(target: &T, entry: WarmEntry, cancel: &CancellationToken) -> Outcome
where
    T: WarmTarget + ?Sized,
{
    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    if !target.warm_eligible(&entry.key) {
        return Outcome::Skipped;
    }

    let _guard = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Cancelled,
        guard = target.acquire(&entry.key) => guard,
    };
    if target.is_live(&entry.key).await {
        return Outcome::Skipped;
    }

    let produced = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Cancelled,
        produced = entry.producer => produced,
    };

    let value = match produced {
        Ok(value) => value,
        Err(e) => {
            warn!("Warm producer for {} failed: {:#}", entry.key, e);
            return Outcome::Failed;
        }
    };

    match target.store(&entry.key, value, entry.ttl).await {
        Ok(()) => Outcome::Warmed,
        Err(e) => {
            warn!("Warm store for {} failed: {}", entry.key, e);
            Outcome::Failed
        }
    }
}
