//! Expiry Scheduler
//!
//! Two mechanisms keep expired entries from being served:
//!
//! - Lazy: every read checks `now >= expires_at` and drops the entry
//! - Active: a background task sweeps all tiers on a fixed interval, removing
//!   entries one at a time so no lock is held longer than a single removal

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::Strategy;
use super::tier::Tier;
use crate::error::{Error, Result};

/// TTL for a write: explicit value, else the strategy's
pub fn resolve_ttl(key: &str, explicit: Option<Duration>, strategy: &Strategy) -> Result<Duration> {
    let ttl = explicit.unwrap_or(strategy.ttl);
    // Sub-millisecond TTLs round to an already-expired entry
    if ttl.as_millis() == 0 {
        return Err(Error::InvalidTtl {
            key: key.to_string(),
        });
    }
    Ok(ttl)
}

/// Result of one sweep over every tier
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed
    pub removed: usize,
    /// Tiers whose sweep failed
    pub failures: usize,
}

/// Purge entries expired at `now` from each tier in turn. Stops between
/// tiers once `cancel` fires.
pub async fn purge_tiers(tiers: &[Tier], now: u64, cancel: &CancellationToken) -> SweepReport {
    let mut report = SweepReport::default();
    for tier in tiers {
        if cancel.is_cancelled() {
            debug!("Sweep cancelled before {} tier", tier.kind());
            break;
        }
        match tier.purge_expired(now).await {
            Ok(removed) => report.removed += removed,
            Err(e) => {
                warn!("Sweep of {} tier failed: {}", tier.kind(), e);
                report.failures += 1;
            }
        }
    }
    report
}

/// Background sweep task
pub struct ExpiryScheduler {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryScheduler {
    /// Scheduler stopped by `cancel`
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handle: Mutex::new(None),
        }
    }

    /// Start sweeping every `period`. `sweep` returns `None` once its target
    /// is gone, which ends the task. Starting twice is a no-op.
    pub fn start<F, Fut>(&self, period: Duration, sweep: F) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Option<SweepReport>> + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() || period.is_zero() || self.cancel.is_cancelled() {
            return false;
        }

        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(async move {
            info!("Expiry sweeper started, interval {:?}", period);
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        match sweep().await {
                            Some(report) if report.removed > 0 => {
                                debug!("Sweep removed {} expired entries", report.removed);
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
            info!("Expiry sweeper stopped");
        }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel and wait for the task to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Expiry sweeper ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;
    use crate::cache::tier::MemoryTier;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn entry(key: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(key, Bytes::from_static(b"v"), 1, false, 0, ttl)
    }

    #[test]
    fn test_resolve_ttl() {
        let strategy = Strategy::new("cart", Duration::from_secs(30));
        assert_eq!(
            resolve_ttl("cart:1", None, &strategy).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            resolve_ttl("cart:1", Some(Duration::from_secs(5)), &strategy).unwrap(),
            Duration::from_secs(5)
        );
        assert!(matches!(
            resolve_ttl("cart:1", Some(Duration::ZERO), &strategy),
            Err(Error::InvalidTtl { .. })
        ));
        assert!(resolve_ttl("cart:1", Some(Duration::from_micros(10)), &strategy).is_err());
    }

    #[tokio::test]
    async fn test_purge_tiers() {
        let memory = MemoryTier::default();
        memory.set(entry("a", Duration::from_secs(1))).unwrap();
        memory.set(entry("b", Duration::from_secs(1))).unwrap();
        memory.set(entry("c", Duration::from_secs(60))).unwrap();
        let tiers = vec![Tier::Memory(memory)];

        let report = purge_tiers(&tiers, 5_000, &CancellationToken::new()).await;
        assert_eq!(report, SweepReport { removed: 2, failures: 0 });
        assert_eq!(tiers[0].as_memory().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_honors_cancellation() {
        let memory = MemoryTier::default();
        memory.set(entry("a", Duration::from_secs(1))).unwrap();
        let tiers = vec![Tier::Memory(memory)];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = purge_tiers(&tiers, 5_000, &cancel).await;
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn test_scheduler_ticks_until_stopped() {
        let scheduler = ExpiryScheduler::new(CancellationToken::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        assert!(scheduler.start(Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(SweepReport::default())
            }
        }));
        assert!(!scheduler.start(Duration::from_millis(10), || async { None }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_scheduler_ends_when_target_dropped() {
        let scheduler = ExpiryScheduler::new(CancellationToken::new());
        scheduler.start(Duration::from_millis(5), || async { None });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_scheduler_does_not_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = ExpiryScheduler::new(cancel);
        assert!(!scheduler.start(Duration::from_millis(5), || async { None }));
    }
}
