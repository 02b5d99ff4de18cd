//! Health Checks
//!
//! Liveness and readiness state plus a probe of every configured tier.
//! The memory tier is judged by budget pressure; the file and external
//! tiers by a read of a key that is never written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, Tier};

/// Key read by tier probes
const PROBE_KEY: &str = "__tiercache:health-probe";

/// Memory utilization above which the memory tier reports pressure
const MEMORY_PRESSURE: f64 = 0.99;

/// Overall or per-component status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, with a slower tier missing
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Still able to serve requests
    pub fn is_operational(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Outcome of probing one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// `cache` or `tier:<name>`
    pub component: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: u64,
}

impl ProbeResult {
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            component: component.into(),
            status,
            detail: None,
            latency_ms: 0,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn timed(mut self, started: Instant) -> Self {
        self.latency_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst component status
    pub status: HealthStatus,
    pub components: Vec<ProbeResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn new(components: Vec<ProbeResult>, uptime: Duration) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            components,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    /// Result for one component, if it was probed
    pub fn component(&self, name: &str) -> Option<&ProbeResult> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Probe one tier. A failing file or external tier degrades the cache but
/// does not stop it serving.
pub async fn probe_tier(tier: &Tier) -> ProbeResult {
    let component = format!("tier:{}", tier.kind());
    let started = Instant::now();

    let result = match tier {
        Tier::Memory(memory) if memory.utilization() > MEMORY_PRESSURE => {
            ProbeResult::new(component, HealthStatus::Degraded).with_detail(format!(
                "memory budget {:.0}% used",
                memory.utilization() * 100.0
            ))
        }
        Tier::Memory(_) => ProbeResult::new(component, HealthStatus::Healthy),
        _ => match tier.get(PROBE_KEY).await {
            Ok(_) => ProbeResult::new(component, HealthStatus::Healthy),
            Err(e) => ProbeResult::new(component, HealthStatus::Degraded).with_detail(e.to_string()),
        },
    };
    result.timed(started)
}

/// Process health state shared with the health server
pub struct HealthCheck {
    started: Instant,
    ready: AtomicBool,
}

impl HealthCheck {
    /// Not ready until [`HealthCheck::set_ready`] is called
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Flagged ready and the cache is still open
    pub fn is_ready(&self, cache: &Cache) -> bool {
        self.ready.load(Ordering::Relaxed) && !cache.is_closed()
    }

    /// Probe the cache and every configured tier
    pub async fn check(&self, cache: &Cache) -> HealthReport {
        let mut components = Vec::with_capacity(4);
        components.push(if cache.is_closed() {
            ProbeResult::new("cache", HealthStatus::Unhealthy).with_detail("closed")
        } else {
            ProbeResult::new("cache", HealthStatus::Healthy)
        });
        for tier in cache.tier_handles() {
            components.push(probe_tier(tier).await);
        }
        HealthReport::new(components, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
