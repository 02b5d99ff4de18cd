//! Monitoring
//!
//! Prometheus export of cache metrics and tier health probes.

pub mod exporter;
pub mod health;

pub use exporter::{LogSink, MetricsSink, PrometheusSink};
pub use health::{probe_tier, HealthCheck, HealthReport, HealthStatus, ProbeResult};
