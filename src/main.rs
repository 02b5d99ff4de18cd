//! tiercache daemon
//!
//! Runs a cache instance with its background sweeper and exposes metrics and
//! health endpoints.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         tiercache                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    │
//! │  │   /metrics   │◀───│    Cache     │───▶│  /healthz    │    │
//! │  │  Prometheus  │    │  + sweeper   │    │  /readyz     │    │
//! │  └──────────────┘    └──────────────┘    └──────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::config::format_duration;
use tiercache::monitoring::{HealthCheck, LogSink, MetricsSink, PrometheusSink};
use tiercache::{Cache, CacheConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - Multi-tier cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; TIERCACHE_* variables override it
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between stats log lines (0 disables)
    #[arg(long, env = "STATS_LOG_INTERVAL_SECONDS", default_value = "60")]
    stats_log_interval_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:9091")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = CacheConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    info!("Starting tiercache");
    info!("  Memory budget: {} bytes", config.memory_budget_bytes);
    info!("  File tier: {}", config.file_tier_enabled);
    info!(
        "  External tier: {}",
        config.external_tier_endpoint.as_deref().unwrap_or("disabled")
    );
    info!("  Default TTL: {}", format_duration(config.default_ttl));
    info!(
        "  Sweep interval: {}",
        format_duration(config.active_sweep_interval)
    );

    let cache = Cache::new(config).await.context("Failed to build cache")?;
    info!("Cache tiers: {:?}", cache.tiers());
    cache.start();

    let health = Arc::new(HealthCheck::new());
    let sink = Arc::new(PrometheusSink::new().context("Failed to register metrics")?);

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_cache = cache.clone();
    let health_check = Arc::clone(&health);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache, health_check).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_cache = cache.clone();
    let metrics_sink = Arc::clone(&sink);
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_cache, metrics_sink).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    if args.stats_log_interval_seconds > 0 {
        let stats_cache = cache.clone();
        let period = Duration::from_secs(args.stats_log_interval_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            while !stats_cache.is_closed() {
                interval.tick().await;
                LogSink.export(&stats_cache.stats());
            }
        });
    }

    health.set_ready(true);
    info!("tiercache ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    health.set_ready(false);
    cache.close().await;
    LogSink.export(&cache.stats());

    info!("tiercache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn health_handler(
    req: Request<hyper::body::Incoming>,
    cache: Cache,
    health: Arc<HealthCheck>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => {
            if health.is_ready(&cache) {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        "/healthz" => {
            let report = health.check(&cache).await;
            let status = if report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let body = serde_json::to_vec(&report).unwrap_or_default();
            Response::builder()
                .status(status)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_health_server(addr: &str, cache: Cache, health: Arc<HealthCheck>) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid health server address: {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Health server accept error")?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let health = Arc::clone(&health);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, cache.clone(), Arc::clone(&health)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
    cache: Cache,
    sink: Arc<PrometheusSink>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            sink.export(&cache.stats());
            match sink.encode() {
                Ok((content_type, buffer)) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", content_type)
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap(),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
                }
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(addr: &str, cache: Cache, sink: Arc<PrometheusSink>) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics server address: {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Metrics server accept error")?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let sink = Arc::clone(&sink);

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, cache.clone(), Arc::clone(&sink)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
