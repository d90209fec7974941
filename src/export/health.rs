use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "podgc";

/// Prometheus metrics for the garbage collector.
///
/// All metrics use the "podgc" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed poll cycles.
    pub cycles: Counter,
    /// Wall time of one cycle, listing through eviction.
    pub cycle_duration: Histogram,
    /// Cycles that finished after their fixed-rate tick.
    pub cycle_overruns: Counter,
    /// Workloads currently tracked.
    pub workloads_tracked: Gauge,
    /// Failed listings (the cycle is skipped).
    pub list_failures: Counter,
    /// Failed workload samples by stage (process/shell).
    pub sample_failures: CounterVec,
    /// Wall time of one workload sample.
    pub sample_duration: Histogram,
    /// Process classifications by kind (active/inactive/zombie).
    pub classifications: CounterVec,
    /// Evictions by trigger.
    pub evictions: CounterVec,
    /// Delete calls that failed.
    pub eviction_failures: Counter,
    /// Workloads that vanished without being evicted by us.
    pub workloads_disappeared: Counter,
    /// Archive failures by operation; `enqueue` counts writes dropped on a
    /// full queue.
    pub archive_errors: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = Counter::with_opts(
            Opts::new("cycles_total", "Completed poll cycles.").namespace(NAMESPACE),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("cycle_duration_seconds", "Wall time of one poll cycle.")
                .namespace(NAMESPACE)
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let cycle_overruns = Counter::with_opts(
            Opts::new(
                "cycle_overruns_total",
                "Cycles that finished after their scheduled tick.",
            )
            .namespace(NAMESPACE),
        )?;
        let workloads_tracked = Gauge::with_opts(
            Opts::new("workloads_tracked", "Number of workloads currently tracked.")
                .namespace(NAMESPACE),
        )?;
        let list_failures = Counter::with_opts(
            Opts::new("list_failures_total", "Failed workload listings.").namespace(NAMESPACE),
        )?;
        let sample_failures = CounterVec::new(
            Opts::new(
                "sample_failures_total",
                "Failed workload samples by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let sample_duration = Histogram::with_opts(
            HistogramOpts::new("sample_duration_seconds", "Wall time of one workload sample.")
                .namespace(NAMESPACE)
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let classifications = CounterVec::new(
            Opts::new(
                "classifications_total",
                "Process classifications by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let evictions = CounterVec::new(
            Opts::new("evictions_total", "Evicted workloads by trigger.").namespace(NAMESPACE),
            &["trigger"],
        )?;
        let eviction_failures = Counter::with_opts(
            Opts::new("eviction_failures_total", "Workload deletions that failed.")
                .namespace(NAMESPACE),
        )?;
        let workloads_disappeared = Counter::with_opts(
            Opts::new(
                "workloads_disappeared_total",
                "Tracked workloads that disappeared externally.",
            )
            .namespace(NAMESPACE),
        )?;
        let archive_errors = CounterVec::new(
            Opts::new("archive_errors_total", "Archive failures by operation.")
                .namespace(NAMESPACE),
            &["operation"],
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(cycle_overruns.clone()))?;
        registry.register(Box::new(workloads_tracked.clone()))?;
        registry.register(Box::new(list_failures.clone()))?;
        registry.register(Box::new(sample_failures.clone()))?;
        registry.register(Box::new(sample_duration.clone()))?;
        registry.register(Box::new(classifications.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(eviction_failures.clone()))?;
        registry.register(Box::new(workloads_disappeared.clone()))?;
        registry.register(Box::new(archive_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_duration,
            cycle_overruns,
            workloads_tracked,
            list_failures,
            sample_failures,
            sample_duration,
            classifications,
            evictions,
            eviction_failures,
            workloads_disappeared,
            archive_errors,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not UTF-8")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_addr(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Resolves the listen address, handling the ":port" shorthand.
fn bind_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
