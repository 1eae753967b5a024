use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::oa::stats::DrainEvent;

const NAMESPACE: &str = "oastream";

/// Prometheus metrics for the OA recorder.
///
/// All metrics use the "oastream" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    /// Total sample reports drained.
    pub reports: Counter,
    /// Total report-lost records.
    pub reports_lost: Counter,
    /// Total buffer-lost records.
    pub buffer_overflows: Counter,
    /// Total report pairs failing the sanity check.
    pub sanity_failures: Counter,
    /// Total reads that returned nothing and were retried.
    pub read_retries: Counter,
    /// Whether the stream is enabled (1=yes, 0=no).
    pub stream_enabled: Gauge,
    /// GPU ticks accumulated in the last window.
    pub accumulated_ticks: Gauge,
    /// Records returned by each read.
    pub read_batch_records: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let reports = Counter::with_opts(
            Opts::new("reports_total", "Total sample reports drained.").namespace(NAMESPACE),
        )?;
        let reports_lost = Counter::with_opts(
            Opts::new(
                "reports_lost_total",
                "Total reports the device dropped before they reached the ring.",
            )
            .namespace(NAMESPACE),
        )?;
        let buffer_overflows = Counter::with_opts(
            Opts::new(
                "buffer_overflows_total",
                "Total times the OA ring wrapped before it was drained.",
            )
            .namespace(NAMESPACE),
        )?;
        let sanity_failures = Counter::with_opts(
            Opts::new(
                "sanity_failures_total",
                "Total report pairs that failed the counter sanity check.",
            )
            .namespace(NAMESPACE),
        )?;
        let read_retries = Counter::with_opts(
            Opts::new(
                "read_retries_total",
                "Total reads that returned no data and were retried.",
            )
            .namespace(NAMESPACE),
        )?;
        let stream_enabled = Gauge::with_opts(
            Opts::new(
                "stream_enabled",
                "Whether the OA stream is enabled (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let accumulated_ticks = Gauge::with_opts(
            Opts::new(
                "accumulated_ticks",
                "GPU ticks accumulated in the last window.",
            )
            .namespace(NAMESPACE),
        )?;
        let read_batch_records = Histogram::with_opts(
            HistogramOpts::new("read_batch_records", "Records returned by each read.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 4.0, 16.0, 64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0,
                ]),
        )?;

        registry.register(Box::new(reports.clone()))?;
        registry.register(Box::new(reports_lost.clone()))?;
        registry.register(Box::new(buffer_overflows.clone()))?;
        registry.register(Box::new(sanity_failures.clone()))?;
        registry.register(Box::new(read_retries.clone()))?;
        registry.register(Box::new(stream_enabled.clone()))?;
        registry.register(Box::new(accumulated_ticks.clone()))?;
        registry.register(Box::new(read_batch_records.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            reports,
            reports_lost,
            buffer_overflows,
            sanity_failures,
            read_retries,
            stream_enabled,
            accumulated_ticks,
            read_batch_records,
        })
    }

    /// Adds a drain stats snapshot to the counters.
    pub fn observe_drain(&self, snapshot: &[(DrainEvent, u64)]) {
        for (event, n) in snapshot {
            let n = *n as f64;
            match event {
                DrainEvent::Sample => self.reports.inc_by(n),
                DrainEvent::ReportLost => self.reports_lost.inc_by(n),
                DrainEvent::BufferLost => self.buffer_overflows.inc_by(n),
                DrainEvent::SanityFailure => self.sanity_failures.inc_by(n),
                DrainEvent::Retry => self.read_retries.inc_by(n),
                DrainEvent::Periodic | DrainEvent::Pair => {}
            }
        }
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

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
        *self.local_addr.lock() = Some(local_addr);

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

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        conn.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        conn.read_to_string(&mut resp).await.unwrap();
        resp
    }

    #[test]
    fn test_observe_drain_snapshot() {
        let m = HealthMetrics::new("").unwrap();
        m.observe_drain(&[
            (DrainEvent::Sample, 10),
            (DrainEvent::Periodic, 9),
            (DrainEvent::ReportLost, 2),
            (DrainEvent::Retry, 3),
        ]);
        assert_eq!(m.reports.get(), 10.0);
        assert_eq!(m.reports_lost.get(), 2.0);
        assert_eq!(m.read_retries.get(), 3.0);
        assert_eq!(m.buffer_overflows.get(), 0.0);

        let text = m.render().unwrap();
        assert!(text.contains("oastream_reports_total 10"));
        assert!(text.contains("oastream_read_batch_records_bucket"));
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let m = HealthMetrics::new("127.0.0.1:0").unwrap();
        m.stream_enabled.set(1.0);
        m.start().await.unwrap();
        let addr = m.local_addr().unwrap();

        let health = get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("oastream_stream_enabled 1"));

        m.stop().await.unwrap();
    }
}
