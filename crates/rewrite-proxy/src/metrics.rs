//! Prometheus metrics for rewrite-proxy.
//!
//! Tracks proxied requests, upstream latency, and per-script outcomes. The
//! text exposition is served by [`MetricsServer`] when a metrics port is
//! configured.
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

lazy_static! {
    /// Total number of requests processed
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "rewrite_proxy_requests_total",
        "Total number of requests processed by the proxy",
        &["method", "status"]
    )
    .unwrap();

    /// Proxy request duration
    pub static ref PROXY_REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "rewrite_proxy_request_duration_ms",
        "Total request duration including forwarding and scripts",
        &["method", "rewritten"],  // rewritten: none|headers|body
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    /// Upstream request duration (without scripts)
    pub static ref UPSTREAM_REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "rewrite_proxy_upstream_request_duration_ms",
        "Duration of origin requests, excluding script execution",
        &["method", "status"]
    )
    .unwrap();

    /// Origin requests that produced no response
    pub static ref UPSTREAM_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "rewrite_proxy_upstream_errors_total",
        "Total number of origin requests that failed",
        &["stage"]  // stage: request|body
    )
    .unwrap();

    /// Script invocation duration
    pub static ref SCRIPT_INVOCATION_DURATION_MS: HistogramVec = register_histogram_vec!(
        "rewrite_proxy_script_invocation_duration_ms",
        "Histogram of script invocation time in milliseconds",
        &["script", "outcome"],  // outcome: proposal|no_mutation|invalid_result|timed_out|failed
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
    )
    .unwrap();

    /// Transactions where the pipeline could not run at all
    pub static ref PIPELINE_FALLBACKS_TOTAL: CounterVec = register_counter_vec!(
        "rewrite_proxy_pipeline_fallbacks_total",
        "Transactions passed through because the script pipeline was unavailable",
        &["reason"]  // reason: queue_full|shut_down|timed_out|cancelled
    )
    .unwrap();

    /// Transactions waiting on the script pool
    pub static ref PIPELINE_IN_FLIGHT: IntGauge = register_int_gauge!(
        "rewrite_proxy_pipeline_in_flight",
        "Transactions submitted to the script pool and not yet answered"
    )
    .unwrap();

    /// Scripts loaded at startup
    pub static ref SCRIPTS_LOADED: IntGauge = register_int_gauge!(
        "rewrite_proxy_scripts_loaded",
        "Number of scripts in the registry"
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Helper to record request processing
pub fn record_request(method: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
}

pub fn record_proxy_duration(method: &str, duration_ms: f64, rewritten: &str) {
    PROXY_REQUEST_DURATION_MS
        .with_label_values(&[method, rewritten])
        .observe(duration_ms);
}

pub fn record_upstream_duration(method: &str, status: u16, duration_ms: f64) {
    UPSTREAM_REQUEST_DURATION_MS
        .with_label_values(&[method, &status.to_string()])
        .observe(duration_ms);
}

pub fn record_upstream_error(stage: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[stage]).inc();
}

/// Helper to record one script invocation
pub fn record_script_invocation(script: &str, outcome: &str, duration_ms: f64) {
    SCRIPT_INVOCATION_DURATION_MS
        .with_label_values(&[script, outcome])
        .observe(duration_ms);
}

pub fn record_pipeline_fallback(reason: &str) {
    PIPELINE_FALLBACKS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_pipeline_in_flight(count: usize) {
    PIPELINE_IN_FLIGHT.set(count as i64);
}

pub fn set_scripts_loaded(count: usize) {
    SCRIPTS_LOADED.set(count as i64);
}

/// Standalone exporter serving `GET /metrics`.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics listening on http://{}/metrics", self.addr);
        Self::serve(listener).await
    }

    pub async fn serve(listener: TcpListener) -> Result<(), anyhow::Error> {
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req| async move { Ok::<_, Infallible>(route(&req)) });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Metrics connection error: {}", e);
                }
            });
        }
    }
}

fn route<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if *req.method() == Method::GET && req.uri().path() == "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from(collect_metrics())));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        return response;
    }
    let mut response = Response::new(Full::new(Bytes::from_static(b"Not Found")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
