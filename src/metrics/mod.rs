use crate::error::{GatewayError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "authgate_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "authgate_request_duration_seconds",
            "End-to-end request latencies in seconds"
        );

        describe_counter!(
            "authgate_probes_total",
            "Authorization probes by outcome (allowed, denied, error)"
        );
        describe_histogram!(
            "authgate_probe_duration_seconds",
            "Authorization probe latencies in seconds"
        );

        describe_counter!(
            "authgate_forwards_total",
            "Requests forwarded to the upstream target"
        );
        describe_counter!(
            "authgate_forward_errors_total",
            "Forwards that failed with a transport error"
        );
        describe_histogram!(
            "authgate_forward_duration_seconds",
            "Forward latencies in seconds"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    let metrics = service.render();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics))
        .map_err(|e| GatewayError::Internal(format!("Failed to build metrics response: {}", e)))
}

/// Outcome of an authorization probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Allowed,
    Denied,
    Error,
}

impl ProbeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeResult::Allowed => "allowed",
            ProbeResult::Denied => "denied",
            ProbeResult::Error => "error",
        }
    }
}

/// Record an authorization probe
pub fn record_probe(result: ProbeResult, duration: f64) {
    let labels = [("outcome", result.as_str().to_string())];

    counter!("authgate_probes_total", &labels).increment(1);
    histogram!("authgate_probe_duration_seconds", &labels).record(duration);
}

/// Record a completed forward
pub fn record_forward(method: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("authgate_forwards_total", &labels).increment(1);
    histogram!("authgate_forward_duration_seconds", &labels).record(duration);
}

/// Record a forward that failed before a response arrived
pub fn record_forward_error(method: &str) {
    let labels = [("method", method.to_string())];
    counter!("authgate_forward_errors_total", &labels).increment(1);
}

/// Record an inbound request
pub fn record_request(method: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("authgate_requests_total", &labels).increment(1);
    histogram!("authgate_request_duration_seconds", &labels).record(duration);
}

/// Timer for measuring request duration
pub struct Timer {
    start: Instant,
    method: String,
}

impl Timer {
    /// Start a new timer for a request
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            method: method.into(),
        }
    }

    /// Record the elapsed time with the given status code
    pub fn record(self, status: u16) {
        let duration = self.elapsed();
        record_request(&self.method, status, duration);
    }

    /// Get the elapsed time in seconds
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
