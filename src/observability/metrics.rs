use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<std::result::Result<PrometheusHandle, String>> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency layer.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn record_gate_outcome(&self, method: &str, outcome: &str) {
        counter!("idempotency_requests_total", "method" => method.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_response_stored(&self, status: u16) {
        counter!("idempotency_stored_responses_total", "status" => status.to_string()).increment(1);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string(), "path" => path.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder and returns its handle.
///
/// Safe to call more than once; later calls return the first handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let installed = METRICS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| e.to_string())?;

        describe_metrics();
        METRICS.get_or_init(Metrics::new);
        Ok(handle)
    });

    installed.clone().map_err(|e| {
        AppError::Internal(anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))
    })
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Requests seen by the idempotency gate, by outcome");
    describe_counter!("idempotency_stored_responses_total", Unit::Count, "Responses persisted for replay");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Response store operations");
    describe_histogram!("idempotency_store_operation_duration_ms", Unit::Milliseconds, "Response store latency in milliseconds");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
