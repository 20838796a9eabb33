//! Prometheus Metrics Definitions
//!
//! Defines all MAL2 metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use mal2_core::Category;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Classifier call latency buckets (seconds), up to the default per-attempt timeout.
const CLASSIFIER_LATENCY_BUCKETS: &[f64] =
    &[0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Database operation latency buckets (seconds)
const DB_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<Mal2Metrics>> = Lazy::new(Mal2Metrics::new);

/// The global metrics, or `None` if registration failed.
pub fn metrics() -> Option<&'static Mal2Metrics> {
    METRICS.as_ref().ok()
}

/// How an upload request ended, for `mal2_uploads_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Result already in the cache.
    Hit,
    /// This request ran the analysis.
    Analyzed,
    /// Waited on another request's analysis.
    Joined,
    /// Validation failed before hashing.
    Rejected,
    Failed,
}

impl UploadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Hit => "hit",
            UploadOutcome::Analyzed => "analyzed",
            UploadOutcome::Joined => "joined",
            UploadOutcome::Rejected => "rejected",
            UploadOutcome::Failed => "failed",
        }
    }
}

/// Container for all MAL2 metrics.
#[derive(Clone)]
pub struct Mal2Metrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Upload counter - labels: outcome
    pub uploads_total: CounterVec,

    /// Classifier call counter - labels: category, status
    pub classifier_calls_total: CounterVec,

    /// Classifier call duration histogram, retries included - labels: category
    pub classifier_duration_seconds: HistogramVec,

    /// Digests currently claimed for analysis
    pub inflight_claims: Gauge,

    /// Database operation counter - labels: operation, status
    pub db_operations_total: CounterVec,

    /// Database operation duration histogram - labels: operation
    pub db_operation_duration_seconds: HistogramVec,
}

fn registration_error(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

impl Mal2Metrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "mal2_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "mal2_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("http_request_duration_seconds", e))?,

            uploads_total: register_counter_vec!(
                "mal2_uploads_total",
                "Total uploads by outcome",
                &["outcome"]
            )
            .map_err(|e| registration_error("uploads_total", e))?,

            classifier_calls_total: register_counter_vec!(
                "mal2_classifier_calls_total",
                "Total classifier invocations by category",
                &["category", "status"]
            )
            .map_err(|e| registration_error("classifier_calls_total", e))?,

            classifier_duration_seconds: register_histogram_vec!(
                "mal2_classifier_duration_seconds",
                "Classifier call duration in seconds, retries included",
                &["category"],
                CLASSIFIER_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("classifier_duration_seconds", e))?,

            inflight_claims: register_gauge!(
                "mal2_inflight_claims",
                "Digests currently being analyzed"
            )
            .map_err(|e| registration_error("inflight_claims", e))?,

            db_operations_total: register_counter_vec!(
                "mal2_db_operations_total",
                "Total number of record store operations",
                &["operation", "status"]
            )
            .map_err(|e| registration_error("db_operations_total", e))?,

            db_operation_duration_seconds: register_histogram_vec!(
                "mal2_db_operation_duration_seconds",
                "Record store operation duration in seconds",
                &["operation"],
                DB_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("db_operation_duration_seconds", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status_str.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_upload(&self, outcome: UploadOutcome) {
        self.uploads_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Record one category's classification, counting all retries as one call.
    pub fn record_classifier_call(&self, category: Category, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "error" };
        self.classifier_calls_total
            .with_label_values(&[category.as_str(), status])
            .inc();
        self.classifier_duration_seconds
            .with_label_values(&[category.as_str()])
            .observe(duration_secs);
    }

    /// Set the number of in-flight claims.
    pub fn set_inflight_claims(&self, count: usize) {
        self.inflight_claims.set(count as f64);
    }

    /// Record a record store operation.
    pub fn record_db_operation(&self, operation: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "error" };
        self.db_operations_total
            .with_label_values(&[operation, status])
            .inc();
        self.db_operation_duration_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Observability",
    responses(
        (status = 200, description = "Prometheus metrics in text format", content_type = "text/plain"),
        (status = 500, description = "Failed to encode metrics"),
    ),
)]
pub async fn metrics_handler() -> impl IntoResponse {
    // Touch the registry so the mal2_* families exist before the first scrape.
    let _ = metrics();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
