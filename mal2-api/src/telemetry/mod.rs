//! MAL2 Telemetry - Observability Infrastructure
//!
//! Structured logging setup and Prometheus metrics for the API layer.

pub mod metrics;
pub mod middleware;
pub mod tracer;

pub use metrics::{metrics, metrics_handler, Mal2Metrics, UploadOutcome, METRICS};
pub use middleware::observability_middleware;
pub use tracer::{init_tracer, LogFormat, TelemetryConfig};
