//! OpenAPI Specification for MAL2 API
//!
//! This module defines the OpenAPI document for the MAL2 REST API.
//! It uses utoipa to generate the OpenAPI specification from Rust types
//! and route annotations.

use utoipa::OpenApi;

use crate::error::{ApiError, ErrorCode};
use crate::routes::health::{ComponentHealth, HealthDetails, HealthResponse, HealthStatus};
use crate::types::UploadResponse;

// Import route modules for path references
use crate::routes::{health, upload};
use crate::telemetry::metrics;

/// OpenAPI document for MAL2 API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "MAL2 Android APK analysis API",
        description = "Upload Android application packages and receive per-category classification. \
                       Identical content is analyzed once and served from the result cache afterwards.",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:8000", description = "Local Development")
    ),
    tags(
        (name = "Upload", description = "Artifact upload and classification"),
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Observability", description = "Prometheus metrics")
    ),
    paths(
        upload::upload_binary,
        health::ping,
        health::liveness,
        health::readiness,
        metrics::metrics_handler,
    ),
    components(schemas(
        UploadResponse,
        ApiError,
        ErrorCode,
        HealthResponse,
        HealthStatus,
        HealthDetails,
        ComponentHealth,
    ))
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate OpenAPI spec as JSON string.
    pub fn to_json() -> Result<String, serde_json::Error> {
        let openapi = Self::openapi();
        serde_json::to_string_pretty(&openapi)
    }
}
