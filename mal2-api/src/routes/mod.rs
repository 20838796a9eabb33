//! REST API Routes Module
//!
//! Includes:
//! - Binary upload and classification under /api/v1
//! - Health check endpoints (Kubernetes-compatible)
//! - Prometheus metrics and the OpenAPI document
//! - CORS support for browser-based clients

pub mod health;
pub mod upload;

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware::from_fn,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

// Re-export route creation functions for convenience
pub use health::create_router as health_router;
pub use upload::create_router as upload_router;

// ============================================================================
// OPENAPI ENDPOINTS
// ============================================================================

/// Handler for /openapi.json endpoint.
#[cfg(all(feature = "openapi", not(feature = "swagger-ui")))]
async fn openapi_json() -> impl axum::response::IntoResponse {
    use utoipa::OpenApi;
    axum::Json(crate::openapi::ApiDoc::openapi())
}

async fn not_found() -> ApiError {
    ApiError::not_found("No such route")
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the CORS layer from ApiConfig.
///
/// With no configured origins every origin is allowed.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::RETRY_AFTER])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        cors.allow_origin(Any).allow_headers(Any)
    } else {
        tracing::info!("CORS: allowing origins: {:?}", config.cors_origins);
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

/// Create the complete API router.
///
/// # Routes
/// - POST /api/v1/upload/binary/
/// - GET /health/{ping,live,ready}
/// - GET /metrics
/// - GET /openapi.json, Swagger UI at /api/v1/docs (swagger-ui feature)
pub fn create_api_router(state: AppState, api_config: &ApiConfig) -> Router {
    // Uploads are size-checked while streaming, so axum's default body cap is lifted.
    let api_routes = upload::create_router().layer(DefaultBodyLimit::disable());

    #[allow(unused_mut)]
    let mut router: Router<AppState> = Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler))
        .fallback(not_found);

    #[cfg(feature = "swagger-ui")]
    {
        use utoipa::OpenApi;
        use utoipa_swagger_ui::SwaggerUi;
        router = router.merge(
            SwaggerUi::new("/api/v1/docs").url("/openapi.json", crate::openapi::ApiDoc::openapi()),
        );
    }

    #[cfg(all(feature = "openapi", not(feature = "swagger-ui")))]
    {
        router = router.route("/openapi.json", get(openapi_json));
    }

    router
        .with_state(state)
        .layer(from_fn(observability_middleware))
        .layer(build_cors_layer(api_config))
}
