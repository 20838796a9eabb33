//! Axum Middleware for HTTP Request Tracing and Metrics
//!
//! Wraps every request in a tracing span and records Prometheus metrics.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Instant;
use tracing::{info_span, Instrument};

use super::metrics::metrics;

/// Hex digests (md5 and longer) and numeric ids in a path segment.
static ID_SEGMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"/(?:[0-9a-fA-F]{32,}|\d+)(/|$)").ok());

/// Normalize path for metrics/spans (replace digests and IDs with placeholders).
///
/// This prevents high-cardinality label explosion in Prometheus.
fn normalize_path(path: &str) -> String {
    match ID_SEGMENT.as_ref() {
        Some(re) => re.replace_all(path, "/{id}$1").into_owned(),
        None => path.to_string(),
    }
}

/// Observability middleware for Axum.
///
/// Labels metrics with the matched route template when one exists,
/// otherwise with the normalized request path.
pub async fn observability_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| normalize_path(&path));

    let span = info_span!(
        "http_request",
        http.method = %method,
        http.target = %path,
        http.route = %route,
    );

    let response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    let status = response.status();

    if let Some(m) = metrics() {
        m.record_http_request(method.as_str(), &route, status.as_u16(), duration.as_secs_f64());
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_digest() {
        let path = "/api/v1/artifacts/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(normalize_path(path), "/api/v1/artifacts/{id}");
    }

    #[test]
    fn test_normalize_path_numeric_id() {
        assert_eq!(normalize_path("/api/v1/items/12345"), "/api/v1/items/{id}");
        assert_eq!(normalize_path("/api/v1/items/12345/raw"), "/api/v1/items/{id}/raw");
    }

    #[test]
    fn test_normalize_path_no_ids() {
        assert_eq!(normalize_path("/api/v1/upload/binary/"), "/api/v1/upload/binary/");
        assert_eq!(normalize_path("/health/ready"), "/health/ready");
    }
}
