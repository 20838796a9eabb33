//! Error Types for MAL2 API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use mal2_core::{
    CacheError, DigestSet, Mal2Error, StorageError, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds a client should wait before retrying a 503.
pub const RETRY_AFTER_SECS: u64 = 5;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code and represents
/// a category of error that can occur during API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400, 413, 415)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Required field is missing from request
    MissingField,

    /// Request contains invalid input data
    InvalidInput,

    /// Upload is not an accepted artifact type
    UnsupportedMediaType,

    /// Upload exceeds the configured size limit
    PayloadTooLarge,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested route or entity does not exist
    EntityNotFound,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// Another request is analyzing the same content; retry later
    AnalysisInProgress,

    /// The classifier failed after all retries
    ClassificationUnavailable,

    /// Reading or writing artifact bytes failed
    StorageError,

    /// Internal server error
    InternalError,

    /// Database operation failed
    DatabaseError,

    /// Service is temporarily unavailable
    ServiceUnavailable,

    /// Database connection pool exhausted
    ConnectionPoolExhausted,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed | ErrorCode::MissingField | ErrorCode::InvalidInput => {
                StatusCode::BAD_REQUEST
            }

            ErrorCode::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            ErrorCode::AnalysisInProgress
            | ErrorCode::ClassificationUnavailable
            | ErrorCode::ServiceUnavailable
            | ErrorCode::ConnectionPoolExhausted => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::StorageError | ErrorCode::InternalError | ErrorCode::DatabaseError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::UnsupportedMediaType => "Unsupported content type",
            ErrorCode::PayloadTooLarge => "Upload is too large",
            ErrorCode::EntityNotFound => "Not found",
            ErrorCode::AnalysisInProgress => "Analysis of this content is in progress",
            ErrorCode::ClassificationUnavailable => "Classification is temporarily unavailable",
            ErrorCode::StorageError => "Artifact storage failed",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::ConnectionPoolExhausted => "Connection pool exhausted",
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        self.status_code() == StatusCode::SERVICE_UNAVAILABLE
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (digests, retry hints, accepted types)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details: None,
        }
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    /// Create an UnsupportedMediaType error listing what is accepted.
    pub fn unsupported_media_type(content_type: &str, accepted: &[String]) -> Self {
        Self::new(
            ErrorCode::UnsupportedMediaType,
            format!(
                "Content type '{}' is not accepted; upload an Android APK ({})",
                content_type,
                accepted.join(", ")
            ),
        )
        .with_details(serde_json::json!({
            "content_type": content_type,
            "accepted": accepted,
        }))
    }

    pub fn payload_too_large(limit_bytes: u64) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("Upload exceeds the limit of {} bytes", limit_bytes),
        )
        .with_details(serde_json::json!({ "limit_bytes": limit_bytes }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EntityNotFound, message)
    }

    /// Create a retryable AnalysisInProgress error.
    pub fn analysis_in_progress(sha256: &str, waited_ms: u64) -> Self {
        Self::new(
            ErrorCode::AnalysisInProgress,
            format!(
                "Analysis of {} is still in progress after {} ms; retry later",
                sha256, waited_ms
            ),
        )
        .with_details(serde_json::json!({
            "sha256": sha256,
            "waited_ms": waited_ms,
            "retry_after_secs": RETRY_AFTER_SECS,
        }))
    }

    /// Create a ClassificationUnavailable error carrying the upload's digests.
    pub fn classification_unavailable(digests: &DigestSet, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ClassificationUnavailable,
            format!("Classification unavailable: {}", reason),
        )
        .with_details(serde_json::json!({
            "md5": digests.md5,
            "sha1": digests.sha1,
            "sha256": digests.sha256,
            "retry_after_secs": RETRY_AFTER_SECS,
        }))
    }

    pub fn storage_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn connection_pool_exhausted() -> Self {
        Self::from_code(ErrorCode::ConnectionPoolExhausted)
            .with_details(serde_json::json!({ "retry_after_secs": RETRY_AFTER_SECS }))
    }

    fn retry_after(&self) -> Option<u64> {
        self.details
            .as_ref()
            .and_then(|d| d.get("retry_after_secs"))
            .and_then(|v| v.as_u64())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

/// Retryable errors also carry a `Retry-After` header.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();
        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// ============================================================================
// CONVERSIONS FROM DOMAIN AND STANDARD ERRORS
// ============================================================================

impl From<Mal2Error> for ApiError {
    fn from(err: Mal2Error) -> Self {
        match err {
            Mal2Error::Validation(v) => match v {
                ValidationError::RequiredFieldMissing { field } => ApiError::missing_field(&field),
                ValidationError::UnsupportedContentType {
                    content_type,
                    accepted,
                } => ApiError::unsupported_media_type(&content_type, &accepted),
                ValidationError::PayloadTooLarge { limit_bytes } => {
                    ApiError::payload_too_large(limit_bytes)
                }
                ValidationError::InvalidValue { field, reason } => {
                    ApiError::invalid_input(format!("Invalid value for '{}': {}", field, reason))
                }
            },
            Mal2Error::Io(io) => {
                tracing::error!(error = %io, "Artifact I/O failure");
                ApiError::storage_error(format!("Artifact {} failed", io.operation))
            }
            Mal2Error::Classifier(c) => {
                tracing::error!(error = %c, "Classifier failure");
                ApiError::new(
                    ErrorCode::ClassificationUnavailable,
                    format!("Classification unavailable: {}", c),
                )
                .with_details(serde_json::json!({ "retry_after_secs": RETRY_AFTER_SECS }))
            }
            Mal2Error::Cache(CacheError::AnalysisInProgress { sha256, waited_ms }) => {
                ApiError::analysis_in_progress(&sha256, waited_ms)
            }
            Mal2Error::Cache(CacheError::Inconsistency { sha256, reason }) => {
                tracing::error!(sha256 = %sha256, reason = %reason, "Result cache inconsistency");
                ApiError::internal_error("Result cache inconsistency")
            }
            Mal2Error::Storage(StorageError::PoolExhausted { reason }) => {
                tracing::error!(reason = %reason, "Record store pool exhausted");
                ApiError::connection_pool_exhausted()
            }
            Mal2Error::Storage(StorageError::Pool { reason }) => {
                tracing::error!(reason = %reason, "Record store pool failure");
                ApiError::service_unavailable("Record store is unavailable")
            }
            Mal2Error::Storage(s) => {
                tracing::error!(error = %s, "Record store failure");
                ApiError::database_error("Database operation failed")
            }
            Mal2Error::Vocabulary(v) => {
                tracing::error!(error = %v, "Vocabulary failure");
                ApiError::internal_error("Feature vocabulary is unusable")
            }
            Mal2Error::Config(c) => {
                tracing::error!(error = %c, "Configuration failure");
                ApiError::internal_error("Service is misconfigured")
            }
        }
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use mal2_core::{hash_bytes, ClassifierError, IoFailure};
    use std::io;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::ValidationFailed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::UnsupportedMediaType.status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(ErrorCode::PayloadTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ErrorCode::AnalysisInProgress.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::ClassificationUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::StorageError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::DatabaseError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(ErrorCode::AnalysisInProgress.is_retryable());
        assert!(!ErrorCode::ValidationFailed.is_retryable());
    }

    #[test]
    fn test_domain_error_mapping() {
        let err: ApiError = Mal2Error::from(ValidationError::UnsupportedContentType {
            content_type: "text/plain".into(),
            accepted: vec!["application/vnd.android.package-archive".into()],
        })
        .into();
        assert_eq!(err.code, ErrorCode::UnsupportedMediaType);
        assert!(err.message.contains("text/plain"));

        let err: ApiError = Mal2Error::from(CacheError::AnalysisInProgress {
            sha256: "abc".into(),
            waited_ms: 60_000,
        })
        .into();
        assert_eq!(err.code, ErrorCode::AnalysisInProgress);
        assert_eq!(err.retry_after(), Some(RETRY_AFTER_SECS));

        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let err: ApiError = Mal2Error::from(IoFailure::new("store", "/tmp/x", &io_err)).into();
        assert_eq!(err.code, ErrorCode::StorageError);

        let err: ApiError = Mal2Error::from(StorageError::PoolExhausted {
            reason: "timed out".into(),
        })
        .into();
        assert_eq!(err.code, ErrorCode::ConnectionPoolExhausted);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.retry_after(), Some(RETRY_AFTER_SECS));

        let err: ApiError = Mal2Error::from(StorageError::Pool {
            reason: "closed".into(),
        })
        .into();
        assert_eq!(err.code, ErrorCode::ServiceUnavailable);

        let err: ApiError = Mal2Error::from(ClassifierError::Exhausted {
            classifier: "m".into(),
            attempts: 3,
            last_error: "down".into(),
        })
        .into();
        assert_eq!(err.code, ErrorCode::ClassificationUnavailable);
    }

    #[test]
    fn test_classification_unavailable_carries_digests() {
        let digests = hash_bytes(b"apk");
        let err = ApiError::classification_unavailable(&digests, "model server down");
        let details = err.details.clone().unwrap_or_default();
        assert_eq!(details["sha256"], digests.sha256);
        assert_eq!(details["md5"], digests.md5);
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiError::analysis_in_progress("abc", 10).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("5")
        );

        let response = ApiError::validation_failed("bad").into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::payload_too_large(1024);
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("PAYLOAD_TOO_LARGE"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }
}
