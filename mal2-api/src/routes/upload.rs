//! Binary Upload Route
//!
//! `POST /api/v1/upload/binary/` takes a multipart form with one `file`
//! field. The field is validated and streamed into a temporary file under
//! the upload directory, then handed to the [`AnalysisService`].

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{multipart::{Field, MultipartRejection}, Multipart, State},
    routing::post,
    Json, Router,
};
use mal2_core::{IoFailure, Mal2Error, ValidationError};
use tokio::io::AsyncWriteExt;

use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::services::{AnalysisService, PipelineStage, SpooledUpload};
use crate::state::AppState;
use crate::telemetry::{metrics, UploadOutcome};
use crate::types::UploadResponse;

/// Name of the multipart field carrying the artifact.
pub const FILE_FIELD: &str = "file";

/// Used when the client sends no file name.
const FALLBACK_FILE_NAME: &str = "upload";

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /api/v1/upload/binary/ - Analyze an Android APK
#[utoipa::path(
    post,
    path = "/api/v1/upload/binary/",
    tag = "Upload",
    request_body(content_type = "multipart/form-data", description = "Form with a `file` field holding the APK"),
    responses(
        (status = 200, description = "Artifact classified, or result reused", body = UploadResponse),
        (status = 400, description = "Missing or malformed upload", body = ApiError),
        (status = 413, description = "Upload too large", body = ApiError),
        (status = 415, description = "Not an accepted artifact type", body = ApiError),
        (status = 500, description = "Storage failure", body = ApiError),
        (status = 503, description = "Analysis in progress or classification unavailable; retry later", body = ApiError),
    ),
)]
pub async fn upload_binary(
    State(service): State<Arc<AnalysisService>>,
    State(config): State<Arc<ServiceConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let received_at = Instant::now();
    tracing::debug!(stage = PipelineStage::Received.as_str(), "Upload received");

    let upload = match receive_upload(multipart, &config).await {
        Ok(upload) => upload,
        Err(e) => {
            if let Some(m) = metrics() {
                m.record_upload(UploadOutcome::Rejected);
            }
            tracing::info!(code = %e.code, message = %e.message, "Upload rejected");
            return Err(e);
        }
    };

    let response = service.analyze(&upload, received_at).await?;
    Ok(Json(response))
}

/// Find the `file` field, validate it and spool it to disk.
async fn receive_upload(
    multipart: Result<Multipart, MultipartRejection>,
    config: &ServiceConfig,
) -> ApiResult<SpooledUpload> {
    let mut multipart = multipart
        .map_err(|e| ApiError::validation_failed(format!("Expected a multipart form: {}", e)))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation_failed(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        if !config.accepts_content_type(content_type.as_deref()) {
            return Err(Mal2Error::from(ValidationError::UnsupportedContentType {
                content_type: content_type.unwrap_or_else(|| "unknown".to_string()),
                accepted: config.accepted_content_types.clone(),
            })
            .into());
        }

        let file_name = field
            .file_name()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(FALLBACK_FILE_NAME)
            .to_string();
        return spool_field(field, file_name, &config.upload_path, config.max_upload_bytes).await;
    }

    Err(ApiError::missing_field(FILE_FIELD))
}

/// Stream a field into a temporary file, enforcing `limit_bytes`.
async fn spool_field(
    mut field: Field<'_>,
    file_name: String,
    dir: &Path,
    limit_bytes: u64,
) -> ApiResult<SpooledUpload> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Mal2Error::from(IoFailure::new("create upload directory", dir, &e)))?;
    let temp = tempfile::Builder::new()
        .prefix(".mal2-upload-")
        .tempfile_in(dir)
        .map_err(|e| Mal2Error::from(IoFailure::new("create spool file", dir, &e)))?;
    let spool_error = |op: &str, e: std::io::Error| Mal2Error::from(IoFailure::new(op, temp.path(), &e));

    let std_file = temp
        .as_file()
        .try_clone()
        .map_err(|e| spool_error("open spool file", e))?;
    let mut out = tokio::fs::File::from_std(std_file);

    let mut size_bytes: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::validation_failed(format!("Upload interrupted: {}", e)))?
    {
        size_bytes = size_bytes.saturating_add(chunk.len() as u64);
        if size_bytes > limit_bytes {
            return Err(Mal2Error::from(ValidationError::PayloadTooLarge { limit_bytes }).into());
        }
        out.write_all(&chunk)
            .await
            .map_err(|e| spool_error("write spool file", e))?;
    }
    out.flush().await.map_err(|e| spool_error("flush spool file", e))?;

    Ok(SpooledUpload::new(file_name, temp, size_bytes))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create the upload router, mounted under `/api/v1`.
pub fn create_router() -> Router<AppState> {
    Router::new().route("/upload/binary/", post(upload_binary))
}
