//! MAL2 API Server Entry Point
//!
//! Bootstraps configuration, opens the record store, loads the vocabulary
//! and starts the Axum HTTP server.

use axum::Router;
use mal2_api::telemetry::{init_tracer, TelemetryConfig};
use mal2_api::{
    build_analysis_service, build_record_store, create_api_router, ApiConfig, ApiError,
    ApiResult, AppState, ServiceConfig,
};
use mal2_core::Mal2Error;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::from_env().map_err(Mal2Error::from)?;
    init_tracer(&telemetry_config)?;

    let service_config = ServiceConfig::from_env().map_err(Mal2Error::from)?;
    let api_config = ApiConfig::from_env().map_err(Mal2Error::from)?;

    let record_store = build_record_store(&service_config).await?;
    let analysis = build_analysis_service(&service_config, record_store).await?;
    tracing::info!(
        upload_path = %service_config.upload_path.display(),
        max_upload_bytes = service_config.max_upload_bytes,
        store_backend = ?service_config.store_backend,
        "Analysis pipeline ready"
    );

    let state = AppState::new(analysis, service_config);
    let app: Router = create_api_router(state, &api_config);

    let addr = api_config.bind_addr();
    tracing::info!(%addr, "Starting MAL2 API server");

    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
