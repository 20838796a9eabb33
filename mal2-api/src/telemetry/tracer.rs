//! Tracing Subscriber Initialization
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` plus a JSON or
//! human-readable formatter.

use std::str::FromStr;

use mal2_core::ConfigError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "mal2_api=debug,tower_http=debug,info";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (production, staging, development)
    pub environment: String,
    pub log_format: LogFormat,
    /// Enable metrics collection
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "mal2-api".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Environment variables:
    /// - `MAL2_SERVICE_NAME` (default: mal2-api)
    /// - `MAL2_ENVIRONMENT` (default: development)
    /// - `MAL2_LOG_FORMAT`: `json` or `pretty` (default: json)
    /// - `MAL2_METRICS_ENABLED` (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let defaults = Self::default();

        let log_format = match env("MAL2_LOG_FORMAT") {
            None => defaults.log_format,
            Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "MAL2_LOG_FORMAT".to_string(),
                value: raw.clone(),
                reason,
            })?,
        };

        Ok(Self {
            service_name: env("MAL2_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: defaults.service_version,
            environment: env("MAL2_ENVIRONMENT").unwrap_or(defaults.environment),
            log_format,
            metrics_enabled: env("MAL2_METRICS_ENABLED")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(true),
        })
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracer(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init(),
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        service_version = %config.service_version,
        environment = %config.environment,
        log_format = ?config.log_format,
        "Telemetry initialized"
    );

    Ok(())
}
