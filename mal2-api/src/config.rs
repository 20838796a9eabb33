//! API Configuration Module
//!
//! Process-wide settings for the upload pipeline and the HTTP listener.
//! Configuration is loaded from environment variables with defaults for
//! development. Values that are present but unparsable fail startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mal2_core::{BackoffStrategy, ConfigError, RetryPolicy};

/// Default accepted upload content types.
pub const DEFAULT_ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "application/vnd.android.package-archive",
    "application/octet-stream",
];

/// Upper bound on classifier backoff.
const MAX_BACKOFF_MS: u64 = 10_000;

// ============================================================================
// ENV HELPERS
// ============================================================================

/// Source of configuration values, usually the process environment.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from `std::env`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl ConfigSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl<F> ConfigSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

fn parse_or<T, S>(source: &S, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    S: ConfigSource + ?Sized,
{
    match source.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            field: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn bool_or<S: ConfigSource + ?Sized>(source: &S, key: &str, default: bool) -> Result<bool, ConfigError> {
    match source.get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

fn list_or<S: ConfigSource + ?Sized>(source: &S, key: &str, default: &[&str]) -> Vec<String> {
    match source.get(key) {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(
    key: &str,
    value: T,
) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            field: key.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    }
}

// ============================================================================
// SERVICE CONFIGURATION
// ============================================================================

/// Which [`mal2_storage::RecordStore`] backs the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "in-memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Settings for the analysis pipeline.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory uploaded artifacts are stored in.
    pub upload_path: PathBuf,
    pub max_upload_bytes: u64,
    /// Row width W of the feature matrix.
    pub max_feature_count: usize,
    pub vocabulary_path: PathBuf,
    /// Vocabulary version the classifier was trained against.
    /// Defaults to the artifact's own version when unset.
    pub vocabulary_version: Option<String>,
    /// Predict URL of the malware model server. `None` stubs the category.
    pub classifier_url: Option<String>,
    pub classifier_timeout: Duration,
    pub classifier_max_attempts: u32,
    pub classifier_backoff_ms: u64,
    pub join_timeout: Duration,
    /// Lowercase MIME types accepted for upload.
    pub accepted_content_types: Vec<String>,
    pub enforce_content_type: bool,
    pub store_backend: StoreBackend,
    pub stored_suffix: String,
    pub date_prefix: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_path: PathBuf::from("/tmp"),
            max_upload_bytes: 256 * 1024 * 1024,
            max_feature_count: 500,
            vocabulary_path: PathBuf::from("files/word.dict.json"),
            vocabulary_version: None,
            classifier_url: None,
            classifier_timeout: Duration::from_secs(30),
            classifier_max_attempts: 3,
            classifier_backoff_ms: 100,
            join_timeout: Duration::from_secs(60),
            accepted_content_types: DEFAULT_ACCEPTED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            enforce_content_type: true,
            store_backend: StoreBackend::Postgres,
            stored_suffix: ".apk".to_string(),
            date_prefix: true,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment.
    ///
    /// Environment variables:
    /// - `MAL2_UPLOAD_PATH`: Directory for stored artifacts (default: /tmp)
    /// - `MAL2_MAX_UPLOAD_BYTES`: Upload size limit (default: 256 MiB)
    /// - `MAL2_MAX_FEATURE_COUNT`: Feature row width (default: 500)
    /// - `MAL2_VOCABULARY_PATH`: Vocabulary artifact (default: files/word.dict.json)
    /// - `MAL2_VOCABULARY_VERSION`: Version the classifier expects
    /// - `MAL2_CLASSIFIER_URL`: Model server predict URL (unset = stub)
    /// - `MAL2_CLASSIFIER_TIMEOUT_SECS`: Per-attempt timeout (default: 30)
    /// - `MAL2_CLASSIFIER_MAX_ATTEMPTS`: Attempts per category (default: 3)
    /// - `MAL2_CLASSIFIER_BACKOFF_MS`: First retry delay, doubled per retry (default: 100)
    /// - `MAL2_JOIN_TIMEOUT_SECS`: Wait for a concurrent analysis (default: 60)
    /// - `MAL2_ACCEPTED_CONTENT_TYPES`: Comma-separated MIME types
    /// - `MAL2_ENFORCE_CONTENT_TYPE`: Reject other types (default: true)
    /// - `MAL2_STORE_BACKEND`: `postgres` or `memory` (default: postgres)
    /// - `MAL2_STORED_SUFFIX`: Stored file suffix (default: .apk)
    /// - `MAL2_DATE_PREFIX`: Prefix stored files with the upload date (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source<S: ConfigSource + ?Sized>(source: &S) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_upload_bytes = positive(
            "MAL2_MAX_UPLOAD_BYTES",
            parse_or(source, "MAL2_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
        )?;
        let max_feature_count = positive(
            "MAL2_MAX_FEATURE_COUNT",
            parse_or(source, "MAL2_MAX_FEATURE_COUNT", defaults.max_feature_count)?,
        )?;
        let classifier_timeout_secs = positive(
            "MAL2_CLASSIFIER_TIMEOUT_SECS",
            parse_or(source, "MAL2_CLASSIFIER_TIMEOUT_SECS", 30u64)?,
        )?;
        let classifier_max_attempts = positive(
            "MAL2_CLASSIFIER_MAX_ATTEMPTS",
            parse_or(source, "MAL2_CLASSIFIER_MAX_ATTEMPTS", defaults.classifier_max_attempts)?,
        )?;
        let join_timeout_secs = positive(
            "MAL2_JOIN_TIMEOUT_SECS",
            parse_or(source, "MAL2_JOIN_TIMEOUT_SECS", 60u64)?,
        )?;

        let accepted_content_types = list_or(
            source,
            "MAL2_ACCEPTED_CONTENT_TYPES",
            DEFAULT_ACCEPTED_CONTENT_TYPES,
        );
        let enforce_content_type = bool_or(source, "MAL2_ENFORCE_CONTENT_TYPE", true)?;
        if enforce_content_type && accepted_content_types.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "MAL2_ACCEPTED_CONTENT_TYPES".to_string(),
                value: String::new(),
                reason: "at least one type is required while enforcement is on".to_string(),
            });
        }

        let vocabulary_version = source.get("MAL2_VOCABULARY_VERSION");
        let classifier_url = source.get("MAL2_CLASSIFIER_URL");
        if classifier_url.is_some() && vocabulary_version.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "MAL2_VOCABULARY_VERSION".to_string(),
            });
        }

        Ok(Self {
            upload_path: source
                .get("MAL2_UPLOAD_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_path),
            max_upload_bytes,
            max_feature_count,
            vocabulary_path: source
                .get("MAL2_VOCABULARY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.vocabulary_path),
            vocabulary_version,
            classifier_url,
            classifier_timeout: Duration::from_secs(classifier_timeout_secs),
            classifier_max_attempts,
            classifier_backoff_ms: parse_or(
                source,
                "MAL2_CLASSIFIER_BACKOFF_MS",
                defaults.classifier_backoff_ms,
            )?,
            join_timeout: Duration::from_secs(join_timeout_secs),
            accepted_content_types,
            enforce_content_type,
            store_backend: match source.get("MAL2_STORE_BACKEND") {
                None => defaults.store_backend,
                Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
                    field: "MAL2_STORE_BACKEND".to_string(),
                    value: raw.clone(),
                    reason,
                })?,
            },
            stored_suffix: source
                .get("MAL2_STORED_SUFFIX")
                .unwrap_or(defaults.stored_suffix),
            date_prefix: bool_or(source, "MAL2_DATE_PREFIX", defaults.date_prefix)?,
        })
    }

    /// Retry policy for classifier calls: exponential ×2, capped at 10 s.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.classifier_max_attempts,
            backoff: if self.classifier_backoff_ms == 0 {
                BackoffStrategy::None
            } else {
                BackoffStrategy::Exponential {
                    base_ms: self.classifier_backoff_ms,
                    multiplier: 2.0,
                    max_ms: MAX_BACKOFF_MS,
                }
            },
            timeout_per_attempt_ms: u64::try_from(self.classifier_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Whether `content_type` (parameters ignored) may be uploaded.
    pub fn accepts_content_type(&self, content_type: Option<&str>) -> bool {
        if !self.enforce_content_type {
            return true;
        }
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_lowercase());
        match essence {
            Some(ct) => self.accepted_content_types.iter().any(|a| *a == ct),
            None => false,
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// HTTP listener and CORS settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (default 0.0.0.0).
    pub bind: String,
    pub port: u16,

    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins.
    pub cors_origins: Vec<String>,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: Vec::new(), // Empty = allow all
            cors_max_age_secs: 86400, // 24 hours
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `MAL2_API_BIND`: Listen address (default: 0.0.0.0)
    /// - `PORT` or `MAL2_API_PORT`: Listen port (default: 8000)
    /// - `MAL2_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `MAL2_CORS_MAX_AGE_SECS`: Preflight cache duration (default: 86400)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source<S: ConfigSource + ?Sized>(source: &S) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port_key = if source.get("PORT").is_some() {
            "PORT"
        } else {
            "MAL2_API_PORT"
        };

        Ok(Self {
            bind: source.get("MAL2_API_BIND").unwrap_or(defaults.bind),
            port: parse_or(source, port_key, defaults.port)?,
            cors_origins: list_or(source, "MAL2_CORS_ORIGINS", &[]),
            cors_max_age_secs: parse_or(source, "MAL2_CORS_MAX_AGE_SECS", defaults.cors_max_age_secs)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.cors_origins.is_empty()
            || self
                .cors_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_service_defaults() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_source(&source(&[]))?;
        assert_eq!(config.upload_path, PathBuf::from("/tmp"));
        assert_eq!(config.max_upload_bytes, 256 * 1024 * 1024);
        assert_eq!(config.max_feature_count, 500);
        assert_eq!(config.classifier_url, None);
        assert_eq!(config.join_timeout, Duration::from_secs(60));
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.stored_suffix, ".apk");
        assert!(config.date_prefix);

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.timeout_per_attempt_ms, 30_000);
        assert_eq!(retry.backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.backoff.delay_for_attempt(20), Duration::from_millis(MAX_BACKOFF_MS));
        Ok(())
    }

    #[test]
    fn test_service_overrides() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_source(&source(&[
            ("MAL2_UPLOAD_PATH", "/srv/uploads"),
            ("MAL2_MAX_FEATURE_COUNT", "64"),
            ("MAL2_CLASSIFIER_URL", "http://model:8501/v1/models/mal2:predict"),
            ("MAL2_VOCABULARY_VERSION", "2024-01"),
            ("MAL2_STORE_BACKEND", "memory"),
            ("MAL2_ACCEPTED_CONTENT_TYPES", "Application/Zip, application/x-apk"),
            ("MAL2_DATE_PREFIX", "false"),
        ]))?;
        assert_eq!(config.upload_path, PathBuf::from("/srv/uploads"));
        assert_eq!(config.max_feature_count, 64);
        assert!(config.classifier_url.is_some());
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.accepted_content_types, vec!["application/zip", "application/x-apk"]);
        assert!(!config.date_prefix);
        Ok(())
    }

    #[test]
    fn test_classifier_url_requires_vocabulary_version() {
        let result = ServiceConfig::from_source(&source(&[(
            "MAL2_CLASSIFIER_URL",
            "http://model:8501/v1/models/mal2:predict",
        )]));
        assert!(matches!(
            result,
            Err(ConfigError::MissingRequired { ref field }) if field == "MAL2_VOCABULARY_VERSION"
        ));

        let stubs_only = ServiceConfig::from_source(&source(&[]));
        assert!(stubs_only.is_ok());
    }

    #[test]
    fn test_invalid_values_fail() {
        for (key, value) in [
            ("MAL2_MAX_FEATURE_COUNT", "wide"),
            ("MAL2_MAX_FEATURE_COUNT", "0"),
            ("MAL2_CLASSIFIER_MAX_ATTEMPTS", "0"),
            ("MAL2_STORE_BACKEND", "sqlite"),
            ("MAL2_ENFORCE_CONTENT_TYPE", "maybe"),
        ] {
            let result = ServiceConfig::from_source(&source(&[(key, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { ref field, .. }) if field == key),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_accepts_content_type() {
        let config = ServiceConfig::default();
        assert!(config.accepts_content_type(Some("application/vnd.android.package-archive")));
        assert!(config.accepts_content_type(Some("Application/Octet-Stream; charset=binary")));
        assert!(!config.accepts_content_type(Some("text/plain")));
        assert!(!config.accepts_content_type(None));

        let relaxed = ServiceConfig {
            enforce_content_type: false,
            ..ServiceConfig::default()
        };
        assert!(relaxed.accepts_content_type(Some("text/plain")));
        assert!(relaxed.accepts_content_type(None));
    }

    #[test]
    fn test_api_port_precedence() -> Result<(), ConfigError> {
        assert_eq!(ApiConfig::from_source(&source(&[]))?.bind_addr(), "0.0.0.0:8000");
        let config = ApiConfig::from_source(&source(&[("PORT", "9000"), ("MAL2_API_PORT", "9100")]))?;
        assert_eq!(config.port, 9000);
        let config = ApiConfig::from_source(&source(&[("MAL2_API_PORT", "9100")]))?;
        assert_eq!(config.port, 9100);
        Ok(())
    }

    #[test]
    fn test_origin_allowed() {
        let mut config = ApiConfig::default();
        assert!(config.is_origin_allowed("https://anything.example"));

        config.cors_origins = vec!["https://mal2.example".to_string()];
        assert!(config.is_origin_allowed("https://mal2.example"));
        assert!(!config.is_origin_allowed("https://evil.example"));
    }
}
