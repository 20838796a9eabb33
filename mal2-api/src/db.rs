//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling with deadpool-postgres, and the
//! [`PgRecordStore`] implementation of the artifact record table.
//!
//! Every statement touches a single row keyed by `sha256`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use mal2_core::{
    ArtifactRecord, Category, CategoryScore, Classification, ConfigError, DigestSet, Mal2Result,
    StorageError,
};
use mal2_storage::RecordStore;
use serde_json::Value as JsonValue;
use tokio_postgres::{NoTls, Row};

use crate::error::{ApiError, ApiResult};
use crate::telemetry::metrics;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "mal2".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match env(key) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                    field: key.to_string(),
                    value: raw,
                    reason: "expected a non-negative integer".to_string(),
                }),
            }
        };

        let defaults = Self::default();
        let port = number("MAL2_DB_PORT", u64::from(defaults.port))?;
        Ok(Self {
            host: env("MAL2_DB_HOST").unwrap_or(defaults.host),
            port: u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
                field: "MAL2_DB_PORT".to_string(),
                value: port.to_string(),
                reason: "port out of range".to_string(),
            })?,
            dbname: env("MAL2_DB_NAME").unwrap_or(defaults.dbname),
            user: env("MAL2_DB_USER").unwrap_or(defaults.user),
            password: env("MAL2_DB_PASSWORD").unwrap_or_default(),
            max_size: usize::try_from(number("MAL2_DB_POOL_SIZE", 16)?).unwrap_or(16),
            timeout: Duration::from_secs(number("MAL2_DB_TIMEOUT", 30)?),
        })
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.timeout);

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.max_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

const MIGRATION: &str = "
CREATE TABLE IF NOT EXISTS artifact_records (
    sha256          TEXT PRIMARY KEY,
    md5             TEXT NOT NULL,
    sha1            TEXT NOT NULL,
    filename        TEXT NOT NULL,
    stored_path     TEXT NOT NULL,
    classification  JSONB NOT NULL DEFAULT '{}'::jsonb,
    first_seen      TIMESTAMPTZ NOT NULL,
    analyzed_at     TIMESTAMPTZ NULL
)";

const COLUMNS: &str =
    "sha256, md5, sha1, filename, stored_path, classification, first_seen, analyzed_at";

// ============================================================================
// POSTGRES RECORD STORE
// ============================================================================

/// [`RecordStore`] backed by the `artifact_records` table.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool,
}

impl PgRecordStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a store from configuration.
    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create the table if it does not exist. Safe to run on every start.
    pub async fn migrate(&self) -> Mal2Result<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(MIGRATION)
            .await
            .map_err(|e| db_error("migrate", e))?;
        tracing::info!("artifact_records schema ready");
        Ok(())
    }

    async fn get_conn(&self) -> Mal2Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| pool_error(&e))
    }

    async fn select(&self, sha256: &str, analyzed_only: bool) -> Mal2Result<Option<ArtifactRecord>> {
        let conn = self.get_conn().await?;
        let sql = if analyzed_only {
            format!(
                "SELECT {} FROM artifact_records WHERE sha256 = $1 AND analyzed_at IS NOT NULL",
                COLUMNS
            )
        } else {
            format!("SELECT {} FROM artifact_records WHERE sha256 = $1", COLUMNS)
        };
        let row = conn
            .query_opt(sql.as_str(), &[&sha256])
            .await
            .map_err(|e| db_error("select", e))?;
        row.as_ref().map(row_to_record).transpose()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_analyzed(&self, sha256: &str) -> Mal2Result<Option<ArtifactRecord>> {
        let start = Instant::now();
        let result = self.select(sha256, true).await;
        record_db_metric("get_analyzed", result.is_ok(), start);
        result
    }

    async fn record_seen(&self, record: &ArtifactRecord) -> Mal2Result<ArtifactRecord> {
        let start = Instant::now();
        let result = async {
            let conn = self.get_conn().await?;
            conn.execute(
                "INSERT INTO artifact_records \
                 (sha256, md5, sha1, filename, stored_path, classification, first_seen, analyzed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, NULL) \
                 ON CONFLICT (sha256) DO NOTHING",
                &[
                    &record.digests.sha256,
                    &record.digests.md5,
                    &record.digests.sha1,
                    &record.filename,
                    &record.stored_path,
                    &classification_to_json(&record.classification),
                    &record.first_seen,
                ],
            )
            .await
            .map_err(|e| db_error("record_seen", e))?;

            self.select(record.sha256(), false)
                .await?
                .ok_or_else(|| missing_row(record.sha256(), "row vanished after insert"))
        }
        .await;
        record_db_metric("record_seen", result.is_ok(), start);
        result
    }

    async fn record_analysis(&self, record: &ArtifactRecord) -> Mal2Result<ArtifactRecord> {
        let start = Instant::now();
        let result = async {
            let analyzed_at = record.analyzed_at.ok_or_else(|| StorageError::Malformed {
                sha256: record.sha256().to_string(),
                reason: "record_analysis called without analyzed_at".to_string(),
            })?;
            let conn = self.get_conn().await?;

            // Upsert so a store that never saw record_seen still persists the result.
            let updated = conn
                .query_opt(
                    format!(
                        "INSERT INTO artifact_records ({cols}) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                         ON CONFLICT (sha256) DO UPDATE SET \
                             stored_path = EXCLUDED.stored_path, \
                             classification = EXCLUDED.classification, \
                             analyzed_at = EXCLUDED.analyzed_at \
                         WHERE artifact_records.analyzed_at IS NULL \
                         RETURNING {cols}",
                        cols = COLUMNS
                    )
                    .as_str(),
                    &[
                        &record.digests.sha256,
                        &record.digests.md5,
                        &record.digests.sha1,
                        &record.filename,
                        &record.stored_path,
                        &classification_to_json(&record.classification),
                        &record.first_seen,
                        &analyzed_at,
                    ],
                )
                .await
                .map_err(|e| db_error("record_analysis", e))?;

            match updated {
                Some(row) => row_to_record(&row),
                // Someone else analyzed it first; theirs stands.
                None => self
                    .select(record.sha256(), true)
                    .await?
                    .ok_or_else(|| missing_row(record.sha256(), "analysis lost but no row found")),
            }
        }
        .await;
        record_db_metric("record_analysis", result.is_ok(), start);
        result
    }

    async fn ping(&self) -> Mal2Result<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1")
            .await
            .map_err(|e| db_error("ping", e))?;
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn db_error(operation: &str, err: tokio_postgres::Error) -> mal2_core::Mal2Error {
    tracing::error!(operation, error = ?err, "Database error");
    StorageError::Database {
        operation: operation.to_string(),
        reason: err.to_string(),
    }
    .into()
}

fn pool_error(err: &deadpool_postgres::PoolError) -> mal2_core::Mal2Error {
    tracing::error!(error = ?err, "Connection pool error");
    let reason = err.to_string();
    match err {
        deadpool_postgres::PoolError::Timeout(_) => StorageError::PoolExhausted { reason },
        _ => StorageError::Pool { reason },
    }
    .into()
}

fn missing_row(sha256: &str, reason: &str) -> mal2_core::Mal2Error {
    StorageError::Malformed {
        sha256: sha256.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn record_db_metric(operation: &str, success: bool, start: Instant) {
    if let Some(m) = metrics() {
        m.record_db_operation(operation, success, start.elapsed().as_secs_f64());
    }
}

fn classification_to_json(classification: &Classification) -> JsonValue {
    serde_json::to_value(classification.to_wire()).unwrap_or(JsonValue::Object(Default::default()))
}

/// Parse the `classification` column. Unknown category names are rejected.
fn classification_from_json(sha256: &str, value: &JsonValue) -> Mal2Result<Classification> {
    let malformed = |reason: String| missing_row(sha256, &reason);
    let object = value
        .as_object()
        .ok_or_else(|| malformed("classification is not an object".to_string()))?;

    let mut classification = Classification::new();
    for (name, raw) in object {
        let category = Category::ALL
            .into_iter()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| malformed(format!("unknown category '{}'", name)))?;
        let score = raw
            .as_f64()
            .and_then(CategoryScore::from_wire)
            .ok_or_else(|| malformed(format!("invalid score for '{}'", name)))?;
        classification.set(category, score);
    }
    Ok(classification)
}

fn row_to_record(row: &Row) -> Mal2Result<ArtifactRecord> {
    let sha256: String = row.get("sha256");
    let classification: JsonValue = row.get("classification");
    let first_seen: DateTime<Utc> = row.get("first_seen");
    let analyzed_at: Option<DateTime<Utc>> = row.get("analyzed_at");

    Ok(ArtifactRecord {
        classification: classification_from_json(&sha256, &classification)?,
        digests: DigestSet {
            md5: row.get("md5"),
            sha1: row.get("sha1"),
            sha256,
        },
        filename: row.get("filename"),
        stored_path: row.get("stored_path"),
        first_seen,
        analyzed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_db_config_default() {
        let config = DbConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.max_size, 16);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_classification_json_round_trip() -> Mal2Result<()> {
        let classification = Classification::new()
            .with(Category::Malware, CategoryScore::Probability(0.25))
            .with(Category::Trackers, CategoryScore::NotComputed)
            .with(Category::Adware, CategoryScore::NotComputed);
        let value = classification_to_json(&classification);
        assert_eq!(value["contains_trackers"], json!(-1.0));

        let back = classification_from_json("abc", &value)?;
        assert_eq!(back, classification);
        Ok(())
    }

    #[test]
    fn test_pool_timeout_maps_to_exhausted() {
        let err = pool_error(&deadpool_postgres::PoolError::Timeout(
            deadpool_postgres::TimeoutType::Wait,
        ));
        assert!(matches!(
            err,
            mal2_core::Mal2Error::Storage(StorageError::PoolExhausted { .. })
        ));

        let err = pool_error(&deadpool_postgres::PoolError::Closed);
        assert!(matches!(err, mal2_core::Mal2Error::Storage(StorageError::Pool { .. })));
    }

    #[test]
    fn test_classification_json_rejects_garbage() {
        assert!(classification_from_json("abc", &json!([1, 2])).is_err());
        assert!(classification_from_json("abc", &json!({"ransomware": 0.5})).is_err());
        assert!(classification_from_json("abc", &json!({"contains_malware": 3.0})).is_err());
        assert!(classification_from_json("abc", &json!({"contains_malware": "high"})).is_err());
    }
}
