//! MAL2 API - HTTP Surface of the APK Analysis Service
//!
//! Accepts uploaded Android packages, hashes them, reuses the stored result
//! for content already analyzed and otherwise runs the classification
//! pipeline exactly once per digest, even under concurrent uploads.
//!
//! Records persist in PostgreSQL through [`PgRecordStore`], or in memory
//! for tests and throwaway deployments.

pub mod config;
pub mod db;
pub mod error;
pub mod macros;
pub mod openapi;
pub mod routes;
pub mod services;
pub mod startup;
pub mod state;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use config::{ApiConfig, ConfigSource, ProcessEnv, ServiceConfig, StoreBackend};
pub use db::{DbConfig, PgRecordStore};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use openapi::ApiDoc;
pub use routes::create_api_router;
pub use services::{AnalysisService, PipelineStage, SpooledUpload};
pub use startup::{build_analysis_service, build_classifiers, build_record_store, load_vocabulary};
pub use state::AppState;
pub use types::{malware_breakdown, UploadResponse, PROBABILITIES_KEY};
