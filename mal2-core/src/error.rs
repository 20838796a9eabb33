//! Error types for MAL2 operations

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upload validation errors. Raised before any digest is computed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Unsupported content type '{content_type}', accepted: {accepted:?}")]
    UnsupportedContentType {
        content_type: String,
        accepted: Vec<String>,
    },

    #[error("Upload exceeds the limit of {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: u64 },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Filesystem and stream failures during hashing or storing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("I/O failure during {operation} on {path:?} ({kind:?}): {message}")]
pub struct IoFailure {
    pub operation: String,
    pub path: PathBuf,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl IoFailure {
    pub fn new(operation: impl Into<String>, path: impl AsRef<Path>, err: &io::Error) -> Self {
        Self {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors from the external classifier collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifierError {
    #[error("Request to {classifier} failed: {reason}")]
    Transport { classifier: String, reason: String },

    #[error("Classifier {classifier} returned status {status}: {message}")]
    Status {
        classifier: String,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {classifier}: {reason}")]
    InvalidResponse { classifier: String, reason: String },

    #[error("Classifier {classifier} returned probability {value} outside [0, 1]")]
    ProbabilityOutOfRange { classifier: String, value: f64 },

    #[error("Classifier {classifier} timed out after {after_ms}ms")]
    Timeout { classifier: String, after_ms: u64 },

    #[error("Feature extraction failed for {path:?}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("Classifier {classifier} unavailable after {attempts} attempts: {last_error}")]
    Exhausted {
        classifier: String,
        attempts: u32,
        last_error: String,
    },
}

impl ClassifierError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassifierError::Transport { .. } | ClassifierError::Timeout { .. } => true,
            ClassifierError::Status { status, .. } => *status == 429 || *status >= 500,
            ClassifierError::InvalidResponse { .. }
            | ClassifierError::ProbabilityOutOfRange { .. }
            | ClassifierError::Extraction { .. }
            | ClassifierError::Exhausted { .. } => false,
        }
    }
}

/// Result cache and claim coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Analysis of {sha256} still in progress after waiting {waited_ms}ms")]
    AnalysisInProgress { sha256: String, waited_ms: u64 },

    #[error("Cache inconsistency for {sha256}: {reason}")]
    Inconsistency { sha256: String, reason: String },
}

/// Vocabulary artifact loading and encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VocabularyError {
    #[error("Unsupported vocabulary schema version {found}, supported: {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Vocabulary version mismatch: classifier expects '{expected}', artifact is '{found}'")]
    VersionMismatch { expected: String, found: String },

    #[error("Feature width mismatch: expected {expected}, artifact has {found}")]
    WidthMismatch { expected: usize, found: usize },

    #[error("Feature width must be at least 1")]
    ZeroWidth,

    #[error("Token '{token}' has id {id} outside the issued range 0..{next_id}")]
    IdOutOfRange { token: String, id: u32, next_id: u32 },

    #[error("Id {id} is assigned to more than one token")]
    DuplicateId { id: u32 },

    #[error("Vocabulary id space exhausted")]
    Exhausted,

    #[error("Failed to parse vocabulary artifact: {reason}")]
    Parse { reason: String },
}

/// Persistent record store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Database operation {operation} failed: {reason}")]
    Database { operation: String, reason: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Timed out waiting for a pooled connection: {reason}")]
    PoolExhausted { reason: String },

    #[error("Record for {sha256} is malformed: {reason}")]
    Malformed { sha256: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all MAL2 errors.
#[derive(Debug, Clone, Error)]
pub enum Mal2Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Io(#[from] IoFailure),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Vocabulary error: {0}")]
    Vocabulary(#[from] VocabularyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for MAL2 operations.
pub type Mal2Result<T> = Result<T, Mal2Error>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failure_keeps_kind_and_path() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let failure = IoFailure::new("store", "/tmp/x.apk", &err);
        assert_eq!(failure.kind, io::ErrorKind::PermissionDenied);
        let msg = failure.to_string();
        assert!(msg.contains("store"));
        assert!(msg.contains("/tmp/x.apk"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_classifier_error_retryable() {
        let transport = ClassifierError::Transport {
            classifier: "malware".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(transport.is_retryable());

        let busy = ClassifierError::Status {
            classifier: "malware".to_string(),
            status: 503,
            message: "overloaded".to_string(),
        };
        assert!(busy.is_retryable());

        let bad_request = ClassifierError::Status {
            classifier: "malware".to_string(),
            status: 400,
            message: "bad shape".to_string(),
        };
        assert!(!bad_request.is_retryable());

        let out_of_range = ClassifierError::ProbabilityOutOfRange {
            classifier: "malware".to_string(),
            value: 1.5,
        };
        assert!(!out_of_range.is_retryable());
    }

    #[test]
    fn test_vocabulary_error_display_version_mismatch() {
        let err = VocabularyError::VersionMismatch {
            expected: "2024-01".to_string(),
            found: "2023-07".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("2024-01"));
        assert!(msg.contains("2023-07"));
    }

    #[test]
    fn test_mal2_error_from_variants() {
        let validation = Mal2Error::from(ValidationError::RequiredFieldMissing {
            field: "file".to_string(),
        });
        assert!(matches!(validation, Mal2Error::Validation(_)));

        let cache = Mal2Error::from(CacheError::AnalysisInProgress {
            sha256: "ab".to_string(),
            waited_ms: 10,
        });
        assert!(matches!(cache, Mal2Error::Cache(_)));

        let storage = Mal2Error::from(StorageError::LockPoisoned);
        assert!(matches!(storage, Mal2Error::Storage(_)));

        let vocab = Mal2Error::from(VocabularyError::ZeroWidth);
        assert!(matches!(vocab, Mal2Error::Vocabulary(_)));
    }
}
