//! MAL2 Core - Data Types and Deterministic Algorithms
//!
//! Types shared by every other crate: content digests, artifact records,
//! classification outcomes and the error taxonomy. Also holds the two pure
//! algorithms of the pipeline, streaming hashing and fixed-width feature
//! encoding, so they can be tested without any I/O collaborators.

pub mod classification;
pub mod encoder;
pub mod error;
pub mod hasher;
pub mod retry;
pub mod vocabulary;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use classification::{Category, CategoryScore, Classification, NOT_COMPUTED_SENTINEL};
pub use encoder::{FeatureEncoder, FeatureMatrix};
pub use error::{
    CacheError, ClassifierError, ConfigError, IoFailure, Mal2Error, Mal2Result, StorageError,
    ValidationError, VocabularyError,
};
pub use hasher::{hash_bytes, hash_file, hash_reader, ContentHasher, HashedContent, DEFAULT_CHUNK_SIZE};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use vocabulary::{TokenId, Vocabulary, VocabularyArtifact, VOCABULARY_SCHEMA_VERSION};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Hex-encoded digests of one artifact. `sha256` is the identity and cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DigestSet {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

/// Check that `value` is a lowercase hex SHA-256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// ============================================================================
// ARTIFACT RECORD
// ============================================================================

/// Everything known about one analyzed (or being analyzed) artifact.
///
/// A record with `analyzed_at` set is final and is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ArtifactRecord {
    pub digests: DigestSet,
    /// File name given by the first uploader
    pub filename: String,
    pub stored_path: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub classification: Classification,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub first_seen: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub analyzed_at: Option<Timestamp>,
}

impl ArtifactRecord {
    /// A freshly seen artifact with no analysis yet.
    pub fn seen(digests: DigestSet, filename: impl Into<String>, stored_path: impl Into<String>) -> Self {
        Self {
            digests,
            filename: filename.into(),
            stored_path: stored_path.into(),
            classification: Classification::new(),
            first_seen: Utc::now(),
            analyzed_at: None,
        }
    }

    pub fn sha256(&self) -> &str {
        &self.digests.sha256
    }

    pub fn is_analyzed(&self) -> bool {
        self.analyzed_at.is_some()
    }

    /// Attach the analysis outcome, stamping `analyzed_at`.
    pub fn into_analyzed(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self.analyzed_at = Some(Utc::now());
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================
