//! MAL2 Storage - Artifact Bytes, Records and the Result Cache
//!
//! Three layers, each usable on its own:
//!
//! - [`ContentStore`] writes uploaded bytes to the upload directory.
//! - [`RecordStore`] persists one [`mal2_core::ArtifactRecord`] per SHA-256.
//!   The PostgreSQL implementation lives in the API crate next to its pool.
//! - [`ResultCache`] adds single-flight claims on top of a record store so
//!   identical content is analyzed at most once at a time.

pub mod content_store;
pub mod record_store;
pub mod result_cache;

pub use content_store::{sanitize_file_name, ContentStore, StoredArtifact};
pub use record_store::{InMemoryRecordStore, RecordStore};
pub use result_cache::{
    Claim, ClaimGuard, JoinOutcome, JoinWaiter, Resolution, ResultCache, DEFAULT_JOIN_TIMEOUT,
};
