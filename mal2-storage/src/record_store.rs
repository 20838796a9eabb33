//! Persistent table of artifact records, one row per SHA-256.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use mal2_core::{ArtifactRecord, Mal2Result, StorageError};

/// Storage for [`ArtifactRecord`] rows.
///
/// Every operation touches a single row; no multi-digest transactions exist.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// The record for `sha256`, only if its analysis has completed.
    async fn get_analyzed(&self, sha256: &str) -> Mal2Result<Option<ArtifactRecord>>;

    /// Insert a not-yet-analyzed row unless one already exists.
    ///
    /// Returns the stored row, which keeps the original `first_seen` when the
    /// digest was seen before.
    async fn record_seen(&self, record: &ArtifactRecord) -> Mal2Result<ArtifactRecord>;

    /// Persist the analysis outcome.
    ///
    /// Only a row without `analyzed_at` is updated. If the row was already
    /// analyzed, the existing record is returned unchanged.
    async fn record_analysis(&self, record: &ArtifactRecord) -> Mal2Result<ArtifactRecord>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> Mal2Result<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory record store for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<String, ArtifactRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, analyzed or not.
    pub fn len(&self) -> Mal2Result<usize> {
        Ok(self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len())
    }

    pub fn is_empty(&self) -> Mal2Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Raw row lookup, including rows still awaiting analysis.
    pub fn get_any(&self, sha256: &str) -> Mal2Result<Option<ArtifactRecord>> {
        Ok(self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(sha256)
            .cloned())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_analyzed(&self, sha256: &str) -> Mal2Result<Option<ArtifactRecord>> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.get(sha256).filter(|r| r.is_analyzed()).cloned())
    }

    async fn record_seen(&self, record: &ArtifactRecord) -> Mal2Result<ArtifactRecord> {
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        let stored = records
            .entry(record.sha256().to_string())
            .or_insert_with(|| ArtifactRecord {
                analyzed_at: None,
                ..record.clone()
            });
        Ok(stored.clone())
    }

    async fn record_analysis(&self, record: &ArtifactRecord) -> Mal2Result<ArtifactRecord> {
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        match records.get_mut(record.sha256()) {
            Some(existing) if existing.is_analyzed() => Ok(existing.clone()),
            Some(existing) => {
                existing.classification = record.classification.clone();
                existing.analyzed_at = record.analyzed_at;
                existing.stored_path = record.stored_path.clone();
                Ok(existing.clone())
            }
            None => {
                records.insert(record.sha256().to_string(), record.clone());
                Ok(record.clone())
            }
        }
    }

    async fn ping(&self) -> Mal2Result<()> {
        let _records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
