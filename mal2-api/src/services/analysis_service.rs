//! Analysis Service
//!
//! Runs one validated upload through the pipeline:
//! hash → cache lookup → (hit | join | claim → store → inspect → extract →
//! encode → classify → complete).
//!
//! The [`ResultCache`] claim is the only synchronization point. The content
//! store is written only by the request that holds the claim.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use mal2_classifier::{
    ArtifactInspector, ClassifierSet, FeatureExtractor, InspectionReport, LineTokenExtractor,
    NoopInspector,
};
use mal2_core::{
    hash_file, ArtifactRecord, Category, CategoryScore, Classification, DigestSet,
    FeatureEncoder, HashedContent, Mal2Result, Vocabulary, DEFAULT_CHUNK_SIZE,
};
use mal2_storage::{ClaimGuard, ContentStore, Resolution, ResultCache, StoredArtifact};
use serde_json::Map;

use crate::error::{ApiError, ApiResult};
use crate::telemetry::{metrics, UploadOutcome};
use crate::types::{malware_breakdown, UploadResponse, PROBABILITIES_KEY};

/// Pipeline states, logged as the `stage` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Validated,
    Hashed,
    CacheHit,
    Claimed,
    FeatureExtracted,
    Classified,
    Completed,
    Joined,
    AwaitingResult,
    Done,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Received => "received",
            PipelineStage::Validated => "validated",
            PipelineStage::Hashed => "hashed",
            PipelineStage::CacheHit => "cache_hit",
            PipelineStage::Claimed => "claimed",
            PipelineStage::FeatureExtracted => "feature_extracted",
            PipelineStage::Classified => "classified",
            PipelineStage::Completed => "completed",
            PipelineStage::Joined => "joined",
            PipelineStage::AwaitingResult => "awaiting_result",
            PipelineStage::Done => "done",
        }
    }
}

/// An upload that passed validation and sits in a temporary file.
///
/// The temporary file is removed when this value is dropped.
#[derive(Debug)]
pub struct SpooledUpload {
    file_name: String,
    file: tempfile::NamedTempFile,
    size_bytes: u64,
}

impl SpooledUpload {
    pub fn new(file_name: impl Into<String>, file: tempfile::NamedTempFile, size_bytes: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file,
            size_bytes,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// The orchestrator. Cheap to share behind an `Arc`.
pub struct AnalysisService {
    cache: ResultCache,
    content_store: ContentStore,
    classifiers: ClassifierSet,
    encoder: FeatureEncoder,
    vocabulary: Arc<Vocabulary>,
    extractor: Arc<dyn FeatureExtractor>,
    inspector: Arc<dyn ArtifactInspector>,
}

impl AnalysisService {
    /// Assemble the pipeline.
    ///
    /// # Errors
    /// Fails if any implemented classifier expects a different vocabulary
    /// version than `vocabulary`.
    pub fn new(
        cache: ResultCache,
        content_store: ContentStore,
        classifiers: ClassifierSet,
        vocabulary: Arc<Vocabulary>,
    ) -> Mal2Result<Self> {
        classifiers.check_vocabulary(&vocabulary)?;
        let encoder = FeatureEncoder::new(vocabulary.max_width())?;
        Ok(Self {
            cache,
            content_store,
            classifiers,
            encoder,
            vocabulary,
            extractor: Arc::new(LineTokenExtractor::new()),
            inspector: Arc::new(NoopInspector),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ArtifactInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Analyze an upload, or reuse the result for identical content.
    ///
    /// # Arguments
    /// - `upload`: The validated, spooled upload
    /// - `received_at`: When the request arrived, for `query_time_sec`
    ///
    /// # Errors
    /// - `StorageError` (500) if hashing or storing the bytes fails
    /// - `AnalysisInProgress` (503) if another request holds the claim past the join timeout
    /// - `ClassificationUnavailable` (503) if a classifier fails after all retries
    pub async fn analyze(&self, upload: &SpooledUpload, received_at: Instant) -> ApiResult<UploadResponse> {
        let result = self.run(upload, received_at).await;
        if let Some(m) = metrics() {
            m.set_inflight_claims(self.cache.inflight_count());
            if result.is_err() {
                m.record_upload(UploadOutcome::Failed);
            }
        }
        result
    }

    async fn run(&self, upload: &SpooledUpload, received_at: Instant) -> ApiResult<UploadResponse> {
        tracing::debug!(
            stage = PipelineStage::Validated.as_str(),
            file_name = upload.file_name(),
            size_bytes = upload.size_bytes(),
            "Upload validated"
        );

        let hashed = hash_spooled(upload.path().to_path_buf()).await?;
        let digests = hashed.digests;
        let sha256 = digests.sha256.clone();
        tracing::debug!(
            sha256 = %sha256,
            stage = PipelineStage::Hashed.as_str(),
            elapsed_ms = elapsed_ms(received_at),
            "Upload hashed"
        );

        let (record, already_analyzed, outcome, mut extra) = match self.cache.acquire(&sha256).await? {
            Resolution::Hit(record) => {
                tracing::info!(
                    sha256 = %sha256,
                    stage = PipelineStage::CacheHit.as_str(),
                    already_analyzed = true,
                    "Cache hit"
                );
                (record, true, UploadOutcome::Hit, Map::new())
            }
            Resolution::Joined(record) => {
                tracing::info!(
                    sha256 = %sha256,
                    stage = PipelineStage::AwaitingResult.as_str(),
                    already_analyzed = true,
                    elapsed_ms = elapsed_ms(received_at),
                    "Joined in-flight analysis"
                );
                (record, true, UploadOutcome::Joined, Map::new())
            }
            Resolution::Owner(guard) => {
                if let Some(m) = metrics() {
                    m.set_inflight_claims(self.cache.inflight_count());
                }
                let (record, report) = self.run_owned(guard, upload, &digests, received_at).await?;
                (record, false, UploadOutcome::Analyzed, report)
            }
        };

        if let Some(breakdown) = malware_breakdown(&record) {
            extra.insert(PROBABILITIES_KEY.to_string(), breakdown);
        }

        let query_time_sec = received_at.elapsed().as_secs_f64();
        if let Some(m) = metrics() {
            m.record_upload(outcome);
        }
        tracing::info!(
            sha256 = %sha256,
            stage = PipelineStage::Done.as_str(),
            already_analyzed,
            outcome = outcome.as_str(),
            elapsed_ms = elapsed_ms(received_at),
            "Upload answered"
        );

        Ok(UploadResponse::from_record(
            upload.file_name(),
            &record,
            already_analyzed,
            extra,
            query_time_sec,
        ))
    }

    /// The claimed path. Any early return drops `guard`, which releases the
    /// claim so a joiner can take over.
    async fn run_owned(
        &self,
        guard: ClaimGuard,
        upload: &SpooledUpload,
        digests: &DigestSet,
        received_at: Instant,
    ) -> ApiResult<(ArtifactRecord, InspectionReport)> {
        let sha256 = digests.sha256.as_str();
        let generation = guard.generation();
        tracing::info!(
            sha256,
            generation,
            stage = PipelineStage::Claimed.as_str(),
            already_analyzed = false,
            "Claimed analysis"
        );

        let stored = self
            .content_store
            .store_file(upload.path(), upload.file_name(), sha256, None)
            .await?;

        match self.analyze_stored(guard, &stored, upload, digests, received_at).await {
            Ok(done) => Ok(done),
            Err(e) => {
                self.content_store.discard(&stored.path).await;
                Err(e)
            }
        }
    }

    /// Record, inspect and classify an artifact the owner has already stored.
    async fn analyze_stored(
        &self,
        guard: ClaimGuard,
        stored: &StoredArtifact,
        upload: &SpooledUpload,
        digests: &DigestSet,
        received_at: Instant,
    ) -> ApiResult<(ArtifactRecord, InspectionReport)> {
        let sha256 = digests.sha256.as_str();
        let generation = guard.generation();
        let stored_path = stored.path.display().to_string();

        let seen = self
            .cache
            .store()
            .record_seen(&ArtifactRecord::seen(
                digests.clone(),
                upload.file_name(),
                stored_path.clone(),
            ))
            .await?;

        let report = self.inspector.inspect(&stored.path).await?;

        let classification = self
            .classify(&stored.path, digests, generation)
            .await?;
        tracing::debug!(
            sha256,
            generation,
            stage = PipelineStage::Classified.as_str(),
            elapsed_ms = elapsed_ms(received_at),
            "All categories scored"
        );

        let record = ArtifactRecord {
            stored_path,
            analyzed_at: None,
            ..seen
        }
        .into_analyzed(classification);
        let record = guard.complete(record).await?;
        tracing::info!(
            sha256,
            generation,
            stage = PipelineStage::Completed.as_str(),
            elapsed_ms = elapsed_ms(received_at),
            "Analysis completed"
        );
        Ok((record, report))
    }

    /// Score every category. Extraction is skipped when all categories are stubs.
    async fn classify(
        &self,
        stored_path: &Path,
        digests: &DigestSet,
        generation: u64,
    ) -> ApiResult<Classification> {
        let unavailable = |e: &dyn std::fmt::Display| {
            tracing::warn!(sha256 = %digests.sha256, generation, error = %e, "Classification unavailable");
            ApiError::classification_unavailable(digests, e)
        };

        let mut classification = Classification::new();
        if !self.classifiers.any_implemented() {
            for category in Category::ALL {
                classification.set(category, CategoryScore::NotComputed);
            }
            return Ok(classification);
        }

        let tokens = self
            .extractor
            .extract(stored_path)
            .await
            .map_err(|e| unavailable(&e))?;
        let matrix = self.encoder.encode(&tokens, &self.vocabulary);
        tracing::debug!(
            sha256 = %digests.sha256,
            generation,
            stage = PipelineStage::FeatureExtracted.as_str(),
            token_count = tokens.len(),
            oov = tokens.iter().filter(|t| self.vocabulary.id_of(t).is_none()).count(),
            "Features encoded"
        );

        for category in Category::ALL {
            let implemented = self.classifiers.capability(category).is_implemented();
            let start = Instant::now();
            let scored = self.classifiers.score(category, &matrix).await;
            if implemented {
                if let Some(m) = metrics() {
                    m.record_classifier_call(category, scored.is_ok(), start.elapsed().as_secs_f64());
                }
            }
            classification.set(category, scored.map_err(|e| unavailable(&e))?);
        }
        Ok(classification)
    }
}

impl std::fmt::Debug for AnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisService")
            .field("cache", &self.cache)
            .field("content_root", &self.content_store.root())
            .field("vocabulary_version", &self.vocabulary.version())
            .field("max_width", &self.encoder.max_width())
            .finish()
    }
}

/// Hash off the async runtime; large uploads would otherwise stall other tasks.
async fn hash_spooled(path: PathBuf) -> ApiResult<HashedContent> {
    let hashed = tokio::task::spawn_blocking(move || hash_file(&path, DEFAULT_CHUNK_SIZE))
        .await
        .map_err(|e| ApiError::internal_error(format!("Hashing task failed: {}", e)))?;
    hashed.map_err(ApiError::from)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use mal2_core::Mal2Error;
    use mal2_test_utils::fixtures::{self, TEST_WIDTH};
    use mal2_test_utils::{MockClassifier, MockExtractor, StaticInspector};
    use std::io::Write;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        service: AnalysisService,
        store: mal2_storage::InMemoryRecordStore,
        spool_dir: PathBuf,
    }

    fn harness(classifiers: ClassifierSet) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let stored = dir.path().join("stored");
        std::fs::create_dir_all(&stored).expect("stored dir");
        let (cache, store) = fixtures::memory_cache(Duration::from_secs(5));
        let vocabulary = Arc::new(fixtures::vocabulary(["a", "b", "c"]));
        let service = AnalysisService::new(
            cache,
            ContentStore::new(&stored, ".apk").with_date_prefix(false),
            classifiers,
            vocabulary,
        )
        .expect("service builds")
        .with_extractor(Arc::new(MockExtractor::new(["a", "x"])));
        Harness {
            spool_dir: dir.path().to_path_buf(),
            _dir: dir,
            service,
            store,
        }
    }

    fn spool(dir: &Path, name: &str, content: &[u8]) -> SpooledUpload {
        let mut file = tempfile::NamedTempFile::new_in(dir).expect("spool file");
        file.write_all(content).expect("spool write");
        SpooledUpload::new(name, file, content.len() as u64)
    }

    #[tokio::test]
    async fn test_first_upload_analyzes_then_hits() -> ApiResult<()> {
        let mock = Arc::new(MockClassifier::returning(0.8));
        let h = harness(fixtures::malware_only(Arc::clone(&mock), 1));

        let first = h.service.analyze(&spool(&h.spool_dir, "app.apk", b"apk"), Instant::now()).await?;
        assert!(!first.already_analyzed);
        assert_eq!(first.classification["contains_malware"], 0.8);
        assert_eq!(first.classification["contains_trackers"], -1.0);
        assert_eq!(first.extra[PROBABILITIES_KEY]["MALWARE"], 0.8);
        assert!(Path::new(&first.stored_path).exists());
        assert!(first.stored_path.ends_with(".apk"));

        let second = h.service.analyze(&spool(&h.spool_dir, "copy.apk", b"apk"), Instant::now()).await?;
        assert!(second.already_analyzed);
        assert_eq!(second.uploaded_file, "copy.apk");
        assert_eq!(second.stored_path, first.stored_path);
        assert_eq!(second.classification, first.classification);
        assert_eq!(mock.call_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stubbed_categories_skip_extraction() -> ApiResult<()> {
        let h = harness(ClassifierSet::new(fixtures::fast_retry(1)));
        let h = Harness {
            service: h.service.with_extractor(Arc::new(MockExtractor::failing())),
            ..h
        };

        let response = h.service.analyze(&spool(&h.spool_dir, "a.apk", b"x"), Instant::now()).await?;
        assert!(response.classification.values().all(|v| *v == -1.0));
        assert!(!response.extra.contains_key(PROBABILITIES_KEY));
        Ok(())
    }

    #[tokio::test]
    async fn test_classifier_failure_releases_and_keeps_first_seen() -> ApiResult<()> {
        let mock = Arc::new(MockClassifier::returning(0.4).failing_first(2));
        let h = harness(fixtures::malware_only(Arc::clone(&mock), 2));

        let err = h
            .service
            .analyze(&spool(&h.spool_dir, "a.apk", b"flaky"), Instant::now())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ClassificationUnavailable);
        let details = err.details.clone().unwrap_or_default();
        assert_eq!(details["sha256"], mal2_core::hash_bytes(b"flaky").sha256);
        assert_eq!(h.service.cache().inflight_count(), 0);

        let sha = mal2_core::hash_bytes(b"flaky").sha256;
        let first_seen = h
            .store
            .get_any(&sha)
            .map_err(ApiError::from)?
            .map(|r| r.first_seen);
        assert!(first_seen.is_some());

        let retry = h.service.analyze(&spool(&h.spool_dir, "a.apk", b"flaky"), Instant::now()).await?;
        assert!(!retry.already_analyzed);
        assert_eq!(retry.classification["contains_malware"], 0.4);
        let record = h.store.get_any(&sha).map_err(ApiError::from)?;
        assert_eq!(record.map(|r| r.first_seen), first_seen);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_analysis_discards_stored_copy() -> ApiResult<()> {
        let mock = Arc::new(MockClassifier::returning(0.3).failing_first(1));
        let h = harness(fixtures::malware_only(Arc::clone(&mock), 1));
        let stored_files = || {
            std::fs::read_dir(h.service.content_store.root())
                .map(|entries| entries.count())
                .unwrap_or_default()
        };

        let err = h
            .service
            .analyze(&spool(&h.spool_dir, "a.apk", b"orphan"), Instant::now())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ClassificationUnavailable);
        assert_eq!(stored_files(), 0);

        let retry = h.service.analyze(&spool(&h.spool_dir, "a.apk", b"orphan"), Instant::now()).await?;
        assert!(Path::new(&retry.stored_path).exists());
        assert_eq!(stored_files(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_inspector_report_lands_in_extra() -> ApiResult<()> {
        let mock = Arc::new(MockClassifier::returning(0.1));
        let h = harness(fixtures::malware_only(mock, 1));
        let h = Harness {
            service: h
                .service
                .with_inspector(Arc::new(StaticInspector::new("stage2", serde_json::json!("ok")))),
            ..h
        };

        let response = h.service.analyze(&spool(&h.spool_dir, "a.apk", b"i"), Instant::now()).await?;
        assert_eq!(response.extra["stage2"], "ok");
        Ok(())
    }

    #[test]
    fn test_vocabulary_version_mismatch_fails_construction() {
        let mock = Arc::new(MockClassifier::returning(0.5).with_vocabulary_version("other"));
        let (cache, _) = fixtures::memory_cache(Duration::from_secs(1));
        let result = AnalysisService::new(
            cache,
            ContentStore::new("/tmp", ".apk"),
            fixtures::malware_only(mock, 1),
            Arc::new(fixtures::vocabulary(["a"])),
        );
        assert!(matches!(result, Err(Mal2Error::Vocabulary(_))));
        assert_eq!(TEST_WIDTH, fixtures::vocabulary(["a"]).max_width());
    }
}
