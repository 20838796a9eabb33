//! MAL2 Test Utilities
//!
//! Centralized test infrastructure for the MAL2 workspace:
//! - Mock classifiers, extractors and inspectors
//! - Proptest generators for tokens, corpora and classification values
//! - Test fixtures for common scenarios
//! - Custom assertions for MAL2-specific outcomes

pub use mal2_classifier::{
    ArtifactInspector, Capability, Classifier, ClassifierSet, FeatureExtractor, InspectionReport,
};
pub use mal2_core::{
    hash_bytes, ArtifactRecord, BackoffStrategy, CacheError, Category, CategoryScore,
    Classification, ClassifierError, DigestSet, FeatureEncoder, FeatureMatrix, Mal2Error,
    Mal2Result, RetryPolicy, Vocabulary, NOT_COMPUTED_SENTINEL,
};
pub use mal2_storage::{InMemoryRecordStore, ResultCache};

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// MOCK CLASSIFIER
// ============================================================================

/// Deterministic classifier that counts its calls.
///
/// Share it as `Arc<MockClassifier>` to read [`MockClassifier::call_count`]
/// after handing a clone of the `Arc` to a [`ClassifierSet`].
#[derive(Debug)]
pub struct MockClassifier {
    probability: f64,
    delay: Duration,
    failures_remaining: AtomicU32,
    always_fail: bool,
    vocabulary_version: Option<String>,
    calls: AtomicUsize,
}

impl MockClassifier {
    /// A classifier that always returns `probability`.
    pub fn returning(probability: f64) -> Self {
        Self {
            probability,
            delay: Duration::ZERO,
            failures_remaining: AtomicU32::new(0),
            always_fail: false,
            vocabulary_version: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering, to widen race windows in concurrency tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` calls with a retryable transport error.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call with a retryable transport error.
    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::returning(0.0)
        }
    }

    pub fn with_vocabulary_version(mut self, version: impl Into<String>) -> Self {
        self.vocabulary_version = Some(version.into());
        self
    }

    /// Number of `predict` calls so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn transport_error(&self) -> ClassifierError {
        ClassifierError::Transport {
            classifier: "mock".to_string(),
            reason: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn predict(&self, _matrix: &FeatureMatrix) -> Result<f64, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_fail {
            return Err(self.transport_error());
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(self.transport_error());
        }
        Ok(self.probability)
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn expected_vocabulary_version(&self) -> Option<&str> {
        self.vocabulary_version.as_deref()
    }
}

// ============================================================================
// MOCK EXTRACTOR AND INSPECTOR
// ============================================================================

/// Extractor returning a fixed token list regardless of the artifact.
#[derive(Debug, Default)]
pub struct MockExtractor {
    tokens: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureExtractor for MockExtractor {
    async fn extract(&self, path: &Path) -> Result<Vec<String>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ClassifierError::Extraction {
                path: path.to_path_buf(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(self.tokens.clone())
    }

    fn name(&self) -> &str {
        "mock-extractor"
    }
}

/// Inspector that reports a fixed key/value pair.
#[derive(Debug, Clone)]
pub struct StaticInspector {
    key: String,
    value: serde_json::Value,
}

impl StaticInspector {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[async_trait]
impl ArtifactInspector for StaticInspector {
    async fn inspect(&self, _stored_path: &Path) -> Mal2Result<InspectionReport> {
        let mut report = InspectionReport::new();
        report.insert(self.key.clone(), self.value.clone());
        Ok(report)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for MAL2 inputs.

    use super::*;
    use proptest::prelude::*;

    /// Arbitrary artifact content, including empty.
    pub fn arb_content() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..4096)
    }

    /// Read chunk sizes from tiny to larger than most generated content.
    pub fn arb_chunk_size() -> impl Strategy<Value = usize> {
        prop_oneof![1usize..16, 16usize..1024, Just(mal2_core::DEFAULT_CHUNK_SIZE)]
    }

    /// Feature-like token drawn from a small alphabet so repeats are common.
    pub fn arb_token() -> impl Strategy<Value = String> {
        "[a-e]{1,3}(::[a-c]{1,2})?"
    }

    pub fn arb_tokens(max_len: usize) -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(arb_token(), 0..max_len)
    }

    /// Ordered corpus of artifacts.
    pub fn arb_corpus() -> impl Strategy<Value = Vec<Vec<String>>> {
        proptest::collection::vec(arb_tokens(24), 0..12)
    }

    pub fn arb_width() -> impl Strategy<Value = usize> {
        1usize..32
    }

    pub fn arb_probability() -> impl Strategy<Value = f64> {
        0.0f64..=1.0
    }

    pub fn arb_category() -> impl Strategy<Value = Category> {
        prop_oneof![
            Just(Category::Malware),
            Just(Category::Trackers),
            Just(Category::Adware),
        ]
    }

    pub fn arb_category_score() -> impl Strategy<Value = CategoryScore> {
        prop_oneof![
            arb_probability().prop_map(CategoryScore::Probability),
            Just(CategoryScore::NotComputed),
        ]
    }

    pub fn arb_classification() -> impl Strategy<Value = Classification> {
        proptest::collection::vec((arb_category(), arb_category_score()), 0..4).prop_map(
            |pairs| {
                pairs
                    .into_iter()
                    .fold(Classification::new(), |c, (cat, score)| c.with(cat, score))
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common testing scenarios.

    use super::*;
    use std::sync::Arc;

    pub const TEST_VOCABULARY_VERSION: &str = "test-v1";
    pub const TEST_WIDTH: usize = 4;

    /// Vocabulary built from a single artifact, at [`TEST_WIDTH`].
    pub fn vocabulary<I, T>(tokens: I) -> Vocabulary
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let encoder = FeatureEncoder::new(TEST_WIDTH).expect("non-zero width");
        let (vocabulary, _) = encoder
            .build([tokens], TEST_VOCABULARY_VERSION)
            .expect("vocabulary builds");
        vocabulary
    }

    /// Record for `content` that has not been analyzed.
    pub fn seen_record(content: &[u8]) -> ArtifactRecord {
        ArtifactRecord::seen(hash_bytes(content), "fixture.apk", "/tmp/fixture.apk")
    }

    /// Analyzed record with the given malware probability and stubbed other categories.
    pub fn analyzed_record(content: &[u8], malware: f64) -> ArtifactRecord {
        seen_record(content).into_analyzed(
            Classification::new()
                .with(Category::Malware, CategoryScore::Probability(malware))
                .with(Category::Trackers, CategoryScore::NotComputed)
                .with(Category::Adware, CategoryScore::NotComputed),
        )
    }

    /// Retry policy with no backoff and a short timeout.
    pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::None,
            timeout_per_attempt_ms: 2_000,
        }
    }

    /// Classifier set with only the malware category implemented.
    pub fn malware_only(classifier: Arc<MockClassifier>, max_attempts: u32) -> ClassifierSet {
        ClassifierSet::new(fast_retry(max_attempts))
            .with(Category::Malware, Capability::Implemented(classifier))
    }

    /// Result cache over a fresh in-memory store.
    pub fn memory_cache(join_timeout: Duration) -> (ResultCache, InMemoryRecordStore) {
        let store = InMemoryRecordStore::new();
        let cache = ResultCache::with_join_timeout(Arc::new(store.clone()), join_timeout);
        (cache, store)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for MAL2-specific outcomes.

    use super::*;

    /// Assert a score is the not-computed sentinel, on the wire as well.
    #[track_caller]
    pub fn assert_not_computed(score: CategoryScore) {
        assert_eq!(score, CategoryScore::NotComputed);
        assert_eq!(score.wire_value(), NOT_COMPUTED_SENTINEL);
        assert!(!(0.0..=1.0).contains(&score.wire_value()));
    }

    /// Assert a score is a genuine probability.
    #[track_caller]
    pub fn assert_probability(score: CategoryScore) {
        match score {
            CategoryScore::Probability(p) => assert!((0.0..=1.0).contains(&p), "{p} outside [0, 1]"),
            CategoryScore::NotComputed => panic!("Expected a probability, got NotComputed"),
        }
    }

    /// Assert every row of `matrix` has width `width`.
    #[track_caller]
    pub fn assert_row_width(matrix: &FeatureMatrix, width: usize) {
        assert_eq!(matrix.width(), width);
        for row in matrix.rows() {
            assert_eq!(row.len(), width);
        }
    }

    /// Assert a result is the retryable "analysis in progress" error.
    #[track_caller]
    pub fn assert_analysis_in_progress<T: std::fmt::Debug>(result: &Mal2Result<T>) {
        match result {
            Err(Mal2Error::Cache(CacheError::AnalysisInProgress { .. })) => {}
            other => panic!("Expected AnalysisInProgress, got: {:?}", other),
        }
    }

    /// Assert a result is an exhausted classifier.
    #[track_caller]
    pub fn assert_classifier_exhausted<T: std::fmt::Debug>(result: &Mal2Result<T>) {
        match result {
            Err(Mal2Error::Classifier(ClassifierError::Exhausted { .. })) => {}
            other => panic!("Expected exhausted classifier, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
