//! Per-category classifier registration.

use std::sync::Arc;

use mal2_core::{
    Category, CategoryScore, ClassifierError, FeatureMatrix, RetryPolicy, Vocabulary,
    VocabularyError,
};

use crate::invoker::invoke_with_retry;
use crate::Classifier;

/// What a category can produce.
#[derive(Clone, Default)]
pub enum Capability {
    /// Backed by a real classifier producing a probability in `[0, 1]`.
    Implemented(Arc<dyn Classifier>),
    /// No classifier exists; always reports the not-computed sentinel.
    #[default]
    Stub,
}

impl Capability {
    pub fn is_implemented(&self) -> bool {
        matches!(self, Capability::Implemented(_))
    }

    pub fn classifier(&self) -> Option<&Arc<dyn Classifier>> {
        match self {
            Capability::Implemented(c) => Some(c),
            Capability::Stub => None,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Implemented(c) => f.debug_tuple("Implemented").field(&c.name()).finish(),
            Capability::Stub => f.write_str("Stub"),
        }
    }
}

/// Capabilities for every category plus the retry policy used to call them.
///
/// Fixed at construction; categories are looked up by enum, never by name.
///
/// # Example
/// ```ignore
/// let set = ClassifierSet::new(RetryPolicy::default())
///     .with(Category::Malware, Capability::Implemented(Arc::new(remote)));
/// let score = set.score(Category::Malware, &matrix).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClassifierSet {
    malware: Capability,
    trackers: Capability,
    adware: Capability,
    retry: RetryPolicy,
}

impl ClassifierSet {
    /// All categories start as stubs.
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    pub fn with(mut self, category: Category, capability: Capability) -> Self {
        *self.slot_mut(category) = capability;
        self
    }

    pub fn capability(&self, category: Category) -> &Capability {
        match category {
            Category::Malware => &self.malware,
            Category::Trackers => &self.trackers,
            Category::Adware => &self.adware,
        }
    }

    fn slot_mut(&mut self, category: Category) -> &mut Capability {
        match category {
            Category::Malware => &mut self.malware,
            Category::Trackers => &mut self.trackers,
            Category::Adware => &mut self.adware,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Whether any category needs encoded features.
    pub fn any_implemented(&self) -> bool {
        Category::ALL
            .iter()
            .any(|c| self.capability(*c).is_implemented())
    }

    /// Fail if any implemented classifier was trained on a different vocabulary.
    pub fn check_vocabulary(&self, vocabulary: &Vocabulary) -> Result<(), VocabularyError> {
        for category in Category::ALL {
            let Some(classifier) = self.capability(category).classifier() else {
                continue;
            };
            if let Some(expected) = classifier.expected_vocabulary_version() {
                if expected != vocabulary.version() {
                    return Err(VocabularyError::VersionMismatch {
                        expected: expected.to_string(),
                        found: vocabulary.version().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Score one category. Stubs never touch the classifier path.
    pub async fn score(
        &self,
        category: Category,
        matrix: &FeatureMatrix,
    ) -> Result<CategoryScore, ClassifierError> {
        match self.capability(category) {
            Capability::Stub => Ok(CategoryScore::NotComputed),
            Capability::Implemented(classifier) => {
                let p = invoke_with_retry(classifier.as_ref(), matrix, &self.retry).await?;
                Ok(CategoryScore::Probability(p))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mal2_core::FeatureEncoder;

    struct Fixed(f64, Option<&'static str>);

    #[async_trait]
    impl Classifier for Fixed {
        async fn predict(&self, _matrix: &FeatureMatrix) -> Result<f64, ClassifierError> {
            Ok(self.0)
        }

        fn name(&self) -> &str {
            "fixed"
        }

        fn expected_vocabulary_version(&self) -> Option<&str> {
            self.1
        }
    }

    fn matrix() -> FeatureMatrix {
        let vocab = Vocabulary::new("v1", 3).expect("valid width");
        FeatureEncoder::new(3).expect("valid width").encode(["x"], &vocab)
    }

    #[tokio::test]
    async fn test_stub_categories_report_sentinel() {
        let set = ClassifierSet::new(RetryPolicy::default());
        assert!(!set.any_implemented());
        for category in Category::ALL {
            let score = set.score(category, &matrix()).await;
            assert_eq!(score, Ok(CategoryScore::NotComputed));
        }
    }

    #[tokio::test]
    async fn test_implemented_category_scores_probability() {
        let set = ClassifierSet::new(RetryPolicy::default())
            .with(Category::Malware, Capability::Implemented(Arc::new(Fixed(0.0, None))));
        assert!(set.any_implemented());

        let malware = set.score(Category::Malware, &matrix()).await;
        assert_eq!(malware, Ok(CategoryScore::Probability(0.0)));
        let adware = set.score(Category::Adware, &matrix()).await;
        assert_eq!(adware, Ok(CategoryScore::NotComputed));
    }

    #[test]
    fn test_vocabulary_version_must_match() -> Result<(), VocabularyError> {
        let vocab = Vocabulary::new("2024-01", 3)?;
        let matching = ClassifierSet::new(RetryPolicy::default()).with(
            Category::Malware,
            Capability::Implemented(Arc::new(Fixed(0.5, Some("2024-01")))),
        );
        matching.check_vocabulary(&vocab)?;

        let stale = ClassifierSet::new(RetryPolicy::default()).with(
            Category::Malware,
            Capability::Implemented(Arc::new(Fixed(0.5, Some("2023-06")))),
        );
        assert!(matches!(
            stale.check_vocabulary(&vocab),
            Err(VocabularyError::VersionMismatch { .. })
        ));
        Ok(())
    }
}
