//! MAL2 Classifier - Collaborator Seams
//!
//! Traits for the external collaborators the analysis pipeline consumes:
//! probability classifiers, feature-extraction front ends and post-store
//! inspectors. Concrete classifiers are registered per category through the
//! closed [`Capability`] enum; a category without an implementation is a
//! [`Capability::Stub`] and always reports the not-computed sentinel.

pub mod capability;
pub mod extractor;
pub mod inspector;
pub mod invoker;
pub mod model_server;

use std::path::Path;

use async_trait::async_trait;
use mal2_core::{ClassifierError, FeatureMatrix};

pub use capability::{Capability, ClassifierSet};
pub use extractor::{parse_token_lines, LineTokenExtractor};
pub use inspector::{ArtifactInspector, InspectionReport, NoopInspector};
pub use invoker::invoke_with_retry;
pub use model_server::ModelServerClassifier;

// ============================================================================
// CLASSIFIER TRAIT
// ============================================================================

/// A black-box probability function over encoded features.
///
/// Implementations must be thread-safe (Send + Sync). One call scores the
/// first row of `matrix`; the pipeline always submits single-row matrices.
///
/// # Example
/// ```ignore
/// struct Remote { /* ... */ }
///
/// #[async_trait]
/// impl Classifier for Remote {
///     async fn predict(&self, matrix: &FeatureMatrix) -> Result<f64, ClassifierError> {
///         // Call the model server
///     }
///     fn name(&self) -> &str { "remote" }
/// }
/// ```
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Probability in `[0, 1]` that the artifact belongs to the category.
    async fn predict(&self, matrix: &FeatureMatrix) -> Result<f64, ClassifierError>;

    /// Identifier used in logs, metrics and error messages.
    fn name(&self) -> &str;

    /// Vocabulary version the model was trained against, if it declares one.
    fn expected_vocabulary_version(&self) -> Option<&str> {
        None
    }
}

// ============================================================================
// FEATURE EXTRACTOR TRAIT
// ============================================================================

/// Front end that turns a stored artifact into its ordered token list.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Extract tokens from the artifact at `path`.
    ///
    /// # Returns
    /// * `Ok(Vec<String>)` - Tokens in artifact order
    /// * `Err(ClassifierError::Extraction)` - If the artifact cannot be read or parsed
    async fn extract(&self, path: &Path) -> Result<Vec<String>, ClassifierError>;

    fn name(&self) -> &str;
}

/// Check a probability returned by `classifier`.
pub(crate) fn checked_probability(classifier: &str, value: f64) -> Result<f64, ClassifierError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ClassifierError::ProbabilityOutOfRange {
            classifier: classifier.to_string(),
            value,
        })
    }
}
