//! Bounded retry around a single classifier call.

use std::time::Duration;

use mal2_core::{ClassifierError, FeatureMatrix, RetryPolicy};

use crate::{checked_probability, Classifier};

/// Call `classifier` under `policy`.
///
/// Every attempt runs under the per-attempt timeout. Retryable failures
/// back off and try again until `max_attempts` is reached; a non-retryable
/// failure stops immediately. Any failure surfaces as
/// [`ClassifierError::Exhausted`] carrying the last underlying error.
pub async fn invoke_with_retry(
    classifier: &dyn Classifier,
    matrix: &FeatureMatrix,
    policy: &RetryPolicy,
) -> Result<f64, ClassifierError> {
    let max_attempts = policy.max_attempts.max(1);
    let timeout = policy.timeout_per_attempt();
    let mut attempts = 0;
    let mut last_error = String::new();

    while attempts < max_attempts {
        if attempts > 0 {
            let delay = policy.backoff.delay_for_attempt(attempts - 1);
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }
        attempts += 1;

        let outcome = match tokio::time::timeout(timeout, classifier.predict(matrix)).await {
            Ok(result) => result.and_then(|p| checked_probability(classifier.name(), p)),
            Err(_) => Err(ClassifierError::Timeout {
                classifier: classifier.name().to_string(),
                after_ms: policy.timeout_per_attempt_ms,
            }),
        };

        match outcome {
            Ok(probability) => {
                if attempts > 1 {
                    tracing::info!(classifier = classifier.name(), attempts, "Classifier succeeded after retry");
                }
                return Ok(probability);
            }
            Err(err) => {
                tracing::warn!(
                    classifier = classifier.name(),
                    attempt = attempts,
                    max_attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Classifier call failed"
                );
                let retryable = err.is_retryable();
                last_error = err.to_string();
                if !retryable {
                    break;
                }
            }
        }
    }

    Err(ClassifierError::Exhausted {
        classifier: classifier.name().to_string(),
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mal2_core::{BackoffStrategy, FeatureEncoder, Vocabulary};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a scripted sequence of outcomes, one per call.
    struct Scripted {
        calls: AtomicU32,
        script: Mutex<Vec<Result<f64, ClassifierError>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<f64, ClassifierError>>) -> Self {
            script.reverse();
            Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Classifier for Scripted {
        async fn predict(&self, _matrix: &FeatureMatrix) -> Result<f64, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().map(|mut s| s.pop()).ok().flatten();
            next.unwrap_or(Ok(0.5))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn transport() -> ClassifierError {
        ClassifierError::Transport {
            classifier: "scripted".into(),
            reason: "connection refused".into(),
        }
    }

    fn matrix() -> FeatureMatrix {
        let vocab = Vocabulary::new("v1", 2).expect("valid width");
        FeatureEncoder::new(2).expect("valid width").encode(["a"], &vocab)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::Fixed { delay_ms: 10 },
            timeout_per_attempt_ms: 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let classifier = Scripted::new(vec![Err(transport()), Err(transport()), Ok(0.9)]);
        let p = invoke_with_retry(&classifier, &matrix(), &policy(3)).await;
        assert_eq!(p, Ok(0.9));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let classifier = Scripted::new(vec![Err(transport()), Err(transport())]);
        let err = invoke_with_retry(&classifier, &matrix(), &policy(2))
            .await
            .unwrap_err();
        match err {
            ClassifierError::Exhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_is_not_retried() {
        let classifier = Scripted::new(vec![Ok(1.5), Ok(0.2)]);
        let err = invoke_with_retry(&classifier, &matrix(), &policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Exhausted { attempts: 1, .. }));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let mut classifier = Scripted::new(vec![]);
        classifier.delay = Duration::from_secs(5);
        let err = invoke_with_retry(&classifier, &matrix(), &policy(2))
            .await
            .unwrap_err();
        match err {
            ClassifierError::Exhausted { attempts, last_error, .. } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
