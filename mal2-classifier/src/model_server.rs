//! HTTP client for a TensorFlow-Serving style model server.
//!
//! Request: `POST <url>` with `{"instances": [[id, ...]]}`.
//! Response: `{"predictions": [[p]]}` or `{"predictions": [p]}`.

use std::time::Duration;

use async_trait::async_trait;
use mal2_core::{ClassifierError, FeatureMatrix, TokenId};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{checked_probability, Classifier};

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: Vec<&'a [TokenId]>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Vec<Value>,
}

/// Remote classifier reached over HTTP.
pub struct ModelServerClassifier {
    client: Client,
    url: String,
    name: String,
    timeout_ms: u64,
    vocabulary_version: Option<String>,
}

impl ModelServerClassifier {
    /// Create a client for the predict endpoint at `url`.
    ///
    /// # Arguments
    /// * `url` - Full predict URL, e.g. `http://model:8501/v1/models/mal2:predict`
    /// * `timeout` - Transport-level timeout for one request
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Transport {
                classifier: "model-server".to_string(),
                reason: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            url: url.into(),
            name: "model-server".to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            vocabulary_version: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declare the vocabulary version the served model was trained on.
    pub fn with_vocabulary_version(mut self, version: impl Into<String>) -> Self {
        self.vocabulary_version = Some(version.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Classifier for ModelServerClassifier {
    async fn predict(&self, matrix: &FeatureMatrix) -> Result<f64, ClassifierError> {
        let body = PredictRequest {
            instances: matrix.rows().take(1).collect(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClassifierError::Status {
                classifier: self.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let parsed: PredictResponse = response.json().await.map_err(|e| {
            ClassifierError::InvalidResponse {
                classifier: self.name.clone(),
                reason: format!("Failed to parse response: {}", e),
            }
        })?;
        let p = first_prediction(&self.name, &parsed.predictions)?;
        checked_probability(&self.name, p)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn expected_vocabulary_version(&self) -> Option<&str> {
        self.vocabulary_version.as_deref()
    }
}

impl ModelServerClassifier {
    fn transport_error(&self, err: reqwest::Error) -> ClassifierError {
        if err.is_timeout() {
            ClassifierError::Timeout {
                classifier: self.name.clone(),
                after_ms: self.timeout_ms,
            }
        } else {
            ClassifierError::Transport {
                classifier: self.name.clone(),
                reason: err.to_string(),
            }
        }
    }
}

impl std::fmt::Debug for ModelServerClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelServerClassifier")
            .field("url", &self.url)
            .field("name", &self.name)
            .field("vocabulary_version", &self.vocabulary_version)
            .finish()
    }
}

/// Pull the first score out of `predictions`, accepting `[p]` or `[[p]]`.
fn first_prediction(classifier: &str, predictions: &[Value]) -> Result<f64, ClassifierError> {
    let invalid = |reason: &str| ClassifierError::InvalidResponse {
        classifier: classifier.to_string(),
        reason: reason.to_string(),
    };

    let first = predictions.first().ok_or_else(|| invalid("empty predictions"))?;
    let scalar = match first {
        Value::Array(inner) => inner.first().ok_or_else(|| invalid("empty prediction row"))?,
        other => other,
    };
    scalar
        .as_f64()
        .ok_or_else(|| invalid("prediction is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mal2_core::{FeatureEncoder, Vocabulary};
    use serde_json::json;

    #[test]
    fn test_request_body_shape() -> Result<(), serde_json::Error> {
        let vocab = Vocabulary::new("v1", 3).expect("valid width");
        let matrix = FeatureEncoder::new(3).expect("valid width").encode(["x"], &vocab);
        let body = PredictRequest {
            instances: matrix.rows().take(1).collect(),
        };
        // empty vocabulary: OOV = 0, PAD = 1
        assert_eq!(serde_json::to_value(&body)?, json!({"instances": [[0, 1, 1]]}));
        Ok(())
    }

    #[test]
    fn test_first_prediction_shapes() {
        assert_eq!(first_prediction("m", &[json!([0.25])]), Ok(0.25));
        assert_eq!(first_prediction("m", &[json!(0.75), json!(0.1)]), Ok(0.75));
        assert!(matches!(
            first_prediction("m", &[]),
            Err(ClassifierError::InvalidResponse { .. })
        ));
        assert!(matches!(
            first_prediction("m", &[json!(["x"])]),
            Err(ClassifierError::InvalidResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let classifier = ModelServerClassifier::new("http://127.0.0.1:9/predict", Duration::from_secs(2))
            .expect("client builds")
            .with_vocabulary_version("v1");
        assert_eq!(classifier.expected_vocabulary_version(), Some("v1"));

        let vocab = Vocabulary::new("v1", 2).expect("valid width");
        let matrix = FeatureEncoder::new(2).expect("valid width").encode(["a"], &vocab);
        let err = classifier.predict(&matrix).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
