//! Newline-delimited token extraction.
//!
//! The binary front end emits one token per line (`.data` files). This
//! extractor reads that format back; it never parses container formats.

use std::path::Path;

use async_trait::async_trait;
use mal2_core::ClassifierError;

use crate::FeatureExtractor;

/// Split a feature stream into tokens: one per line, trimmed, blanks skipped.
///
/// Invalid UTF-8 is replaced rather than rejected.
pub fn parse_token_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads the artifact at a path as a newline-delimited token stream.
#[derive(Debug, Clone, Default)]
pub struct LineTokenExtractor;

impl LineTokenExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeatureExtractor for LineTokenExtractor {
    async fn extract(&self, path: &Path) -> Result<Vec<String>, ClassifierError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ClassifierError::Extraction {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let tokens = parse_token_lines(&bytes);
        tracing::debug!(path = %path.display(), token_count = tokens.len(), "Extracted tokens");
        Ok(tokens)
    }

    fn name(&self) -> &str {
        "line-tokens"
    }
}
