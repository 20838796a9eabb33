//! Token vocabulary and its persisted artifact.
//!
//! Ids are issued densely from 0 in first-occurrence order. Two ids past the
//! issued range are reserved: `next_id` marks out-of-vocabulary tokens and
//! `next_id + 1` marks padding. Neither can collide with a real token id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoFailure, Mal2Result, VocabularyError};

/// Integer id assigned to a token.
pub type TokenId = u32;

/// Current on-disk schema of the vocabulary artifact.
pub const VOCABULARY_SCHEMA_VERSION: u32 = 1;

/// Frozen or growing token-to-id mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    version: String,
    max_width: usize,
    next_id: TokenId,
    tokens: HashMap<String, TokenId>,
}

impl Vocabulary {
    /// Create an empty vocabulary for matrices of width `max_width`.
    pub fn new(version: impl Into<String>, max_width: usize) -> Result<Self, VocabularyError> {
        if max_width == 0 {
            return Err(VocabularyError::ZeroWidth);
        }
        Ok(Self {
            version: version.into(),
            max_width,
            next_id: 0,
            tokens: HashMap::new(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn max_width(&self) -> usize {
        self.max_width
    }

    /// Count of ids issued so far.
    pub fn next_id(&self) -> TokenId {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Id of `token`, if it is known.
    pub fn id_of(&self, token: &str) -> Option<TokenId> {
        self.tokens.get(token).copied()
    }

    /// Reserved id for tokens absent from the vocabulary.
    pub fn oov_id(&self) -> TokenId {
        self.next_id
    }

    /// Reserved id for unused positions in a row.
    pub fn pad_id(&self) -> TokenId {
        self.next_id + 1
    }

    /// Rows the classifier's embedding table needs: all issued ids plus OOV and PAD.
    pub fn embedding_rows(&self) -> usize {
        self.next_id as usize + 2
    }

    /// Id for `token`, issuing the next one if it is new.
    pub(crate) fn assign(&mut self, token: &str) -> Result<TokenId, VocabularyError> {
        if let Some(id) = self.tokens.get(token) {
            return Ok(*id);
        }
        // Keep OOV and PAD representable.
        if self.next_id >= TokenId::MAX - 2 {
            return Err(VocabularyError::Exhausted);
        }
        let id = self.next_id;
        self.tokens.insert(token.to_string(), id);
        self.next_id += 1;
        Ok(id)
    }

    /// Tokens sorted by id.
    pub fn tokens_by_id(&self) -> Vec<(&str, TokenId)> {
        let mut pairs: Vec<(&str, TokenId)> =
            self.tokens.iter().map(|(t, id)| (t.as_str(), *id)).collect();
        pairs.sort_by_key(|(_, id)| *id);
        pairs
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    pub fn to_artifact(&self) -> VocabularyArtifact {
        VocabularyArtifact {
            schema_version: VOCABULARY_SCHEMA_VERSION,
            vocabulary_version: self.version.clone(),
            max_width: self.max_width,
            next_id: self.next_id,
            tokens: self
                .tokens
                .iter()
                .map(|(t, id)| (t.clone(), *id))
                .collect(),
        }
    }

    /// Validate an artifact and turn it into a vocabulary.
    pub fn from_artifact(artifact: VocabularyArtifact) -> Result<Self, VocabularyError> {
        if artifact.schema_version != VOCABULARY_SCHEMA_VERSION {
            return Err(VocabularyError::UnsupportedSchema {
                found: artifact.schema_version,
                supported: VOCABULARY_SCHEMA_VERSION,
            });
        }
        if artifact.max_width == 0 {
            return Err(VocabularyError::ZeroWidth);
        }
        if artifact.next_id >= TokenId::MAX - 2 {
            return Err(VocabularyError::Exhausted);
        }

        let mut seen = HashSet::with_capacity(artifact.tokens.len());
        for (token, id) in &artifact.tokens {
            if *id >= artifact.next_id {
                return Err(VocabularyError::IdOutOfRange {
                    token: token.clone(),
                    id: *id,
                    next_id: artifact.next_id,
                });
            }
            if !seen.insert(*id) {
                return Err(VocabularyError::DuplicateId { id: *id });
            }
        }

        Ok(Self {
            version: artifact.vocabulary_version,
            max_width: artifact.max_width,
            next_id: artifact.next_id,
            tokens: artifact.tokens.into_iter().collect(),
        })
    }

    /// Write the artifact as pretty JSON.
    pub fn save(&self, path: &Path) -> Mal2Result<()> {
        let json = serde_json::to_vec_pretty(&self.to_artifact()).map_err(|e| {
            VocabularyError::Parse {
                reason: e.to_string(),
            }
        })?;
        fs::write(path, json).map_err(|e| IoFailure::new("write vocabulary", path, &e))?;
        Ok(())
    }

    /// Load an artifact and check it against what the serving classifier expects.
    ///
    /// Fails on any mismatch; there is no fallback vocabulary.
    pub fn load(path: &Path, expected_version: &str, expected_width: usize) -> Mal2Result<Self> {
        let vocabulary = Self::read(path)?;
        vocabulary.check_compatible(expected_version, expected_width)?;
        Ok(vocabulary)
    }

    /// Read and validate an artifact without checking it against a classifier.
    pub fn read(path: &Path) -> Mal2Result<Self> {
        let bytes = fs::read(path).map_err(|e| IoFailure::new("read vocabulary", path, &e))?;
        let artifact: VocabularyArtifact =
            serde_json::from_slice(&bytes).map_err(|e| VocabularyError::Parse {
                reason: e.to_string(),
            })?;
        Ok(Self::from_artifact(artifact)?)
    }

    pub fn check_compatible(
        &self,
        expected_version: &str,
        expected_width: usize,
    ) -> Result<(), VocabularyError> {
        if self.version != expected_version {
            return Err(VocabularyError::VersionMismatch {
                expected: expected_version.to_string(),
                found: self.version.clone(),
            });
        }
        if self.max_width != expected_width {
            return Err(VocabularyError::WidthMismatch {
                expected: expected_width,
                found: self.max_width,
            });
        }
        Ok(())
    }
}

/// Serialized form of a [`Vocabulary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyArtifact {
    pub schema_version: u32,
    pub vocabulary_version: String,
    pub max_width: usize,
    pub next_id: TokenId,
    pub tokens: BTreeMap<String, TokenId>,
}

// =============================================================================
// TESTS
// =============================================================================
