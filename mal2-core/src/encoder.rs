//! Fixed-width feature encoding.
//!
//! Turns per-artifact token sequences into integer rows of exactly `width`
//! columns. `build` grows a vocabulary while encoding a corpus; `encode` maps
//! tokens through a frozen vocabulary without modifying it.

use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;

use crate::error::VocabularyError;
use crate::vocabulary::{TokenId, Vocabulary};

/// Row-major integer matrix with a fixed row width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureMatrix {
    width: usize,
    data: Vec<TokenId>,
}

impl FeatureMatrix {
    fn with_capacity(width: usize, rows: usize) -> Self {
        Self {
            width,
            data: Vec::with_capacity(width * rows),
        }
    }

    fn push_row(&mut self, ids: &[TokenId], pad: TokenId) {
        let take = ids.len().min(self.width);
        self.data.extend_from_slice(&ids[..take]);
        self.data
            .extend(std::iter::repeat(pad).take(self.width - take));
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row_count(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn row(&self, index: usize) -> Option<&[TokenId]> {
        let start = index.checked_mul(self.width)?;
        self.data.get(start..start + self.width)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[TokenId]> {
        self.data.chunks_exact(self.width.max(1))
    }

    pub fn to_nested(&self) -> Vec<Vec<TokenId>> {
        self.rows().map(|r| r.to_vec()).collect()
    }
}

/// Serialized as an array of rows, the shape model servers take as `instances`.
impl Serialize for FeatureMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.row_count()))?;
        for row in self.rows() {
            seq.serialize_element(row)?;
        }
        seq.end()
    }
}

/// Encoder bound to one matrix width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureEncoder {
    max_width: usize,
}

impl FeatureEncoder {
    pub fn new(max_width: usize) -> Result<Self, VocabularyError> {
        if max_width == 0 {
            return Err(VocabularyError::ZeroWidth);
        }
        Ok(Self { max_width })
    }

    pub fn max_width(&self) -> usize {
        self.max_width
    }

    /// Build a vocabulary from `corpus` and encode every artifact in it.
    ///
    /// Ids follow first occurrence: artifacts in iteration order, tokens in
    /// order within each artifact. Tokens past the row width are dropped from
    /// the matrix but still receive ids.
    pub fn build<C, A, T>(
        &self,
        corpus: C,
        version: impl Into<String>,
    ) -> Result<(Vocabulary, FeatureMatrix), VocabularyError>
    where
        C: IntoIterator<Item = A>,
        A: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut vocabulary = Vocabulary::new(version, self.max_width)?;
        let mut rows: Vec<Vec<TokenId>> = Vec::new();

        for artifact in corpus {
            let mut row = Vec::with_capacity(self.max_width);
            for token in artifact {
                let id = vocabulary.assign(token.as_ref())?;
                if row.len() < self.max_width {
                    row.push(id);
                }
            }
            rows.push(row);
        }

        // PAD depends on the final id count, so rows are padded only once the corpus is done.
        let pad = vocabulary.pad_id();
        let mut matrix = FeatureMatrix::with_capacity(self.max_width, rows.len());
        for row in &rows {
            matrix.push_row(row, pad);
        }
        Ok((vocabulary, matrix))
    }

    /// Encode one artifact against a frozen vocabulary.
    pub fn encode<I, T>(&self, tokens: I, vocabulary: &Vocabulary) -> FeatureMatrix
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.encode_batch(std::iter::once(tokens), vocabulary)
    }

    /// Encode several artifacts against a frozen vocabulary, one row each.
    pub fn encode_batch<C, A, T>(&self, corpus: C, vocabulary: &Vocabulary) -> FeatureMatrix
    where
        C: IntoIterator<Item = A>,
        A: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let oov = vocabulary.oov_id();
        let pad = vocabulary.pad_id();
        let mut matrix = FeatureMatrix::with_capacity(self.max_width, 1);
        let mut row = Vec::with_capacity(self.max_width);

        for artifact in corpus {
            row.clear();
            row.extend(
                artifact
                    .into_iter()
                    .take(self.max_width)
                    .map(|t| vocabulary.id_of(t.as_ref()).unwrap_or(oov)),
            );
            matrix.push_row(&row, pad);
        }
        matrix
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoder(width: usize) -> FeatureEncoder {
        match FeatureEncoder::new(width) {
            Ok(e) => e,
            Err(e) => panic!("encoder: {e}"),
        }
    }

    #[test]
    fn test_build_reference_example() -> Result<(), VocabularyError> {
        let corpus = vec![vec!["a", "b", "a"], vec!["b", "c"]];
        let (vocab, matrix) = encoder(2).build(corpus, "v1")?;

        assert_eq!(vocab.id_of("a"), Some(0));
        assert_eq!(vocab.id_of("b"), Some(1));
        assert_eq!(vocab.id_of("c"), Some(2));
        assert_eq!(vocab.next_id(), 3);
        assert_eq!(matrix.to_nested(), vec![vec![0, 1], vec![1, 2]]);
        Ok(())
    }

    #[test]
    fn test_build_tokens_past_width_still_get_ids() -> Result<(), VocabularyError> {
        let corpus = vec![vec!["a", "b", "z"], vec!["c"]];
        let (vocab, matrix) = encoder(2).build(corpus, "v1")?;

        assert_eq!(vocab.id_of("z"), Some(2));
        assert_eq!(vocab.id_of("c"), Some(3));
        assert_eq!(matrix.row(0), Some(&[0, 1][..]));
        assert_eq!(matrix.row(1), Some(&[3, vocab.pad_id()][..]));
        Ok(())
    }

    #[test]
    fn test_build_pads_with_reserved_marker() -> Result<(), VocabularyError> {
        let (vocab, matrix) = encoder(4).build(vec![vec!["x"]], "v1")?;
        assert_eq!(vocab.pad_id(), 2);
        assert_eq!(matrix.to_nested(), vec![vec![0, 2, 2, 2]]);
        Ok(())
    }

    #[test]
    fn test_encode_maps_oov_to_sentinel() -> Result<(), VocabularyError> {
        let enc = encoder(3);
        let (vocab, _) = enc.build(vec![vec!["a", "b"]], "v1")?;

        let matrix = enc.encode(["a", "unknown", "b"], &vocab);
        assert_eq!(matrix.to_nested(), vec![vec![0, vocab.oov_id(), 1]]);
        assert_ne!(vocab.oov_id(), 0);
        Ok(())
    }

    #[test]
    fn test_encode_does_not_mutate_vocabulary() -> Result<(), VocabularyError> {
        let enc = encoder(3);
        let (vocab, _) = enc.build(vec![vec!["a"]], "v1")?;
        let before = vocab.clone();
        let _ = enc.encode(["new", "tokens", "here"], &vocab);
        assert_eq!(vocab, before);
        Ok(())
    }

    #[test]
    fn test_encode_empty_artifact_is_all_padding() -> Result<(), VocabularyError> {
        let enc = encoder(3);
        let (vocab, _) = enc.build(vec![vec!["a"]], "v1")?;
        let matrix = enc.encode(Vec::<String>::new(), &vocab);
        assert_eq!(matrix.row_count(), 1);
        assert!(matrix.rows().all(|r| r.iter().all(|id| *id == vocab.pad_id())));
        Ok(())
    }

    #[test]
    fn test_matrix_serializes_as_nested_rows() -> Result<(), Box<dyn std::error::Error>> {
        let (_, matrix) = encoder(2).build(vec![vec!["a", "b"], vec!["b"]], "v1")?;
        let json = serde_json::to_value(&matrix)?;
        assert_eq!(json, serde_json::json!([[0, 1], [1, 3]]));
        Ok(())
    }

    #[test]
    fn test_zero_width_rejected() {
        assert_eq!(FeatureEncoder::new(0), Err(VocabularyError::ZeroWidth));
    }

    fn corpus_strategy() -> impl Strategy<Value = Vec<Vec<String>>> {
        proptest::collection::vec(
            proptest::collection::vec("[a-f]{1,3}", 0..40),
            0..12,
        )
    }

    proptest! {
        #[test]
        fn prop_rows_have_exact_width(corpus in corpus_strategy(), width in 1usize..16) {
            let enc = encoder(width);
            let (vocab, matrix) = enc.build(corpus.clone(), "v1")?;
            prop_assert_eq!(matrix.row_count(), corpus.len());
            prop_assert!(matrix.rows().all(|r| r.len() == width));

            let encoded = enc.encode_batch(corpus.clone(), &vocab);
            prop_assert_eq!(encoded.row_count(), corpus.len());
            prop_assert!(encoded.rows().all(|r| r.len() == width));
        }

        #[test]
        fn prop_build_is_deterministic(corpus in corpus_strategy(), width in 1usize..16) {
            let enc = encoder(width);
            let (vocab_a, matrix_a) = enc.build(corpus.clone(), "v1")?;
            let (vocab_b, matrix_b) = enc.build(corpus, "v1")?;
            prop_assert_eq!(vocab_a.to_artifact(), vocab_b.to_artifact());
            prop_assert_eq!(matrix_a, matrix_b);
        }

        #[test]
        fn prop_encode_agrees_with_build(corpus in corpus_strategy(), width in 1usize..16) {
            let enc = encoder(width);
            let (vocab, built) = enc.build(corpus.clone(), "v1")?;
            prop_assert_eq!(enc.encode_batch(corpus, &vocab), built);
        }

        #[test]
        fn prop_oov_never_collides(
            corpus in corpus_strategy(),
            unseen in proptest::collection::vec("[g-k]{1,3}", 1..10),
        ) {
            let enc = encoder(8);
            let (vocab, _) = enc.build(corpus, "v1")?;
            let matrix = enc.encode(unseen.clone(), &vocab);
            let row = matrix.row(0).unwrap_or(&[]);
            for id in row.iter().take(unseen.len()) {
                prop_assert_eq!(*id, vocab.oov_id());
                prop_assert!(vocab.is_empty() || *id != 0);
                prop_assert_ne!(*id, vocab.pad_id());
            }
        }
    }
}
