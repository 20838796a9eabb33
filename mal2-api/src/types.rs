//! API Request and Response Types

use std::collections::BTreeMap;

use mal2_core::{ArtifactRecord, Category, CategoryScore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under `extra` holding the malware/benign breakdown.
pub const PROBABILITIES_KEY: &str = "probabilities";

/// Response to a binary upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UploadResponse {
    /// File name as sent by this uploader
    pub uploaded_file: String,
    /// Where the analyzed copy of this content is stored
    pub stored_path: String,
    /// True when this request did not run the analysis itself
    pub already_analyzed: bool,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    /// Category name to probability; `-1.0` marks a category with no classifier
    pub classification: BTreeMap<String, f64>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub extra: Map<String, Value>,
    pub query_time_sec: f64,
}

impl UploadResponse {
    pub fn from_record(
        uploaded_file: impl Into<String>,
        record: &ArtifactRecord,
        already_analyzed: bool,
        extra: Map<String, Value>,
        query_time_sec: f64,
    ) -> Self {
        Self {
            uploaded_file: uploaded_file.into(),
            stored_path: record.stored_path.clone(),
            already_analyzed,
            md5: record.digests.md5.clone(),
            sha1: record.digests.sha1.clone(),
            sha256: record.digests.sha256.clone(),
            classification: record.classification.to_wire(),
            extra,
            query_time_sec,
        }
    }
}

/// `{"MALWARE": p, "BENIGN": 1 - p}` when the malware category was computed.
pub fn malware_breakdown(record: &ArtifactRecord) -> Option<Value> {
    match record.classification.get(Category::Malware) {
        CategoryScore::Probability(p) => Some(serde_json::json!({
            "MALWARE": p,
            "BENIGN": 1.0 - p,
        })),
        CategoryScore::NotComputed => None,
    }
}
