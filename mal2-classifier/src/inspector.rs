//! Post-store inspection hook.

use std::path::Path;

use async_trait::async_trait;
use mal2_core::Mal2Result;
use serde_json::{Map, Value};

/// Key/value findings merged into the response `extra` object.
pub type InspectionReport = Map<String, Value>;

/// Runs additional checks on an artifact once it has been stored.
///
/// Called only by the request that analyzes the artifact. An error fails
/// that analysis and releases its claim.
#[async_trait]
pub trait ArtifactInspector: Send + Sync {
    async fn inspect(&self, stored_path: &Path) -> Mal2Result<InspectionReport>;
}

/// Inspector that reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInspector;

#[async_trait]
impl ArtifactInspector for NoopInspector {
    async fn inspect(&self, _stored_path: &Path) -> Mal2Result<InspectionReport> {
        Ok(InspectionReport::new())
    }
}
