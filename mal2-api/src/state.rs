//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use mal2_storage::RecordStore;

use crate::config::ServiceConfig;
use crate::services::AnalysisService;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// The upload pipeline.
    pub analysis: Arc<AnalysisService>,
    /// Same store the result cache reads, for readiness probes.
    pub record_store: Arc<dyn RecordStore>,
    pub config: Arc<ServiceConfig>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(analysis: AnalysisService, config: ServiceConfig) -> Self {
        let record_store = Arc::clone(analysis.cache().store());
        Self {
            analysis: Arc::new(analysis),
            record_store,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}

// Use macro to reduce boilerplate for FromRef implementations
crate::impl_from_ref!(Arc<AnalysisService>, analysis);
crate::impl_from_ref!(Arc<dyn RecordStore>, record_store);
crate::impl_from_ref!(Arc<ServiceConfig>, config);
crate::impl_from_ref!(Instant, start_time);
