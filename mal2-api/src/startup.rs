//! Wiring of the analysis pipeline from configuration.

use std::sync::Arc;

use mal2_classifier::{Capability, ClassifierSet, ModelServerClassifier};
use mal2_core::{Category, ConfigError, Mal2Error, Mal2Result, Vocabulary};
use mal2_storage::{ContentStore, InMemoryRecordStore, RecordStore, ResultCache};

use crate::config::{ServiceConfig, StoreBackend};
use crate::db::{DbConfig, PgRecordStore};
use crate::error::ApiResult;
use crate::services::AnalysisService;

/// Load the vocabulary the serving classifier expects.
///
/// Without a configured version (only allowed when every category is a stub)
/// the artifact's own version is trusted, but the width must still match
/// `max_feature_count`.
pub fn load_vocabulary(config: &ServiceConfig) -> Mal2Result<Vocabulary> {
    let path = config.vocabulary_path.as_path();
    match &config.vocabulary_version {
        Some(version) => Vocabulary::load(path, version, config.max_feature_count),
        None => {
            let vocabulary = Vocabulary::read(path)?;
            vocabulary.check_compatible(vocabulary.version(), config.max_feature_count)?;
            tracing::warn!(
                version = vocabulary.version(),
                "MAL2_VOCABULARY_VERSION not set; using the artifact's version"
            );
            Ok(vocabulary)
        }
    }
}

/// Register the model server for the malware category; everything else is a stub.
pub fn build_classifiers(config: &ServiceConfig) -> Mal2Result<ClassifierSet> {
    let set = ClassifierSet::new(config.retry_policy());
    let Some(url) = &config.classifier_url else {
        tracing::warn!("MAL2_CLASSIFIER_URL not set; all categories report the not-computed sentinel");
        return Ok(set);
    };

    let expected = config
        .vocabulary_version
        .clone()
        .ok_or_else(|| ConfigError::MissingRequired {
            field: "MAL2_VOCABULARY_VERSION".to_string(),
        })?;
    let classifier = ModelServerClassifier::new(url.clone(), config.classifier_timeout)?
        .with_name("malware-model")
        .with_vocabulary_version(expected);
    tracing::info!(url = %url, "Malware classifier registered");
    Ok(set.with(Category::Malware, Capability::Implemented(Arc::new(classifier))))
}

/// Open the configured record store, migrating PostgreSQL on the way.
pub async fn build_record_store(config: &ServiceConfig) -> ApiResult<Arc<dyn RecordStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory record store; results are lost on restart");
            Ok(Arc::new(InMemoryRecordStore::new()))
        }
        StoreBackend::Postgres => {
            let db_config = DbConfig::from_env().map_err(Mal2Error::from)?;
            let store = PgRecordStore::from_config(&db_config)?;
            store.migrate().await?;
            tracing::info!(
                host = %db_config.host,
                pool_size = store.pool_size(),
                "PostgreSQL record store ready"
            );
            Ok(Arc::new(store))
        }
    }
}

/// Assemble the full pipeline over an already opened record store.
pub async fn build_analysis_service(
    config: &ServiceConfig,
    record_store: Arc<dyn RecordStore>,
) -> ApiResult<AnalysisService> {
    let vocabulary = load_vocabulary(config)?;
    tracing::info!(
        version = vocabulary.version(),
        tokens = vocabulary.len(),
        max_width = vocabulary.max_width(),
        "Vocabulary loaded"
    );
    let classifiers = build_classifiers(config)?;

    let content_store = ContentStore::new(&config.upload_path, config.stored_suffix.clone())
        .with_date_prefix(config.date_prefix);
    content_store.ensure_root().await?;

    let cache = ResultCache::with_join_timeout(record_store, config.join_timeout);
    Ok(AnalysisService::new(cache, content_store, classifiers, Arc::new(vocabulary))?)
}
