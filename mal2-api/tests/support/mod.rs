//! Shared harness for driving the API router in-process.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use mal2_api::{create_api_router, AnalysisService, ApiConfig, AppState, ServiceConfig};
use mal2_classifier::ClassifierSet;
use mal2_storage::{ContentStore, InMemoryRecordStore};
use mal2_test_utils::fixtures;
use mal2_test_utils::MockExtractor;
use serde_json::Value;
use tower::ServiceExt;

pub const BOUNDARY: &str = "mal2-test-boundary";
pub const APK_CONTENT_TYPE: &str = "application/vnd.android.package-archive";
pub const UPLOAD_URI: &str = "/api/v1/upload/binary/";

/// A router over an in-memory store, with uploads and spools in a temp dir.
pub struct TestApp {
    pub router: Router,
    pub store: InMemoryRecordStore,
    pub stored_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(classifiers: ClassifierSet) -> Self {
        Self::with_join_timeout(classifiers, Duration::from_secs(10))
    }

    pub fn with_join_timeout(classifiers: ClassifierSet, join_timeout: Duration) -> Self {
        Self::with_config(classifiers, join_timeout, |_| {})
    }

    pub fn with_config(
        classifiers: ClassifierSet,
        join_timeout: Duration,
        customize: impl FnOnce(&mut ServiceConfig),
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let stored_dir = dir.path().join("stored");
        std::fs::create_dir_all(&stored_dir).expect("stored dir");

        let mut config = ServiceConfig {
            upload_path: dir.path().join("spool"),
            max_feature_count: fixtures::TEST_WIDTH,
            ..ServiceConfig::default()
        };
        customize(&mut config);

        let (cache, store) = fixtures::memory_cache(join_timeout);
        let service = AnalysisService::new(
            cache,
            ContentStore::new(&stored_dir, ".apk").with_date_prefix(false),
            classifiers,
            Arc::new(fixtures::vocabulary(["a", "b", "c"])),
        )
        .expect("service builds")
        .with_extractor(Arc::new(MockExtractor::new(["a", "b", "zzz"])));

        let router = create_api_router(AppState::new(service, config), &ApiConfig::default());
        Self {
            router,
            store,
            stored_dir,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        send(self.router.clone(), request).await
    }

    pub async fn upload(&self, file_name: &str, content: &[u8]) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(upload_request("file", file_name, Some(APK_CONTENT_TYPE), content))
            .await;
        (status, serde_json::from_slice(&body).expect("JSON body"))
    }
}

pub async fn send(router: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.oneshot(request).await.expect("router is infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body collects");
    (status, headers, body.to_vec())
}

/// Hand-built `multipart/form-data` body with one file field.
pub fn multipart_body(field: &str, file_name: &str, content_type: Option<&str>, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, file_name
        )
        .as_bytes(),
    );
    if let Some(ct) = content_type {
        body.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
    }
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn upload_request(
    field: &str,
    file_name: &str,
    content_type: Option<&str>,
    content: &[u8],
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(UPLOAD_URI)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(field, file_name, content_type, content)))
        .expect("request builds")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request builds")
}
