//! Server test utilities.

use super::fixtures::{BOUNDARY, ChunkPart};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use depot_core::config::AppConfig;
use depot_server::{AppState, create_router};
use depot_storage::{FilesystemBackend, ObjectStore};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub storage_path: PathBuf,
    temp_dir: Arc<TempDir>,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = Arc::new(tempfile::tempdir().expect("Failed to create temp directory"));
        let storage_path = temp_dir.path().join("storage");
        let mut config = AppConfig::for_testing(&storage_path);
        modifier(&mut config);
        Self::start(temp_dir, storage_path, config).await
    }

    /// Simulate a restart: a fresh process over the same storage root,
    /// recovering sessions before serving.
    pub async fn restart(&self) -> Self {
        let config = (*self.state.config).clone();
        let server = Self::start(self.temp_dir.clone(), self.storage_path.clone(), config).await;
        server
            .state
            .sessions
            .recover()
            .await
            .expect("Failed to recover sessions");
        server
    }

    async fn start(temp_dir: Arc<TempDir>, storage_path: PathBuf, config: AppConfig) -> Self {
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        depot_server::metrics::register_metrics();
        let state = AppState::new(config, storage);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            storage_path,
            temp_dir,
        }
    }

    /// Send a request and decode the JSON response body.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        let json: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        (status, json)
    }

    /// POST one chunk to the upload endpoint.
    pub async fn upload_chunk(&self, part: &ChunkPart) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/uploads/chunks")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(part.to_body()))
            .unwrap();
        self.send(request).await
    }

    pub async fn finalize(&self, upload_id: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/v1/uploads/{upload_id}/finalize"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Upload the first chunk to open a session and return its id.
    pub async fn open_upload(&self, first: &ChunkPart) -> String {
        let (status, body) = self.upload_chunk(first).await;
        assert_eq!(status, StatusCode::OK, "first chunk rejected: {body}");
        body["uploadId"].as_str().unwrap().to_string()
    }

    /// Read an object from the storage root.
    pub async fn read_object(&self, key: &str) -> bytes::Bytes {
        self.state.storage.get(key).await.unwrap()
    }
}
