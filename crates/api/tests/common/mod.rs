#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use renderhub_api::config::ServerConfig;
use renderhub_api::router::build_app_router;
use renderhub_api::state::AppState;
use renderhub_core::envelope::DispatchEnvelope;
use renderhub_core::types::WorkerId;
use renderhub_core::worker_registry::{WorkerEndpoint, WorkerRegistry};
use renderhub_dispatch::{
    CoordinatorConfig, DispatchCoordinator, DispatchError, RetryPolicy, WorkerClient,
};
use renderhub_storage::{LocalArtifactStore, StorageConfig};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

const BOUNDARY: &str = "renderhub-test-boundary";

/// How long a test waits for a dispatch or a session state.
const WAIT: Duration = Duration::from_secs(5);

pub const SECRET: &str = "test-secret";

// ---------------------------------------------------------------------------
// Worker client
// ---------------------------------------------------------------------------

/// A dispatch the coordinator sent: `(worker, session, index)`.
pub type Dispatch = (String, String, i64);

/// Accepts every dispatch and records it.
struct RecordingClient {
    tx: mpsc::UnboundedSender<Dispatch>,
}

#[async_trait]
impl WorkerClient for RecordingClient {
    async fn send(
        &self,
        endpoint: &WorkerEndpoint,
        envelope: &DispatchEnvelope,
    ) -> Result<(), DispatchError> {
        let _ = self.tx.send((
            endpoint.id.to_string(),
            envelope.session_id.to_string(),
            envelope.index,
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test app
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub coordinator: Arc<DispatchCoordinator>,
    pub dispatches: mpsc::UnboundedReceiver<Dispatch>,
    pub upload_dir: PathBuf,
    pub storage_dir: PathBuf,
    _tmp: TempDir,
}

pub fn worker(id: &str, ip: &str) -> WorkerEndpoint {
    WorkerEndpoint {
        id: WorkerId::parse(id).unwrap(),
        url: format!("http://{ip}:8001/run_ai/"),
        origin: Some(ip.parse().unwrap()),
    }
}

/// Build a test `ServerConfig` rooted in `tmp`.
pub fn test_config(tmp: &TempDir, workers: Vec<WorkerEndpoint>, secret: Option<&str>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        max_upload_bytes: 1024 * 1024,
        upload_dir: tmp.path().join("uploads"),
        shared_secret: secret.map(str::to_string),
        workers,
        coordinator: CoordinatorConfig {
            unit_count: 2,
            retry: RetryPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        },
        storage: StorageConfig::Local {
            root: tmp.path().join("storage"),
        },
    }
}

/// Two workers, `gpu-a` at 10.0.0.5 and `gpu-b` at 10.0.0.6, two units per
/// batch, no shared secret.
pub fn build_test_app() -> TestApp {
    build_test_app_with(
        vec![worker("gpu-a", "10.0.0.5"), worker("gpu-b", "10.0.0.6")],
        None,
    )
}

/// Build the full application router with all middleware layers, using the
/// same [`build_app_router`] as the binary.
pub fn build_test_app_with(workers: Vec<WorkerEndpoint>, secret: Option<&str>) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp, workers, secret);
    let storage_dir = tmp.path().join("storage");

    let (tx, dispatches) = mpsc::unbounded_channel();
    let coordinator = DispatchCoordinator::new(
        config.coordinator.clone(),
        Arc::new(WorkerRegistry::new(config.workers.clone()).unwrap()),
        Arc::new(RecordingClient { tx }),
        Arc::new(LocalArtifactStore::new(&storage_dir)),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        coordinator: Arc::clone(&coordinator),
    };

    TestApp {
        router: build_app_router(state, &config),
        coordinator,
        dispatches,
        upload_dir: config.upload_dir.clone(),
        storage_dir,
        _tmp: tmp,
    }
}

impl TestApp {
    pub async fn next_dispatch(&mut self) -> Dispatch {
        tokio::time::timeout(WAIT, self.dispatches.recv())
            .await
            .expect("timed out waiting for a dispatch")
            .expect("client dropped")
    }

    /// Files currently in the upload directory whose name starts with `prefix`.
    pub fn uploads_with_prefix(&self, prefix: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.upload_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(prefix))
            .collect()
    }

    /// Poll `GET /api/v1/sessions/{id}` until its status is `status`.
    pub async fn wait_for_status(&self, id: &str, status: &str) -> serde_json::Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let response = get(self.router.clone(), &format!("/api/v1/sessions/{id}")).await;
            let json = body_json(response).await;
            if json["data"]["status"] == status {
                return json;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {id} never reached {status}: {json}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// One multipart form field.
pub struct Part<'a> {
    pub name: &'a str,
    pub file_name: Option<&'a str>,
    pub content: Vec<u8>,
}

pub fn text<'a>(name: &'a str, value: &str) -> Part<'a> {
    Part {
        name,
        file_name: None,
        content: value.as_bytes().to_vec(),
    }
}

pub fn file<'a>(file_name: &'a str, content: Vec<u8>) -> Part<'a> {
    Part {
        name: "file",
        file_name: Some(file_name),
        content,
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part.file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{file_name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    part.name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                    .as_bytes(),
            ),
        }
        body.extend_from_slice(&part.content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

/// Attach the peer address the server would record for a real connection.
pub fn from_peer(mut request: Request<Body>, ip: &str) -> Request<Body> {
    let addr: SocketAddr = format!("{ip}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub async fn send(app: Router, request: Request<Body>) -> Response {
    app.oneshot(request).await.unwrap()
}

pub async fn post_multipart(app: Router, uri: &str, parts: &[Part<'_>]) -> Response {
    send(app, multipart_request(uri, parts)).await
}

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn delete(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn expect_status(response: Response, status: StatusCode) -> serde_json::Value {
    let actual = response.status();
    let json = body_json(response).await;
    assert_eq!(actual, status, "unexpected status, body: {json}");
    json
}

/// A small valid PNG.
pub fn png() -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::new_rgb8(4, 4)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

impl TestApp {
    /// Upload a source image as session `id` and wait for the initial
    /// fan-out. Returns `(worker, index)` pairs sorted by worker id.
    pub async fn start_session(&mut self, id: &str) -> Vec<(String, i64)> {
        let response = post_multipart(
            self.router.clone(),
            "/api/v1/upload_image",
            &[
                text("session_id", id),
                text("gender", "female"),
                file("face.png", png()),
            ],
        )
        .await;
        let json = expect_status(response, StatusCode::ACCEPTED).await;
        assert_eq!(json["data"]["session_id"], id);

        let mut assigned = Vec::new();
        for _ in 0..2 {
            let (worker, session, index) = self.next_dispatch().await;
            assert_eq!(session, id);
            assigned.push((worker, index));
        }
        assigned.sort();
        assigned
    }

    /// Report a result for `id` from `worker`, optionally naming the index.
    pub async fn report(
        &self,
        id: &str,
        worker: &str,
        index: Option<i64>,
        file_name: &str,
    ) -> Response {
        let index = index.map(|i| i.to_string());
        let mut parts = vec![text("session_id", id), text("worker_id", worker)];
        if let Some(index) = &index {
            parts.push(text("index", index));
        }
        parts.push(file(file_name, b"video-bytes".to_vec()));
        post_multipart(self.router.clone(), "/api/v1/upload_result", &parts).await
    }
}
