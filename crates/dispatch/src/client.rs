//! Outbound dispatch to worker nodes.
//!
//! Work units and termination signals travel the same way: a multipart
//! `POST` to the worker's `run_ai` URL carrying the session id, the unit
//! index (`-1` for termination), the variant as `gender`, and the source
//! image as `file`.

use async_trait::async_trait;
use renderhub_core::envelope::DispatchEnvelope;
use renderhub_core::worker_registry::WorkerEndpoint;

/// Errors from delivering one envelope to a worker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The HTTP request itself failed (connect, DNS, TLS, timeout, ...).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The worker answered with a non-2xx status.
    #[error("Worker responded {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The source artifact could not be read from disk.
    #[error("Failed to read source artifact: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Transport failures, 5xx and 429 are retried; other 4xx answers and a
    /// missing source file are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Request(_) => true,
            DispatchError::Status { status, .. } => *status >= 500 || *status == 429,
            DispatchError::Io(_) => false,
        }
    }
}

/// Transport to worker nodes.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Deliver `envelope` to `endpoint`. Returns once the worker accepted it.
    async fn send(
        &self,
        endpoint: &WorkerEndpoint,
        envelope: &DispatchEnvelope,
    ) -> Result<(), DispatchError>;
}

/// [`WorkerClient`] over HTTP multipart using [`reqwest`].
#[derive(Clone, Default)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Ensure the response has a success status code, or turn it into
    /// [`DispatchError::Status`] carrying the body text.
    async fn ensure_success(response: reqwest::Response) -> Result<(), DispatchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn send(
        &self,
        endpoint: &WorkerEndpoint,
        envelope: &DispatchEnvelope,
    ) -> Result<(), DispatchError> {
        let bytes = tokio::fs::read(envelope.source.path()).await?;
        let mime = mime_for(envelope.source.extension().as_deref());

        let file = reqwest::multipart::Part::bytes(bytes)
            .file_name(envelope.source.file_name.clone())
            .mime_str(mime)?;

        let form = reqwest::multipart::Form::new()
            .text("session_id", envelope.session_id.to_string())
            .text("index", envelope.index.to_string())
            .text("gender", envelope.variant.clone())
            .part("file", file);

        let response = self
            .client
            .post(&endpoint.url)
            .multipart(form)
            .send()
            .await?;

        Self::ensure_success(response).await
    }
}

fn mime_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
