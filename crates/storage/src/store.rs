use std::path::Path;

use async_trait::async_trait;

/// Errors from an artifact store backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading the local file or writing the destination failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote service rejected or failed the upload.
    #[error("Upload failed: {0}")]
    Upload(String),

    /// The object key is unusable for this backend.
    #[error("Invalid object key '{0}'")]
    InvalidKey(String),
}

/// Destination for completed artifacts.
///
/// Implementations must be safe to call concurrently; the aggregation step
/// stores every artifact of a batch in parallel.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copy the file at `local` to `key` and return a locator for it
    /// (e.g. `s3://bucket/key`).
    async fn store(&self, local: &Path, key: &str) -> Result<String, StorageError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}
