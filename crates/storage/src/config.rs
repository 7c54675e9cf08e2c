//! Backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use crate::local::LocalArtifactStore;
use crate::s3::S3ArtifactStore;
use crate::store::ArtifactStore;

/// Which artifact store to build at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint_url: Option<String>,
    },
}

/// Construct the configured backend.
pub async fn build_store(config: &StorageConfig) -> Arc<dyn ArtifactStore> {
    match config {
        StorageConfig::Local { root } => {
            tracing::info!(root = %root.display(), "Using local artifact store");
            Arc::new(LocalArtifactStore::new(root.clone()))
        }
        StorageConfig::S3 {
            bucket,
            region,
            endpoint_url,
        } => Arc::new(
            S3ArtifactStore::connect(bucket.clone(), region.clone(), endpoint_url.clone()).await,
        ),
    }
}
