//! Filesystem-backed artifact store.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::store::{ArtifactStore, StorageError};

/// Stores artifacts under a root directory, mirroring the object key as a
/// relative path. Locators are `file://` URLs.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` under the root, refusing absolute keys and `..`.
    fn destination(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let destination = self.destination(key)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(local, &destination).await?;

        tracing::debug!(
            key,
            bytes,
            destination = %destination.display(),
            "Artifact copied to local store",
        );

        Ok(format!("file://{}", destination.display()))
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}
