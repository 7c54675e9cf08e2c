//! Bulk upload of a completed batch.
//!
//! Runs once per session, after the last index was reported. Every artifact
//! is stored concurrently; a failed upload is recorded and never aborts the
//! others.

use std::sync::Arc;

use futures::future::join_all;
use renderhub_core::types::ArtifactRef;
use renderhub_storage::{object_key, ArtifactStore};
use serde::Serialize;

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    pub index: u32,
    pub key: String,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedArtifact {
    pub index: u32,
    pub error: String,
}

/// Outcome of aggregating one session, in index order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    pub stored: Vec<StoredArtifact>,
    pub failed: Vec<FailedArtifact>,
}

impl AggregationReport {
    /// Some artifacts could not be stored.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub struct AggregationTrigger {
    store: Arc<dyn ArtifactStore>,
    key_prefix: String,
}

impl AggregationTrigger {
    pub fn new(store: Arc<dyn ArtifactStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Store every completed artifact of `session`.
    pub async fn on_complete(&self, session: &Session) -> AggregationReport {
        let artifacts: Vec<(u32, ArtifactRef)> = {
            let progress = session.lock().await;
            progress
                .ledger
                .artifacts()
                .map(|(index, artifact)| (index, artifact.clone()))
                .collect()
        };

        tracing::info!(
            session_id = %session.id,
            artifacts = artifacts.len(),
            backend = self.store.backend(),
            "Aggregating session results",
        );

        let uploads = artifacts.iter().map(|(index, artifact)| async move {
            let key = object_key(&self.key_prefix, &session.id, *index, &artifact.file_name);
            let outcome = match key {
                Ok(key) => self
                    .store
                    .store(artifact.path(), &key)
                    .await
                    .map(|locator| (key, locator)),
                Err(e) => Err(e),
            };
            (*index, outcome)
        });

        let mut report = AggregationReport::default();
        for (index, outcome) in join_all(uploads).await {
            match outcome {
                Ok((key, locator)) => report.stored.push(StoredArtifact { index, key, locator }),
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id,
                        index,
                        error = %e,
                        "Failed to store artifact",
                    );
                    report.failed.push(FailedArtifact {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
