//! Amazon S3 artifact store.
//!
//! Credentials and region come from the standard AWS provider chain
//! (environment, profile, instance metadata). An explicit endpoint URL
//! switches to path-style addressing for S3-compatible services such as
//! MinIO.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

use crate::store::{ArtifactStore, StorageError};

pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    /// Build a store from the ambient AWS configuration.
    ///
    /// * `region`       - overrides the provider-chain region when set.
    /// * `endpoint_url` - custom endpoint for S3-compatible services.
    pub async fn connect(
        bucket: String,
        region: Option<String>,
        endpoint_url: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint_url) = endpoint_url {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        tracing::info!(bucket = %bucket, "S3 artifact store configured");

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
        }
    }

    /// Wrap an existing client.
    pub fn with_client(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn store(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Upload(DisplayErrorContext(&e).to_string()))?;

        tracing::debug!(bucket = %self.bucket, key, "Artifact uploaded to S3");

        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

/// Content type from the key's extension. Results are videos by default.
fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for("results/s/000_a.mp4"), "video/mp4");
        assert_eq!(content_type_for("results/s/000_a.MOV"), "video/quicktime");
        assert_eq!(content_type_for("results/s/000_a.png"), "image/png");
        assert_eq!(content_type_for("results/s/000_a"), "application/octet-stream");
    }
}
