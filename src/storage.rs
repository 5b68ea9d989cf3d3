//! Artifact storage for submitted answer files
//!
//! Answer-submission tasks carry the raw submitted file bytes, read once at
//! enqueue time from S3/MinIO-compatible object storage.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::info;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`. A missing or unreadable
    /// object is an error; callers must not enqueue partial tasks.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;
}

/// S3/MinIO artifact client
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    /// Create a client from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("STORAGE_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("STORAGE_PORT").unwrap_or_else(|_| "9000".into());
        let access_key =
            std::env::var("STORAGE_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key =
            std::env::var("STORAGE_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "judge-data".into());
        let use_ssl = std::env::var("STORAGE_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to artifact storage at {}", endpoint_url);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }
}

#[async_trait]
impl ArtifactStore for StorageClient {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", key))?;

        let data = response.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }
}
