//! Object store access for outcome streams
//!
//! `OutcomeStore` is the multipart-upload contract the aggregator flushes
//! through; `Storage` is the aws-sdk-s3 implementation used in production.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, info, instrument};

/// Handle for one uploaded part, kept until the upload is finalized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHandle {
    pub part_number: i32,
    pub etag: String,
}

/// Multipart-upload contract against the object store
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn start_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        bytes: Vec<u8>,
    ) -> Result<PartHandle>;

    async fn finish_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> Result<()>;
}

/// S3 connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }
}

/// S3-backed object store client
#[derive(Clone)]
pub struct Storage {
    client: Client,
}

impl Storage {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "medbundle-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());
        info!("Object store client initialized");

        Self { client }
    }
}

#[async_trait]
impl OutcomeStore for Storage {
    #[instrument(skip(self))]
    async fn start_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload for s3://{}/{}", bucket, key))?;

        let upload_id = response
            .upload_id()
            .context("Object store returned no upload id")?
            .to_string();

        debug!("Started multipart upload {} for s3://{}/{}", upload_id, bucket, key);

        Ok(upload_id)
    }

    #[instrument(skip(self, bytes), fields(part_size = bytes.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        bytes: Vec<u8>,
    ) -> Result<PartHandle> {
        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| {
                format!("Failed to upload part {} for s3://{}/{}", part_number, bucket, key)
            })?;

        let etag = response
            .e_tag()
            .context("Object store returned no etag for uploaded part")?
            .to_string();

        Ok(PartHandle { part_number, etag })
    }

    #[instrument(skip(self, parts), fields(part_count = parts.len()))]
    async fn finish_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> Result<()> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to finish multipart upload for s3://{}/{}", bucket, key))?;

        info!("Finished multipart upload for s3://{}/{}", bucket, key);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert!(config.path_style);
        assert_eq!(config.access_key, "minioadmin");
    }

    #[test]
    fn test_part_handle_round_trip() {
        let part = PartHandle {
            part_number: 3,
            etag: "\"abc123\"".to_string(),
        };
        let blob = serde_json::to_string(&part).unwrap();
        let back: PartHandle = serde_json::from_str(&blob).unwrap();
        assert_eq!(back, part);
    }
}
