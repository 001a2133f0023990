use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::codes;

const CONTENT_TYPE: &str = "application/gzip";
const CONTENT_ENCODING: &str = "gzip";

/// Ceiling for any single store call (a part upload, a finalize).
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 SDK error: {0}")]
    Sdk(String),
    #[error("Upload error: {0}")]
    Upload(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Sdk(_) | StorageError::Upload(_) => codes::S3_UPLOAD_ERROR,
            StorageError::Config(_) => codes::VALIDATION_ERROR,
        }
    }
}

/// S3 configuration for the export destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>, // For MinIO/S3-compatible services
}

impl S3Config {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.bucket_name.trim().is_empty() {
            return Err(StorageError::Config(
                "Bucket name cannot be empty".to_string(),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(StorageError::Config("Region cannot be empty".to_string()));
        }
        if self.access_key_id.trim().is_empty() {
            return Err(StorageError::Config(
                "Access key ID cannot be empty".to_string(),
            ));
        }
        if self.secret_access_key.trim().is_empty() {
            return Err(StorageError::Config(
                "Secret access key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Streaming handle for one object.
///
/// `write` accepts compressed bytes in arbitrary slices; `finish` finalizes
/// the object (nothing is visible at the key before that); `abort` discards
/// the partial upload, leaving the key's previous content untouched.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Finalize the object and return the total byte count written.
    async fn finish(&mut self) -> Result<u64, StorageError>;

    /// Drop the partial upload. Safe to call after `finish` (no-op) and
    /// more than once.
    async fn abort(&mut self) -> Result<(), StorageError>;
}

/// Factory for object writers (allows swapping in the in-memory store for tests)
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn new_writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, StorageError>;
}

/// Production object store backed by S3 (or an S3-compatible endpoint).
///
/// Objects are written with a multipart upload at the configured part size;
/// payloads smaller than one part go through a plain `put_object`.
pub struct S3ObjectStore {
    client: Client,
    bucket_name: String,
    part_size: usize,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config, part_size: usize) -> Result<Self, StorageError> {
        config.validate()?;

        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None, // session_token
            None, // expiration
            "tableflow-s3-config",
        );

        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(OPERATION_TIMEOUT)
                    .build(),
            );

        // Set custom endpoint if provided (for S3-compatible services)
        if let Some(endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let client = Client::new(&aws_config);

        Ok(S3ObjectStore {
            client,
            bucket_name: config.bucket_name,
            part_size,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn new_writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        Ok(Box::new(S3ObjectWriter {
            client: self.client.clone(),
            bucket_name: self.bucket_name.clone(),
            key: key.to_string(),
            part_size: self.part_size,
            buffer: Vec::with_capacity(self.part_size.min(1024 * 1024)),
            upload_id: None,
            parts: Vec::new(),
            bytes_written: 0,
            finished: false,
        }))
    }
}

struct S3ObjectWriter {
    client: Client,
    bucket_name: String,
    key: String,
    part_size: usize,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    bytes_written: u64,
    finished: bool,
}

impl S3ObjectWriter {
    async fn ensure_multipart(&mut self) -> Result<String, StorageError> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket_name)
            .key(&self.key)
            .content_type(CONTENT_TYPE)
            .content_encoding(CONTENT_ENCODING)
            .send()
            .await
            .map_err(|e| StorageError::Sdk(format!("Create multipart upload failed: {}", e)))?;

        let id = created
            .upload_id()
            .ok_or_else(|| StorageError::Upload("Missing multipart upload id".to_string()))?
            .to_string();
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn upload_part(&mut self, data: Vec<u8>) -> Result<(), StorageError> {
        let upload_id = self.ensure_multipart().await?;
        let part_number = self.parts.len() as i32 + 1;
        let len = data.len();

        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket_name)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Sdk(format!("Upload part {} failed: {}", part_number, e)))?;

        debug!(key = %self.key, part_number, bytes = len, "uploaded part");

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(uploaded.e_tag().unwrap_or_default())
                .build(),
        );
        self.bytes_written += len as u64;
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for S3ObjectWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buffer, rest);
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64, StorageError> {
        if self.finished {
            return Ok(self.bytes_written);
        }

        match self.upload_id.clone() {
            None => {
                // Small object: single put, no multipart session to close.
                let data = std::mem::take(&mut self.buffer);
                self.bytes_written = data.len() as u64;
                self.client
                    .put_object()
                    .bucket(&self.bucket_name)
                    .key(&self.key)
                    .content_type(CONTENT_TYPE)
                    .content_encoding(CONTENT_ENCODING)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| StorageError::Sdk(format!("Put object failed: {}", e)))?;
            }
            Some(upload_id) => {
                if !self.buffer.is_empty() {
                    let tail = std::mem::take(&mut self.buffer);
                    self.upload_part(tail).await?;
                }
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(self.parts.clone()))
                    .build();
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket_name)
                    .key(&self.key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| {
                        StorageError::Sdk(format!("Complete multipart upload failed: {}", e))
                    })?;
            }
        }

        self.finished = true;
        debug!(key = %self.key, bytes = self.bytes_written, "object finalized");
        Ok(self.bytes_written)
    }

    async fn abort(&mut self) -> Result<(), StorageError> {
        self.buffer.clear();
        if self.finished {
            return Ok(());
        }
        if let Some(upload_id) = self.upload_id.take() {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket_name)
                .key(&self.key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| StorageError::Sdk(format!("Abort multipart upload failed: {}", e)))?;
        }
        Ok(())
    }
}
