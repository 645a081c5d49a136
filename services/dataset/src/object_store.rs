use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Raw byte storage addressed by storage key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any existing object
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Read the object under `key`; `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the object under `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Generate a storage key for a new dataset object.
/// Format: datasets/{date}/{file_id}_{name}
///
/// The date prefix keeps listings and lifecycle policies cheap; the file ID
/// makes keys unique even when names repeat.
pub fn generate_storage_key(file_id: Uuid, name: &str, at: DateTime<Utc>) -> String {
    format!(
        "datasets/{date}/{file_id}_{name}",
        date = at.format("%Y-%m-%d"),
        file_id = file_id,
        name = sanitize_path_component(name),
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .replace("..", "__")
}

/// Object store backed by S3 (or an S3-compatible server such as MinIO)
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Create the bucket if it does not exist yet
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket exists");
                Ok(())
            }
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .context("Failed to create bucket")?;

                info!(bucket = %self.bucket, "Bucket created");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to check bucket"),
        }
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?;

        match self.upload_parts(key, upload_id, &bytes).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;

                Ok(())
            }
            Err(e) => {
                // Release the parts already stored
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(error = %abort_err, key = %key, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: &[u8],
    ) -> Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.config.part_size_bytes.max(1)).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let size = bytes.len();

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, bytes, content_type).await?;
        } else {
            self.simple_upload(key, bytes, content_type).await?;
        }

        debug!(key = %key, size_bytes = size, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) => {
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to download object from S3"),
        };

        let bytes = response
            .body
            .collect()
            .await
            .context("Failed to read object body")?
            .into_bytes();

        Ok(Some(bytes.to_vec()))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<bool> {
        // S3 deletes succeed for missing keys, so check first
        if !self.exists(key).await? {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object from S3")?;

        debug!(key = %key, "Object deleted");
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(e).context("Failed to check object existence")
                }
            }
        }
    }
}
