//! Blob store for resized results.

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Region, RequestChecksumCalculation};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload of {key} to {bucket} failed: {message}")]
    Upload {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Upload of {key} rejected with HTTP {status}: {body}")]
    Rejected { key: String, status: u16, body: String },

    #[error("Invalid object key derived from '{target_uri}'")]
    InvalidKey { target_uri: String },

    #[error("Storage client setup failed: {message}")]
    Client { message: String },
}

impl StorageError {
    pub fn upload(
        bucket: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Upload {
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub public_read: bool,
}

/// `put(bucket, key, bytes, contentType, publicRead)`; overwrites by key
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    fn bucket(&self) -> &str;

    async fn put(&self, request: PutObjectRequest) -> Result<(), StorageError>;
}

/// Object key for a target URI: its path without the leading slash
pub fn object_key(target_uri: &str) -> Result<String, StorageError> {
    let without_tail = target_uri.split(['?', '#']).next().unwrap_or_default();
    let path = match without_tail.find("://") {
        Some(scheme_end) => {
            let rest = &without_tail[scheme_end + 3..];
            rest.find('/').map_or("", |idx| &rest[idx..])
        }
        None => without_tail,
    };
    let key = path.trim_start_matches('/');
    if key.is_empty() || key.ends_with('/') {
        return Err(StorageError::InvalidKey {
            target_uri: target_uri.to_string(),
        });
    }
    Ok(key.to_string())
}

/// S3 `PutObject` through the AWS SDK.
///
/// Credentials come from the static pair in [`StorageConfig`] when both are
/// set, otherwise from the AWS default provider chain. A custom `endpoint`
/// switches to path-style addressing for S3-compatible stores.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let (bucket, region) = match (&config.bucket, &config.region) {
            (Some(bucket), Some(region)) => (bucket.clone(), region.clone()),
            _ => {
                return Err(StorageError::Client {
                    message: "storage bucket and region are required".to_string(),
                })
            }
        };
        let endpoint = config.endpoint.clone().filter(|e| !e.trim().is_empty());

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.upload_timeout())
                    .build(),
            );
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "rszr-config",
            ));
        }
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if endpoint.is_some() {
            builder = builder
                .force_path_style(true)
                .request_checksum_calculation(RequestChecksumCalculation::WhenRequired);
        }

        debug!(bucket = %bucket, endpoint = ?endpoint, "S3 client configured");
        Ok(Self::new(aws_sdk_s3::Client::from_conf(builder.build()), bucket))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, request: PutObjectRequest) -> Result<(), StorageError> {
        let size = request.bytes.len();
        let mut put = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .body(ByteStream::from(request.bytes));
        if request.public_read {
            put = put.acl(ObjectCannedAcl::PublicRead);
        }

        match put.send().await {
            Ok(_) => {
                debug!(bucket = %request.bucket, key = %request.key, size, "Object stored");
                Ok(())
            }
            Err(SdkError::ServiceError(service)) => Err(StorageError::Rejected {
                key: request.key,
                status: service.raw().status().as_u16(),
                body: DisplayErrorContext(service.err()).to_string(),
            }),
            Err(e) => Err(StorageError::upload(
                &request.bucket,
                &request.key,
                DisplayErrorContext(&e).to_string(),
            )),
        }
    }
}

/// Records puts in memory; failures can be injected
#[derive(Debug)]
pub struct InMemoryBlobStore {
    bucket: String,
    puts: Mutex<Vec<PutObjectRequest>>,
    failures: Mutex<usize>,
}

impl InMemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            puts: Mutex::new(Vec::new()),
            failures: Mutex::new(0),
        }
    }

    /// Fail the next `count` puts
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock() = count;
    }

    pub fn puts(&self) -> Vec<PutObjectRequest> {
        self.puts.lock().clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.puts
            .lock()
            .iter()
            .rev()
            .find(|put| put.key == key)
            .map(|put| put.bytes.clone())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, request: PutObjectRequest) -> Result<(), StorageError> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StorageError::upload(
                    &request.bucket,
                    &request.key,
                    "injected failure",
                ));
            }
        }
        self.puts.lock().push(request);
        Ok(())
    }
}
