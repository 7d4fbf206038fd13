//! Source image retrieval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::constants::defaults;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to {uri} failed: {message}")]
    Request { uri: String, message: String },

    #[error("Reading body of {uri} failed: {message}")]
    Body { uri: String, message: String },

    #[error("HTTP client setup failed: {message}")]
    Client { message: String },
}

impl FetchError {
    pub fn request(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            uri: uri.into(),
            message: message.into(),
        }
    }

    pub fn body(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Body {
            uri: uri.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl FetchedImage {
    pub fn ok(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            status: 200,
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// `get(uri) → (status, bytes, content type)`
#[async_trait]
pub trait ImageFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, uri: &str) -> Result<FetchedImage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchedImage, FetchError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| FetchError::request(uri, e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(defaults::CONTENT_TYPE)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::body(uri, e.to_string()))?;

        Ok(FetchedImage {
            status,
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Scripted fetcher for tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryImageFetcher {
    images: Mutex<HashMap<String, FetchedImage>>,
    failing: Mutex<HashMap<String, String>>,
    fetches: AtomicUsize,
}

impl InMemoryImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: impl Into<String>, image: FetchedImage) {
        self.images.lock().insert(uri.into(), image);
    }

    /// Fail every fetch of `uri` with a request error
    pub fn fail(&self, uri: impl Into<String>, message: impl Into<String>) {
        self.failing.lock().insert(uri.into(), message.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for InMemoryImageFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchedImage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failing.lock().get(uri) {
            return Err(FetchError::request(uri, message.clone()));
        }
        Ok(self.images.lock().get(uri).cloned().unwrap_or(FetchedImage {
            status: 404,
            bytes: Vec::new(),
            content_type: defaults::CONTENT_TYPE.to_string(),
        }))
    }
}
