//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rszr::execution::{
    DispatcherConfig, DispatcherHandle, FetchedImage, InMemoryBlobStore, InMemoryImageFetcher,
    PoolSnapshot, WorkerPoolDispatcher,
};
use rszr::messaging::{DeadLetterPolicy, InMemoryMessagingService, MessagingProvider};
use rszr::ResizeJob;

pub const BUCKET: &str = "rszr-test";
pub const SOURCE_URI: &str = "https://rszr-test.s3.amazonaws.com/u1.png";
pub const SOURCE_BYTES: &[u8] = b"\x89PNG source";
pub const REQUEUE_DELAY: Duration = Duration::from_millis(1000);
pub const ASSIGNMENT_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct DispatcherFixture {
    pub handle: DispatcherHandle,
    pub fetcher: Arc<InMemoryImageFetcher>,
    pub store: Arc<InMemoryBlobStore>,
    pub broker: InMemoryMessagingService,
    pub provider: Arc<MessagingProvider>,
}

impl DispatcherFixture {
    pub fn start() -> Self {
        Self::with_broker(InMemoryMessagingService::new())
    }

    pub fn with_broker(broker: InMemoryMessagingService) -> Self {
        let fetcher = Arc::new(InMemoryImageFetcher::new());
        fetcher.insert(SOURCE_URI, FetchedImage::ok(SOURCE_BYTES.to_vec(), "image/png"));
        let store = Arc::new(InMemoryBlobStore::new(BUCKET));
        let provider = Arc::new(MessagingProvider::from(broker.clone()));

        let (handle, _task) = WorkerPoolDispatcher::spawn(
            DispatcherConfig {
                bucket: BUCKET.to_string(),
                public_read: true,
                requeue_delay: REQUEUE_DELAY,
                assignment_timeout: ASSIGNMENT_TIMEOUT,
                selection_seed: Some(7),
            },
            fetcher.clone(),
            store.clone(),
            DeadLetterPolicy::new(Arc::clone(&provider), REQUEUE_DELAY, None),
        );

        Self {
            handle,
            fetcher,
            store,
            broker,
            provider,
        }
    }

    /// Poll the pool until `check` holds; panics after two (virtual) seconds
    pub async fn wait_for_pool(&self, check: impl Fn(&PoolSnapshot) -> bool) -> PoolSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = self.handle.snapshot().await.expect("dispatcher running");
            if check(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "pool never reached the expected state: {snapshot:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn resize_job(width: u32, height: u32) -> ResizeJob {
    ResizeJob {
        id: "u1".to_string(),
        uri: SOURCE_URI.to_string(),
        target_uri: format!("https://rszr-test.s3.amazonaws.com/u1_{width}x{height}.png"),
        width,
        height,
    }
}
