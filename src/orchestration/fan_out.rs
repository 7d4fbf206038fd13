//! # Fan-Out Orchestrator
//!
//! Expands one `image-uploaded` event into one `image-resize` job per preset.
//!
//! The source delivery is finished only after every job publish succeeded.
//! On a partial failure it is left untouched, so the broker redelivers it and
//! the whole preset set is regenerated. Downstream handling tolerates the
//! duplicate jobs this produces because uploads overwrite by key.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::presets::{derive_target_uri, PresetCatalog, PresetError};
use crate::constants::topics;
use crate::events::{decode_event, EventBus, EventType, ResizeJob, UploadedImageEvent};
use crate::messaging::{DeadLetterOutcome, DeadLetterPolicy, MessagingProvider, QueueDelivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// All jobs published and the source finished
    Completed { jobs: usize },
    /// At least one publish failed; the source waits for broker redelivery
    LeftForRedelivery { published: usize, failed: usize },
    DeadLettered,
    Requeued,
    AlreadyResolved,
}

impl From<DeadLetterOutcome> for FanOutOutcome {
    fn from(outcome: DeadLetterOutcome) -> Self {
        match outcome {
            DeadLetterOutcome::DeadLettered => Self::DeadLettered,
            DeadLetterOutcome::Requeued => Self::Requeued,
            DeadLetterOutcome::AlreadyResolved => Self::AlreadyResolved,
        }
    }
}

#[derive(Debug)]
pub struct FanOutOrchestrator {
    provider: Arc<MessagingProvider>,
    catalog: Arc<PresetCatalog>,
    dead_letter: DeadLetterPolicy,
}

impl FanOutOrchestrator {
    pub fn new(
        provider: Arc<MessagingProvider>,
        catalog: Arc<PresetCatalog>,
        dead_letter: DeadLetterPolicy,
    ) -> Self {
        Self {
            provider,
            catalog,
            dead_letter,
        }
    }

    pub fn catalog(&self) -> &PresetCatalog {
        &self.catalog
    }

    /// One job per preset, in catalog order
    pub fn expand(&self, event: &UploadedImageEvent) -> Result<Vec<ResizeJob>, PresetError> {
        self.catalog
            .iter()
            .map(|preset| {
                Ok(ResizeJob {
                    id: event.id.clone(),
                    uri: event.uri.clone(),
                    target_uri: derive_target_uri(&event.uri, preset)?,
                    width: preset.width(),
                    height: preset.height(),
                })
            })
            .collect()
    }

    pub async fn handle_delivery(&self, delivery: &QueueDelivery) -> FanOutOutcome {
        if self.dead_letter.exceeds_attempts(delivery) {
            return self
                .dead_letter
                .reject(delivery, "attempt ceiling exceeded")
                .await
                .into();
        }

        let event: UploadedImageEvent = match decode_event(delivery) {
            Ok(event) => event,
            Err(e) => return self.dead_letter.reject(delivery, &e.to_string()).await.into(),
        };

        let jobs = match self.expand(&event) {
            Ok(jobs) => jobs,
            Err(e) => return self.dead_letter.reject(delivery, &e.to_string()).await.into(),
        };

        debug!(
            upload_id = %event.id,
            uri = %event.uri,
            jobs = jobs.len(),
            "Fanning out upload"
        );

        let results = join_all(
            jobs.iter()
                .map(|job| self.provider.publish(topics::IMAGE_RESIZE, job)),
        )
        .await;

        let mut failed = 0;
        for (job, result) in jobs.iter().zip(&results) {
            if let Err(e) = result {
                failed += 1;
                error!(
                    upload_id = %job.id,
                    target_uri = %job.target_uri,
                    error = %e,
                    "Resize job publish failed"
                );
            }
        }

        if failed > 0 {
            warn!(
                upload_id = %event.id,
                message_id = %delivery.id(),
                failed,
                total = jobs.len(),
                "Leaving upload for redelivery after partial fan-out"
            );
            return FanOutOutcome::LeftForRedelivery {
                published: jobs.len() - failed,
                failed,
            };
        }

        match delivery.finish().await {
            Ok(()) => {
                info!(
                    upload_id = %event.id,
                    jobs = jobs.len(),
                    "✅ Upload fanned out"
                );
                FanOutOutcome::Completed { jobs: jobs.len() }
            }
            Err(e) => {
                warn!(message_id = %delivery.id(), error = %e, "Finish after fan-out failed");
                FanOutOutcome::AlreadyResolved
            }
        }
    }

    /// Listen for `image-uploaded` on `channel`
    pub fn register(self: Arc<Self>, bus: &EventBus, channel: &str) {
        bus.on(EventType::ImageUploaded, move |delivery| {
            let orchestrator = Arc::clone(&self);
            async move {
                orchestrator.handle_delivery(&delivery).await;
            }
        });
        bus.consume(EventType::ImageUploaded, channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryMessagingService;
    use crate::test_utils::{delivery_for, delivery_with_attempts, AckAction, RecordingAcknowledger};
    use std::time::Duration;

    fn orchestrator(broker: &InMemoryMessagingService, max_attempts: Option<u16>) -> FanOutOrchestrator {
        let provider = Arc::new(MessagingProvider::from(broker.clone()));
        FanOutOrchestrator::new(
            Arc::clone(&provider),
            Arc::new(PresetCatalog::from_pairs(&[[100, 100], [200, 200]]).unwrap()),
            DeadLetterPolicy::new(provider, Duration::from_millis(1000), max_attempts),
        )
    }

    fn upload() -> UploadedImageEvent {
        UploadedImageEvent::new("u1", "https://b.s3.amazonaws.com/u1.png")
    }

    #[tokio::test]
    async fn test_upload_fans_out_one_job_per_preset() {
        let broker = InMemoryMessagingService::new();
        let acker = Arc::new(RecordingAcknowledger::new());
        let delivery = delivery_for("image-uploaded", &upload(), acker.clone()).unwrap();

        let outcome = orchestrator(&broker, None).handle_delivery(&delivery).await;

        assert_eq!(outcome, FanOutOutcome::Completed { jobs: 2 });
        let mut jobs: Vec<ResizeJob> = broker.published_as("image-resize").unwrap();
        jobs.sort_by_key(|job| job.width);
        assert_eq!(
            jobs,
            vec![
                ResizeJob {
                    id: "u1".into(),
                    uri: "https://b.s3.amazonaws.com/u1.png".into(),
                    target_uri: "https://b.s3.amazonaws.com/u1_100x100.png".into(),
                    width: 100,
                    height: 100,
                },
                ResizeJob {
                    id: "u1".into(),
                    uri: "https://b.s3.amazonaws.com/u1.png".into(),
                    target_uri: "https://b.s3.amazonaws.com/u1_200x200.png".into(),
                    width: 200,
                    height: 200,
                },
            ]
        );
        assert!(matches!(acker.actions().as_slice(), [AckAction::Finished(_)]));
    }

    #[tokio::test]
    async fn test_partial_publish_failure_leaves_source_untouched() {
        let broker = InMemoryMessagingService::new();
        broker.inject_publish_failures("image-resize", 1);
        let acker = Arc::new(RecordingAcknowledger::new());
        let delivery = delivery_for("image-uploaded", &upload(), acker.clone()).unwrap();

        let outcome = orchestrator(&broker, None).handle_delivery(&delivery).await;

        assert_eq!(
            outcome,
            FanOutOutcome::LeftForRedelivery { published: 1, failed: 1 }
        );
        assert!(acker.actions().is_empty());
        assert!(!delivery.is_resolved());
    }

    #[tokio::test]
    async fn test_malformed_upload_is_dead_lettered() {
        let broker = InMemoryMessagingService::new();
        let acker = Arc::new(RecordingAcknowledger::new());
        let delivery = delivery_with_attempts("image-uploaded", b"not json", 1, acker.clone());

        let outcome = orchestrator(&broker, None).handle_delivery(&delivery).await;

        assert_eq!(outcome, FanOutOutcome::DeadLettered);
        assert_eq!(
            broker.published("image-uploaded.dead-letter"),
            vec![b"not json".to_vec()]
        );
        assert!(broker.published("image-resize").is_empty());
        assert!(matches!(acker.actions().as_slice(), [AckAction::Finished(_)]));
    }

    #[tokio::test]
    async fn test_upload_without_file_name_is_dead_lettered() {
        let broker = InMemoryMessagingService::new();
        let acker = Arc::new(RecordingAcknowledger::new());
        let event = UploadedImageEvent::new("u2", "https://b.s3.amazonaws.com/");
        let delivery = delivery_for("image-uploaded", &event, acker.clone()).unwrap();

        let outcome = orchestrator(&broker, None).handle_delivery(&delivery).await;

        assert_eq!(outcome, FanOutOutcome::DeadLettered);
        assert!(broker.published("image-resize").is_empty());
    }

    #[tokio::test]
    async fn test_attempt_ceiling_dead_letters_before_publishing() {
        let broker = InMemoryMessagingService::new();
        let acker = Arc::new(RecordingAcknowledger::new());
        let body = serde_json::to_vec(&upload()).unwrap();
        let delivery = delivery_with_attempts("image-uploaded", &body, 4, acker.clone());

        let outcome = orchestrator(&broker, Some(3)).handle_delivery(&delivery).await;

        assert_eq!(outcome, FanOutOutcome::DeadLettered);
        assert!(broker.published("image-resize").is_empty());
        assert_eq!(broker.published("image-uploaded.dead-letter"), vec![body]);
    }

    #[test]
    fn test_expand_follows_catalog_order() {
        let broker = InMemoryMessagingService::new();
        let jobs = orchestrator(&broker, None).expand(&upload()).unwrap();
        let sizes: Vec<(u32, u32)> = jobs.iter().map(|j| (j.width, j.height)).collect();
        assert_eq!(sizes, vec![(100, 100), (200, 200)]);
    }
}
