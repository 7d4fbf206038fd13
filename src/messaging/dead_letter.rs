//! Dead-letter handling for deliveries that cannot be processed.
//!
//! A rejected delivery's raw body is published to `"{topic}.dead-letter"` and
//! the delivery is finished. If the dead-letter publish fails the delivery is
//! requeued instead, so nothing is lost.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use super::provider::MessagingProvider;
use super::types::QueueDelivery;
use crate::constants::topics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    DeadLettered,
    Requeued,
    /// Another handler resolved the delivery first
    AlreadyResolved,
}

#[derive(Debug, Clone)]
pub struct DeadLetterPolicy {
    provider: Arc<MessagingProvider>,
    requeue_delay: Duration,
    max_attempts: Option<u16>,
}

impl DeadLetterPolicy {
    pub fn new(
        provider: Arc<MessagingProvider>,
        requeue_delay: Duration,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            provider,
            requeue_delay,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> Option<u16> {
        self.max_attempts
    }

    /// Whether the delivery has used up its attempts
    pub fn exceeds_attempts(&self, delivery: &QueueDelivery) -> bool {
        self.max_attempts
            .is_some_and(|max| delivery.attempts() > max)
    }

    pub async fn reject(&self, delivery: &QueueDelivery, reason: &str) -> DeadLetterOutcome {
        let dead_letter_topic = topics::dead_letter(delivery.topic());

        match self
            .provider
            .publish_raw(&dead_letter_topic, delivery.body().to_vec())
            .await
        {
            Ok(()) => {
                warn!(
                    message_id = %delivery.id(),
                    topic = %delivery.topic(),
                    dead_letter_topic = %dead_letter_topic,
                    attempts = delivery.attempts(),
                    reason = %reason,
                    "☠️ Delivery dead-lettered"
                );
                match delivery.finish().await {
                    Ok(()) => DeadLetterOutcome::DeadLettered,
                    Err(e) => {
                        warn!(message_id = %delivery.id(), error = %e, "Finish after dead-lettering failed");
                        DeadLetterOutcome::AlreadyResolved
                    }
                }
            }
            Err(publish_error) => {
                error!(
                    message_id = %delivery.id(),
                    dead_letter_topic = %dead_letter_topic,
                    error = %publish_error,
                    reason = %reason,
                    "Dead-letter publish failed, requeueing instead"
                );
                match delivery.requeue(self.requeue_delay).await {
                    Ok(()) => DeadLetterOutcome::Requeued,
                    Err(e) => {
                        warn!(message_id = %delivery.id(), error = %e, "Requeue after failed dead-letter publish failed");
                        DeadLetterOutcome::AlreadyResolved
                    }
                }
            }
        }
    }
}
