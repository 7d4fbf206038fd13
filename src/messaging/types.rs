//! Core queue client types: message ids, deliveries and subscriptions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use super::errors::{MessagingError, MessagingResult};
use super::traits::QueueMessage;

/// Broker-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Terminal state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Finished,
    Requeued,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Finished => write!(f, "finished"),
            Self::Requeued => write!(f, "requeued"),
        }
    }
}

/// Provider side of `finish`/`requeue`
#[async_trait]
pub trait Acknowledger: Send + Sync + fmt::Debug {
    async fn finish(&self, id: &MessageId) -> MessagingResult<()>;

    async fn requeue(&self, id: &MessageId, delay: Duration) -> MessagingResult<()>;
}

/// One delivery of a message to a subscriber.
///
/// Exactly one of [`finish`](Self::finish) or [`requeue`](Self::requeue)
/// takes effect. The state flips before the broker is contacted, so the
/// first caller wins even if its broker round trip is still pending; every
/// later call fails with [`MessagingError::DeliveryAlreadyResolved`].
///
/// A delivery dropped while still pending is redelivered by the broker once
/// its in-flight timeout lapses.
pub struct QueueDelivery {
    id: MessageId,
    topic: String,
    channel: String,
    body: Vec<u8>,
    attempts: u16,
    timestamp: DateTime<Utc>,
    state: Mutex<DeliveryState>,
    acknowledger: Arc<dyn Acknowledger>,
}

impl QueueDelivery {
    pub fn new(
        id: MessageId,
        topic: impl Into<String>,
        channel: impl Into<String>,
        body: Vec<u8>,
        attempts: u16,
        timestamp: DateTime<Utc>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            channel: channel.into(),
            body,
            attempts,
            timestamp,
            state: Mutex::new(DeliveryState::Pending),
            acknowledger,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 1-based delivery count
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn state(&self) -> DeliveryState {
        *self.state.lock()
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != DeliveryState::Pending
    }

    /// Decode the body; failures are reported as malformed payloads
    pub fn decode<T: QueueMessage>(&self) -> MessagingResult<T> {
        T::from_bytes(&self.body)
            .map_err(|e| MessagingError::malformed_payload(&self.topic, e.to_string()))
    }

    pub async fn finish(&self) -> MessagingResult<()> {
        self.transition(DeliveryState::Finished)?;
        self.acknowledger.finish(&self.id).await
    }

    pub async fn requeue(&self, delay: Duration) -> MessagingResult<()> {
        self.transition(DeliveryState::Requeued)?;
        self.acknowledger.requeue(&self.id, delay).await
    }

    fn transition(&self, next: DeliveryState) -> MessagingResult<()> {
        let mut state = self.state.lock();
        if *state != DeliveryState::Pending {
            return Err(MessagingError::already_resolved(
                self.id.as_str(),
                state.to_string(),
            ));
        }
        *state = next;
        Ok(())
    }
}

impl fmt::Debug for QueueDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDelivery")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for QueueDelivery {
    fn drop(&mut self) {
        if *self.state.get_mut() == DeliveryState::Pending {
            warn!(
                message_id = %self.id,
                topic = %self.topic,
                channel = %self.channel,
                "Delivery dropped unresolved; left for broker redelivery"
            );
        }
    }
}

/// Stream of deliveries for one topic/channel pair.
///
/// Dropping the subscription stops the provider's reader.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    channel: String,
    receiver: mpsc::Receiver<QueueDelivery>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        receiver: mpsc::Receiver<QueueDelivery>,
    ) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next delivery, or `None` once the provider has shut down
    pub async fn recv(&mut self) -> Option<QueueDelivery> {
        self.receiver.recv().await
    }
}

/// Per-channel counters exposed by providers that track them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub depth: usize,
    pub in_flight: usize,
    pub deferred: usize,
    pub delivered: u64,
    pub finished: u64,
    pub requeued: u64,
    pub timed_out: u64,
}
