//! Test helpers shared by unit and integration tests.
//!
//! [`RecordingAcknowledger`] stands in for a broker connection so tests can
//! assert exactly which terminal action a component issued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::messaging::{
    Acknowledger, MessageId, MessagingResult, QueueDelivery, QueueMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckAction {
    Finished(MessageId),
    Requeued(MessageId, Duration),
}

impl AckAction {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Finished(id) | Self::Requeued(id, _) => id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    pub fn is_requeued(&self) -> bool {
        matches!(self, Self::Requeued(..))
    }
}

/// Records `finish`/`requeue` calls instead of talking to a broker
#[derive(Debug, Default)]
pub struct RecordingAcknowledger {
    actions: Mutex<Vec<AckAction>>,
    notify: Notify,
}

impl RecordingAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<AckAction> {
        self.actions.lock().clone()
    }

    /// Wait until at least `count` actions were recorded or `within` elapsed
    pub async fn wait_for_actions(&self, count: usize, within: Duration) -> Vec<AckAction> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.notify.notified();
            {
                let actions = self.actions.lock();
                if actions.len() >= count {
                    return actions.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.actions();
            }
        }
    }

    fn record(&self, action: AckAction) {
        self.actions.lock().push(action);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Acknowledger for RecordingAcknowledger {
    async fn finish(&self, id: &MessageId) -> MessagingResult<()> {
        self.record(AckAction::Finished(id.clone()));
        Ok(())
    }

    async fn requeue(&self, id: &MessageId, delay: Duration) -> MessagingResult<()> {
        self.record(AckAction::Requeued(id.clone(), delay));
        Ok(())
    }
}

/// A delivery of `body` on `topic` with a fresh id
pub fn delivery_with_attempts(
    topic: &str,
    body: &[u8],
    attempts: u16,
    acknowledger: Arc<RecordingAcknowledger>,
) -> QueueDelivery {
    QueueDelivery::new(
        MessageId::from(Uuid::new_v4().simple().to_string()),
        topic,
        "test-channel",
        body.to_vec(),
        attempts,
        Utc::now(),
        acknowledger,
    )
}

/// A first-attempt delivery carrying `payload` encoded as JSON
pub fn delivery_for<T: QueueMessage>(
    topic: &str,
    payload: &T,
    acknowledger: Arc<RecordingAcknowledger>,
) -> MessagingResult<QueueDelivery> {
    let body = payload.to_bytes()?;
    Ok(delivery_with_attempts(topic, &body, 1, acknowledger))
}
