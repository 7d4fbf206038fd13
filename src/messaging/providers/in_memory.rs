//! # In-Memory Messaging Service
//!
//! In-process broker with NSQ delivery semantics, for tests and local runs.
//!
//! ## Features
//!
//! - **Topics and channels**: every channel of a topic receives its own copy;
//!   subscribers of one channel share its messages round-robin
//! - **Backlog**: messages published before any channel exists are handed to
//!   the first channel created
//! - **In-flight timeout**: deliveries neither finished nor requeued within
//!   `msg_timeout` are redelivered with `attempts + 1`
//! - **Deferred requeue**: `requeue(delay)` redelivers after `delay`
//! - **Flow control**: at most `max_in_flight` unresolved deliveries per subscriber
//! - **Failure injection**: [`InMemoryMessagingService::inject_publish_failures`]
//! - **Publish log**: the last `published_log_limit` bodies per topic, for inspection

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::nsq::protocol::{validate_channel_name, validate_topic_name};
use crate::constants::defaults;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::traits::{MessagingService, QueueMessage};
use crate::messaging::types::{Acknowledger, ChannelStats, MessageId, QueueDelivery, Subscription};

#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    pub msg_timeout: Duration,
    pub max_in_flight: usize,
    pub published_log_limit: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            msg_timeout: Duration::from_millis(defaults::MSG_TIMEOUT_MS),
            max_in_flight: defaults::MAX_IN_FLIGHT as usize,
            published_log_limit: defaults::PUBLISHED_LOG_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: Vec<u8>,
    attempts: u16,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    subscriber_id: u64,
    generation: u64,
}

#[derive(Debug)]
struct SubscriberSlot {
    id: u64,
    sender: mpsc::Sender<QueueDelivery>,
    in_flight: usize,
}

#[derive(Debug, Default)]
struct ChannelState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<MessageId, InFlight>,
    deferred: usize,
    subscribers: Vec<SubscriberSlot>,
    next_subscriber: usize,
    stats: ChannelStats,
}

impl ChannelState {
    /// Remove an in-flight entry if it still belongs to `generation`
    fn take_in_flight(&mut self, id: &MessageId, generation: u64) -> Option<StoredMessage> {
        match self.in_flight.get(id) {
            Some(entry) if entry.generation == generation => {}
            _ => return None,
        }
        let entry = self.in_flight.remove(id)?;
        if let Some(slot) = self
            .subscribers
            .iter_mut()
            .find(|s| s.id == entry.subscriber_id)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Some(entry.message)
    }
}

#[derive(Debug, Default)]
struct TopicState {
    channels: HashMap<String, ChannelState>,
    backlog: VecDeque<StoredMessage>,
    published: VecDeque<Vec<u8>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    publish_failures: HashMap<String, usize>,
    closed: bool,
}

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    config: InMemoryConfig,
    next_message_id: AtomicU64,
    next_generation: AtomicU64,
    next_subscriber_id: AtomicU64,
}

impl BrokerInner {
    /// Hand ready messages to subscribers with spare in-flight capacity
    fn pump(self: &Arc<Self>, state: &mut BrokerState, topic: &str, channel: &str) {
        let Some(ch) = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.channels.get_mut(channel))
        else {
            return;
        };

        ch.subscribers.retain(|s| !s.sender.is_closed());

        while !ch.ready.is_empty() && !ch.subscribers.is_empty() {
            let count = ch.subscribers.len();
            let start = ch.next_subscriber % count;
            let Some(index) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| ch.subscribers[i].in_flight < self.config.max_in_flight)
            else {
                break;
            };
            ch.next_subscriber = (index + 1) % count;

            let Some(mut message) = ch.ready.pop_front() else {
                break;
            };
            message.attempts = message.attempts.saturating_add(1);
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

            let delivery = QueueDelivery::new(
                message.id.clone(),
                topic,
                channel,
                message.body.clone(),
                message.attempts,
                message.timestamp,
                Arc::new(InMemoryAcknowledger {
                    broker: Arc::downgrade(self),
                    topic: topic.to_string(),
                    channel: channel.to_string(),
                    generation,
                }),
            );

            match ch.subscribers[index].sender.try_send(delivery) {
                Ok(()) => {
                    let slot = &mut ch.subscribers[index];
                    slot.in_flight += 1;
                    ch.stats.delivered += 1;
                    self.arm_timeout(topic, channel, message.id.clone(), generation);
                    ch.in_flight.insert(
                        message.id.clone(),
                        InFlight {
                            message,
                            subscriber_id: slot.id,
                            generation,
                        },
                    );
                }
                Err(TrySendError::Full(_)) => {
                    message.attempts -= 1;
                    ch.ready.push_front(message);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    message.attempts -= 1;
                    ch.ready.push_front(message);
                    ch.subscribers.remove(index);
                    ch.next_subscriber = 0;
                }
            }
        }
    }

    fn pump_topic(self: &Arc<Self>, state: &mut BrokerState, topic: &str) {
        let channels: Vec<String> = state
            .topics
            .get(topic)
            .map(|t| t.channels.keys().cloned().collect())
            .unwrap_or_default();
        for channel in channels {
            self.pump(state, topic, &channel);
        }
    }

    fn arm_timeout(self: &Arc<Self>, topic: &str, channel: &str, id: MessageId, generation: u64) {
        let broker = Arc::downgrade(self);
        let timeout = self.config.msg_timeout;
        let topic = topic.to_string();
        let channel = channel.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(broker) = broker.upgrade() {
                broker.expire(&topic, &channel, &id, generation);
            }
        });
    }

    fn expire(self: &Arc<Self>, topic: &str, channel: &str, id: &MessageId, generation: u64) {
        let mut state = self.state.lock();
        let Some(ch) = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.channels.get_mut(channel))
        else {
            return;
        };
        if let Some(message) = ch.take_in_flight(id, generation) {
            debug!(
                message_id = %id,
                topic = %topic,
                channel = %channel,
                attempts = message.attempts,
                "In-flight timeout elapsed, redelivering"
            );
            ch.stats.timed_out += 1;
            ch.ready.push_back(message);
            self.pump(&mut state, topic, channel);
        }
    }

    fn settle(
        self: &Arc<Self>,
        topic: &str,
        channel: &str,
        id: &MessageId,
        generation: u64,
        requeue_after: Option<Duration>,
    ) -> MessagingResult<()> {
        let mut state = self.state.lock();
        let ch = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.channels.get_mut(channel))
            .ok_or_else(|| MessagingError::acknowledgement(id.as_str(), "unknown channel"))?;

        let message = ch
            .take_in_flight(id, generation)
            .ok_or_else(|| MessagingError::acknowledgement(id.as_str(), "message is not in flight"))?;

        match requeue_after {
            None => ch.stats.finished += 1,
            Some(delay) if delay.is_zero() => {
                ch.stats.requeued += 1;
                ch.ready.push_back(message);
            }
            Some(delay) => {
                ch.stats.requeued += 1;
                ch.deferred += 1;
                let broker = Arc::downgrade(self);
                let topic = topic.to_string();
                let channel = channel.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(broker) = broker.upgrade() {
                        broker.undefer(&topic, &channel, message);
                    }
                });
            }
        }

        self.pump(&mut state, topic, channel);
        Ok(())
    }

    fn undefer(self: &Arc<Self>, topic: &str, channel: &str, message: StoredMessage) {
        let mut state = self.state.lock();
        if let Some(ch) = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.channels.get_mut(channel))
        {
            ch.deferred = ch.deferred.saturating_sub(1);
            ch.ready.push_back(message);
        }
        self.pump(&mut state, topic, channel);
    }
}

#[derive(Debug)]
struct InMemoryAcknowledger {
    broker: Weak<BrokerInner>,
    topic: String,
    channel: String,
    generation: u64,
}

impl InMemoryAcknowledger {
    fn broker(&self) -> MessagingResult<Arc<BrokerInner>> {
        self.broker
            .upgrade()
            .ok_or_else(|| MessagingError::shutdown("in_memory"))
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn finish(&self, id: &MessageId) -> MessagingResult<()> {
        self.broker()?
            .settle(&self.topic, &self.channel, id, self.generation, None)
    }

    async fn requeue(&self, id: &MessageId, delay: Duration) -> MessagingResult<()> {
        self.broker()?
            .settle(&self.topic, &self.channel, id, self.generation, Some(delay))
    }
}

/// In-memory broker
///
/// Cloning shares the broker, so a test can keep a handle for inspection
/// while the bus owns another.
#[derive(Debug, Clone)]
pub struct InMemoryMessagingService {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryMessagingService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessagingService {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                config,
                next_message_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fail the next `count` publishes to `topic`
    pub fn inject_publish_failures(&self, topic: &str, count: usize) {
        self.inner
            .state
            .lock()
            .publish_failures
            .insert(topic.to_string(), count);
    }

    /// Bodies successfully published to `topic`, oldest first, capped at
    /// `published_log_limit`
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.published.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Decode every body published to `topic`
    pub fn published_as<T: QueueMessage>(&self, topic: &str) -> MessagingResult<Vec<T>> {
        self.published(topic)
            .iter()
            .map(|body| T::from_bytes(body))
            .collect()
    }

    pub fn channel_stats(&self, topic: &str, channel: &str) -> Option<ChannelStats> {
        let state = self.inner.state.lock();
        let ch = state.topics.get(topic)?.channels.get(channel)?;
        Some(ChannelStats {
            depth: ch.ready.len(),
            in_flight: ch.in_flight.len(),
            deferred: ch.deferred,
            ..ch.stats.clone()
        })
    }
}

#[async_trait]
impl MessagingService for InMemoryMessagingService {
    async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> MessagingResult<()> {
        validate_topic_name(topic)?;

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(MessagingError::shutdown("in_memory"));
        }

        if let Some(remaining) = state.publish_failures.get_mut(topic) {
            if *remaining > 0 {
                *remaining -= 1;
                warn!(topic = %topic, "Injected publish failure");
                return Err(MessagingError::publish(topic, "injected failure"));
            }
        }

        let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let message = StoredMessage {
            id: MessageId::from(format!("{id:016x}")),
            body,
            attempts: 0,
            timestamp: Utc::now(),
        };

        let topic_state = state.topics.entry(topic.to_string()).or_default();
        topic_state.published.push_back(message.body.clone());
        while topic_state.published.len() > self.inner.config.published_log_limit {
            topic_state.published.pop_front();
        }
        if topic_state.channels.is_empty() {
            topic_state.backlog.push_back(message);
        } else {
            for ch in topic_state.channels.values_mut() {
                ch.ready.push_back(message.clone());
            }
        }

        self.inner.pump_topic(&mut state, topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, channel: &str) -> MessagingResult<Subscription> {
        validate_topic_name(topic)?;
        validate_channel_name(channel)?;

        let (sender, receiver) = mpsc::channel(self.inner.config.max_in_flight.max(1));
        let subscriber_id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(MessagingError::subscribe(topic, channel, "broker is shut down"));
        }

        let topic_state = state.topics.entry(topic.to_string()).or_default();
        if !topic_state.channels.contains_key(channel) {
            let mut ch = ChannelState::default();
            if topic_state.channels.is_empty() {
                ch.ready.extend(topic_state.backlog.drain(..));
            }
            topic_state.channels.insert(channel.to_string(), ch);
        }
        if let Some(ch) = topic_state.channels.get_mut(channel) {
            ch.subscribers.push(SubscriberSlot {
                id: subscriber_id,
                sender,
                in_flight: 0,
            });
        }

        self.inner.pump(&mut state, topic, channel);
        debug!(topic = %topic, channel = %channel, subscriber_id, "In-memory subscription opened");

        Ok(Subscription::new(topic, channel, receiver))
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        Ok(!self.inner.state.lock().closed)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }

    async fn shutdown(&self) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for topic in state.topics.values_mut() {
            for ch in topic.channels.values_mut() {
                ch.subscribers.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::types::DeliveryState;

    const TOPIC: &str = "image-resize";
    const CHANNEL: &str = "rszr-dispatcher";

    fn broker(msg_timeout_ms: u64, max_in_flight: usize) -> InMemoryMessagingService {
        InMemoryMessagingService::with_config(InMemoryConfig {
            msg_timeout: Duration::from_millis(msg_timeout_ms),
            max_in_flight,
            ..InMemoryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_backlog_is_delivered_to_first_channel() {
        let broker = broker(60_000, 10);
        broker.publish_raw(TOPIC, b"one".to_vec()).await.unwrap();

        let mut sub = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        let delivery = sub.recv().await.unwrap();

        assert_eq!(delivery.body(), b"one");
        assert_eq!(delivery.attempts(), 1);
        delivery.finish().await.unwrap();

        let stats = broker.channel_stats(TOPIC, CHANNEL).unwrap();
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.depth, 0);
    }

    #[tokio::test]
    async fn test_every_channel_receives_a_copy() {
        let broker = broker(60_000, 10);
        let mut a = broker.subscribe(TOPIC, "a").await.unwrap();
        let mut b = broker.subscribe(TOPIC, "b").await.unwrap();

        broker.publish_raw(TOPIC, b"x".to_vec()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().body(), b"x");
        assert_eq!(b.recv().await.unwrap().body(), b"x");
    }

    #[tokio::test]
    async fn test_subscribers_of_one_channel_share_messages() {
        let broker = broker(60_000, 10);
        let mut first = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        let mut second = broker.subscribe(TOPIC, CHANNEL).await.unwrap();

        broker.publish_raw(TOPIC, b"1".to_vec()).await.unwrap();
        broker.publish_raw(TOPIC, b"2".to_vec()).await.unwrap();

        let x = first.recv().await.unwrap();
        let y = second.recv().await.unwrap();
        let mut bodies = vec![x.body().to_vec(), y.body().to_vec()];
        bodies.sort();
        assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_redelivers_after_delay() {
        let broker = broker(60_000, 10);
        let mut sub = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        broker.publish_raw(TOPIC, b"job".to_vec()).await.unwrap();

        let first = sub.recv().await.unwrap();
        let requeued_at = tokio::time::Instant::now();
        first.requeue(Duration::from_millis(1000)).await.unwrap();
        assert_eq!(first.state(), DeliveryState::Requeued);

        let second = sub.recv().await.unwrap();
        assert!(requeued_at.elapsed() >= Duration::from_millis(1000));
        assert_eq!(second.id(), first.id());
        assert_eq!(second.attempts(), 2);

        let stats = broker.channel_stats(TOPIC, CHANNEL).unwrap();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_delivery_times_out_and_stale_finish_fails() {
        let broker = broker(5_000, 10);
        let mut sub = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        broker.publish_raw(TOPIC, b"job".to_vec()).await.unwrap();

        let stale = sub.recv().await.unwrap();
        let redelivered = sub.recv().await.unwrap();
        assert_eq!(redelivered.attempts(), 2);

        assert!(matches!(
            stale.finish().await,
            Err(MessagingError::Acknowledgement { .. })
        ));
        redelivered.finish().await.unwrap();

        let stats = broker.channel_stats(TOPIC, CHANNEL).unwrap();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_in_flight_limits_outstanding_deliveries() {
        let broker = broker(60_000, 1);
        let mut sub = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        broker.publish_raw(TOPIC, b"1".to_vec()).await.unwrap();
        broker.publish_raw(TOPIC, b"2".to_vec()).await.unwrap();

        let first = sub.recv().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(blocked.is_err());

        first.finish().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(second.body(), b"2");
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = broker(60_000, 10);
        broker.inject_publish_failures(TOPIC, 1);

        assert!(broker.publish_raw(TOPIC, b"a".to_vec()).await.is_err());
        assert!(broker.publish_raw(TOPIC, b"b".to_vec()).await.is_ok());
        assert_eq!(broker.published(TOPIC), vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_publish_log_keeps_most_recent_bodies() {
        let broker = InMemoryMessagingService::with_config(InMemoryConfig {
            published_log_limit: 2,
            ..InMemoryConfig::default()
        });
        for body in [b"a", b"b", b"c"] {
            broker.publish_raw(TOPIC, body.to_vec()).await.unwrap();
        }
        assert_eq!(broker.published(TOPIC), vec![b"b".to_vec(), b"c".to_vec()]);

        // the log is only for inspection; delivery is unaffected
        let mut sub = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        for expected in [b"a", b"b", b"c"] {
            assert_eq!(sub.recv().await.unwrap().body(), expected);
        }
    }

    #[tokio::test]
    async fn test_invalid_topic_is_rejected() {
        let broker = broker(60_000, 10);
        let err = broker.publish_raw("bad topic!", b"a".to_vec()).await.unwrap_err();
        assert!(matches!(err, MessagingError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let broker = broker(60_000, 10);
        let mut sub = broker.subscribe(TOPIC, CHANNEL).await.unwrap();
        broker.shutdown().await.unwrap();

        assert!(sub.recv().await.is_none());
        assert!(!broker.health_check().await.unwrap());
        assert!(broker.publish_raw(TOPIC, b"a".to_vec()).await.is_err());
    }
}
