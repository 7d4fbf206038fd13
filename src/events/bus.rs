//! # Event Bus
//!
//! Explicitly owned façade over one writer and any number of readers.
//!
//! The bus composes three things: the [`MessagingProvider`] used for
//! publishing, a registry of in-process listeners keyed by [`EventType`], and
//! the typed `emit_*` methods. Readers are declared with [`EventBus::consume`]
//! and opened by [`EventBus::start`]; each delivery is re-emitted to every
//! listener registered for its event type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{EventType, ResizeJob, UploadedImageEvent};
use crate::messaging::{
    MessagingError, MessagingProvider, MessagingResult, QueueDelivery, QueueMessage, Subscription,
};

/// In-process listener for re-emitted deliveries
pub type EventHandler = Arc<dyn Fn(Arc<QueueDelivery>) -> BoxFuture<'static, ()> + Send + Sync>;

type ListenerRegistry = Arc<RwLock<HashMap<EventType, Vec<EventHandler>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConsumerSpec {
    event_type: EventType,
    channel: String,
}

pub struct EventBus {
    provider: Arc<MessagingProvider>,
    requeue_delay: Duration,
    listeners: ListenerRegistry,
    consumers: Mutex<Vec<ConsumerSpec>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("provider", &self.provider.provider_name())
            .field("requeue_delay", &self.requeue_delay)
            .field("consumers", &*self.consumers.lock())
            .field("readers", &self.readers.lock().len())
            .finish()
    }
}

impl EventBus {
    /// `requeue_delay` applies to deliveries nobody listens for
    pub fn new(provider: Arc<MessagingProvider>, requeue_delay: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            provider,
            requeue_delay,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            consumers: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn provider(&self) -> &Arc<MessagingProvider> {
        &self.provider
    }

    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }

    pub async fn emit_image_uploaded(&self, event: &UploadedImageEvent) -> MessagingResult<()> {
        self.emit(EventType::ImageUploaded, event).await
    }

    pub async fn emit_image_resize(&self, job: &ResizeJob) -> MessagingResult<()> {
        self.emit(EventType::ImageResize, job).await
    }

    pub async fn emit<T: QueueMessage>(&self, event_type: EventType, payload: &T) -> MessagingResult<()> {
        let result = self.provider.publish(event_type.topic(), payload).await;
        match &result {
            Ok(()) => debug!(event_type = %event_type, "Event emitted"),
            Err(e) => warn!(event_type = %event_type, error = %e, "Event emit failed"),
        }
        result
    }

    /// Register a listener for `event_type`
    pub fn on<F, Fut>(&self, event_type: EventType, handler: F)
    where
        F: Fn(Arc<QueueDelivery>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |delivery| handler(delivery).boxed());
        self.listeners
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.listeners
            .read()
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Declare a reader for `event_type` under `channel`; opened by [`EventBus::start`]
    pub fn consume(&self, event_type: EventType, channel: impl Into<String>) {
        let spec = ConsumerSpec {
            event_type,
            channel: channel.into(),
        };
        let mut consumers = self.consumers.lock();
        if !consumers.contains(&spec) {
            consumers.push(spec);
        }
    }

    /// Open every declared reader.
    ///
    /// Fails on the first subscription error; readers opened before it keep
    /// running until [`EventBus::stop`].
    pub async fn start(&self) -> MessagingResult<()> {
        let consumers = self.consumers.lock().clone();
        if consumers.is_empty() {
            info!(provider = self.provider.provider_name(), "Event bus started without readers");
            return Ok(());
        }

        for spec in consumers {
            let subscription = self
                .provider
                .subscribe(spec.event_type.topic(), &spec.channel)
                .await?;
            let handle = tokio::spawn(run_reader(
                spec.event_type,
                subscription,
                Arc::clone(&self.listeners),
                self.requeue_delay,
                self.shutdown_tx.subscribe(),
            ));
            self.readers.lock().push(handle);
            info!(
                event_type = %spec.event_type,
                channel = %spec.channel,
                "📡 Event bus reader started"
            );
        }
        Ok(())
    }

    /// Stop the readers but keep the provider open.
    ///
    /// Deliveries already handed to listeners can still be finished or
    /// requeued afterwards.
    pub async fn stop_consuming(&self) {
        let _ = self.shutdown_tx.send(());
        let readers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.readers.lock());
        for handle in readers {
            if let Err(e) = handle.await {
                error!(error = %e, "Event bus reader ended abnormally");
            }
        }
        debug!("Event bus readers stopped");
    }

    /// Stop readers and close the provider
    pub async fn stop(&self) -> MessagingResult<()> {
        self.stop_consuming().await;
        self.provider.shutdown().await?;
        info!("Event bus stopped");
        Ok(())
    }
}

async fn run_reader(
    event_type: EventType,
    mut subscription: Subscription,
    listeners: ListenerRegistry,
    requeue_delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            next = subscription.recv() => match next {
                Some(delivery) => dispatch(event_type, delivery, &listeners, requeue_delay).await,
                None => {
                    warn!(
                        event_type = %event_type,
                        channel = %subscription.channel(),
                        "Subscription closed by provider"
                    );
                    break;
                }
            }
        }
    }
    debug!(event_type = %event_type, "Event bus reader exiting");
}

async fn dispatch(
    event_type: EventType,
    delivery: QueueDelivery,
    listeners: &ListenerRegistry,
    requeue_delay: Duration,
) {
    let handlers = listeners
        .read()
        .get(&event_type)
        .cloned()
        .unwrap_or_default();

    if handlers.is_empty() {
        warn!(
            event_type = %event_type,
            message_id = %delivery.id(),
            "No listener registered, requeueing"
        );
        if let Err(e) = delivery.requeue(requeue_delay).await {
            log_ack_failure(&delivery, &e);
        }
        return;
    }

    let delivery = Arc::new(delivery);
    for handler in handlers {
        tokio::spawn(handler(Arc::clone(&delivery)));
    }
}

fn log_ack_failure(delivery: &QueueDelivery, error: &MessagingError) {
    warn!(message_id = %delivery.id(), error = %error, "Acknowledgement failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryMessagingService;
    use tokio::sync::mpsc;

    fn bus_over(broker: &InMemoryMessagingService) -> EventBus {
        EventBus::new(
            Arc::new(MessagingProvider::from(broker.clone())),
            Duration::from_millis(1000),
        )
    }

    #[tokio::test]
    async fn test_emitted_events_reach_listeners() {
        let broker = InMemoryMessagingService::new();
        let bus = bus_over(&broker);
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.on(EventType::ImageUploaded, move |delivery| {
            let tx = tx.clone();
            async move {
                let event: UploadedImageEvent = delivery.decode().unwrap();
                delivery.finish().await.unwrap();
                tx.send(event).unwrap();
            }
        });
        bus.consume(EventType::ImageUploaded, "test");
        bus.start().await.unwrap();

        let event = UploadedImageEvent::new("u1", "https://b.s3.amazonaws.com/u1.png");
        bus.emit_image_uploaded(&event).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);

        bus.stop().await.unwrap();
        let stats = broker.channel_stats("image-uploaded", "test").unwrap();
        assert_eq!(stats.finished, 1);
    }

    #[tokio::test]
    async fn test_every_listener_sees_each_delivery() {
        let broker = InMemoryMessagingService::new();
        let bus = bus_over(&broker);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for name in ["first", "second"] {
            let tx = tx.clone();
            bus.on(EventType::ImageResize, move |delivery| {
                let tx = tx.clone();
                async move {
                    // only one of the two finishes wins
                    let won = delivery.finish().await.is_ok();
                    tx.send((name, won)).unwrap();
                }
            });
        }
        assert_eq!(bus.listener_count(EventType::ImageResize), 2);
        bus.consume(EventType::ImageResize, "test");
        bus.start().await.unwrap();

        bus.emit_image_resize(&ResizeJob {
            id: "u1".into(),
            uri: "https://b.s3.amazonaws.com/u1.png".into(),
            target_uri: "https://b.s3.amazonaws.com/u1_100x100.png".into(),
            width: 100,
            height: 100,
        })
        .await
        .unwrap();

        let mut results = Vec::new();
        for _ in 0..2 {
            let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            results.push(result);
        }
        results.sort();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|(_, won)| *won).count(), 1);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_without_listener_is_requeued() {
        let broker = InMemoryMessagingService::new();
        let bus = bus_over(&broker);
        bus.consume(EventType::ImageUploaded, "orphan");
        bus.start().await.unwrap();

        bus.emit_image_uploaded(&UploadedImageEvent::new("u1", "https://b/u1.png"))
            .await
            .unwrap();

        let requeued = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let stats = broker.channel_stats("image-uploaded", "orphan").unwrap();
                if stats.requeued > 0 {
                    return stats.requeued;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(requeued, 1);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_consuming_keeps_provider_open() {
        let broker = InMemoryMessagingService::new();
        let bus = bus_over(&broker);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.on(EventType::ImageUploaded, move |delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery).unwrap();
            }
        });
        bus.consume(EventType::ImageUploaded, "test");
        bus.start().await.unwrap();

        bus.emit_image_uploaded(&UploadedImageEvent::new("u1", "https://b/u1.png"))
            .await
            .unwrap();
        let held = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        bus.stop_consuming().await;

        // the held delivery can still be resolved, and nothing new is read
        held.requeue(Duration::from_millis(1000)).await.unwrap();
        bus.emit_image_uploaded(&UploadedImageEvent::new("u2", "https://b/u2.png"))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err());
        assert_eq!(broker.channel_stats("image-uploaded", "test").unwrap().requeued, 1);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_emit_failure_is_returned() {
        let broker = InMemoryMessagingService::new();
        broker.inject_publish_failures("image-uploaded", 1);
        let bus = bus_over(&broker);

        let result = bus
            .emit_image_uploaded(&UploadedImageEvent::new("u1", "https://b/u1.png"))
            .await;
        assert!(matches!(result, Err(MessagingError::Publish { .. })));
    }

    #[test]
    fn test_consume_declarations_are_deduplicated() {
        let broker = InMemoryMessagingService::new();
        let bus = bus_over(&broker);
        bus.consume(EventType::ImageResize, "a");
        bus.consume(EventType::ImageResize, "a");
        bus.consume(EventType::ImageResize, "b");
        assert_eq!(bus.consumers.lock().len(), 2);
    }
}
