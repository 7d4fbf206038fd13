//! Consumer side of the NSQ client.
//!
//! A supervisor task per subscription discovers producers (nsqlookupd, or the
//! configured nsqd directly), keeps one consumer connection per producer and
//! re-establishes connections that drop. Each consumer connection splits into
//! a read loop that turns message frames into [`QueueDelivery`] values and a
//! write loop that serializes `FIN`/`REQ`/`NOP` commands onto the socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::NsqConnection;
use super::lookup::LookupClient;
use super::protocol::{read_frame, Command, Frame, IdentifyBody, RESPONSE_CLOSE_WAIT};
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::types::{Acknowledger, MessageId, QueueDelivery};

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub topic: String,
    pub channel: String,
    pub nsqd_address: Option<String>,
    pub lookupd_addresses: Vec<String>,
    pub lookupd_poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_in_flight: u32,
    pub identify: IdentifyBody,
}

/// `FIN`/`REQ` for deliveries of one consumer connection
#[derive(Debug)]
struct NsqAcknowledger {
    address: String,
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl Acknowledger for NsqAcknowledger {
    async fn finish(&self, id: &MessageId) -> MessagingResult<()> {
        self.commands
            .send(Command::Fin(id.clone()))
            .map_err(|_| MessagingError::acknowledgement(id.as_str(), format!("connection to {} closed", self.address)))
    }

    async fn requeue(&self, id: &MessageId, delay: Duration) -> MessagingResult<()> {
        self.commands
            .send(Command::Req {
                id: id.clone(),
                delay_ms: delay.as_millis() as u64,
            })
            .map_err(|_| MessagingError::acknowledgement(id.as_str(), format!("connection to {} closed", self.address)))
    }
}

/// Spawn the supervisor for one subscription
pub fn spawn_reader(
    settings: ReaderSettings,
    lookup: LookupClient,
    deliveries: mpsc::Sender<QueueDelivery>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut consumers: HashMap<String, JoinHandle<()>> = HashMap::new();
        let poll_interval = if settings.lookupd_addresses.is_empty() {
            settings.reconnect_delay
        } else {
            settings.lookupd_poll_interval
        };

        info!(
            topic = %settings.topic,
            channel = %settings.channel,
            lookupd = ?settings.lookupd_addresses,
            "📥 NSQ reader started"
        );

        loop {
            consumers.retain(|_, handle| !handle.is_finished());

            for address in discover(&settings, &lookup).await {
                if consumers.contains_key(&address) {
                    continue;
                }
                let handle = tokio::spawn(run_consumer(
                    address.clone(),
                    settings.clone(),
                    deliveries.clone(),
                ));
                consumers.insert(address, handle);
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = deliveries.closed() => {
                    debug!(topic = %settings.topic, "Subscription dropped, stopping reader");
                    break;
                }
                _ = shutdown.recv() => {
                    debug!(topic = %settings.topic, "Shutdown signal received, stopping reader");
                    break;
                }
            }
        }

        for (_, handle) in consumers {
            handle.abort();
        }
    })
}

async fn discover(settings: &ReaderSettings, lookup: &LookupClient) -> Vec<String> {
    if settings.lookupd_addresses.is_empty() {
        return settings.nsqd_address.iter().cloned().collect();
    }

    let mut addresses = Vec::new();
    for lookupd in &settings.lookupd_addresses {
        match lookup.producers(lookupd, &settings.topic).await {
            Ok(found) => addresses.extend(found),
            Err(error) => warn!(
                lookupd = %lookupd,
                topic = %settings.topic,
                error = %error,
                "Producer discovery failed"
            ),
        }
    }
    addresses.sort();
    addresses.dedup();
    addresses
}

async fn run_consumer(
    address: String,
    settings: ReaderSettings,
    deliveries: mpsc::Sender<QueueDelivery>,
) {
    match consume(&address, &settings, &deliveries).await {
        Ok(()) => debug!(address = %address, topic = %settings.topic, "Consumer connection closed"),
        Err(error) => warn!(
            address = %address,
            topic = %settings.topic,
            channel = %settings.channel,
            error = %error,
            "Consumer connection lost"
        ),
    }
}

async fn consume(
    address: &str,
    settings: &ReaderSettings,
    deliveries: &mpsc::Sender<QueueDelivery>,
) -> MessagingResult<()> {
    let mut connection = NsqConnection::connect(address, &settings.identify).await?;
    connection
        .send(&Command::Sub {
            topic: settings.topic.clone(),
            channel: settings.channel.clone(),
        })
        .await?;
    connection.expect_ok("SUB").await.map_err(|e| {
        MessagingError::subscribe(&settings.topic, &settings.channel, e.to_string())
    })?;
    connection.send(&Command::Rdy(settings.max_in_flight)).await?;

    info!(
        address = %address,
        topic = %settings.topic,
        channel = %settings.channel,
        max_in_flight = settings.max_in_flight,
        "Subscribed to nsqd"
    );

    let (reader, writer) = connection.into_split();
    let (commands, command_rx) = mpsc::unbounded_channel();
    let write_loop = tokio::spawn(write_commands(address.to_string(), writer, command_rx));

    let acknowledger: Arc<dyn Acknowledger> = Arc::new(NsqAcknowledger {
        address: address.to_string(),
        commands: commands.clone(),
    });

    let result = read_messages(reader, settings, deliveries, &commands, acknowledger).await;
    write_loop.abort();
    result
}

async fn read_messages(
    mut reader: BufReader<OwnedReadHalf>,
    settings: &ReaderSettings,
    deliveries: &mpsc::Sender<QueueDelivery>,
    commands: &mpsc::UnboundedSender<Command>,
    acknowledger: Arc<dyn Acknowledger>,
) -> MessagingResult<()> {
    loop {
        match read_frame(&mut reader).await? {
            frame if frame.is_heartbeat() => {
                if commands.send(Command::Nop).is_err() {
                    return Err(MessagingError::connection("command writer stopped"));
                }
            }
            Frame::Response(data) if data == RESPONSE_CLOSE_WAIT => return Ok(()),
            Frame::Response(data) => {
                debug!(response = %String::from_utf8_lossy(&data), "nsqd response");
            }
            Frame::Error(data) => {
                // E_FIN_FAILED and friends leave the connection usable
                warn!(
                    topic = %settings.topic,
                    error = %String::from_utf8_lossy(&data),
                    "nsqd reported an error"
                );
            }
            Frame::Message(message) => {
                let delivery = QueueDelivery::new(
                    message.id,
                    &settings.topic,
                    &settings.channel,
                    message.body,
                    message.attempts,
                    message.timestamp,
                    acknowledger.clone(),
                );
                if deliveries.send(delivery).await.is_err() {
                    let _ = commands.send(Command::Cls);
                    return Ok(());
                }
            }
        }
    }
}

pub(super) async fn write_commands(
    address: String,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(command = command.name(), error = %error, "Failed to encode command");
                continue;
            }
        };
        if let Err(error) = writer.write_all(&bytes).await {
            warn!(address = %address, command = command.name(), error = %error, "Write to nsqd failed");
            break;
        }
    }
}
