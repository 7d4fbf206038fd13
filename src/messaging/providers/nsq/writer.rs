//! Producer side: `PUB` over one lazily (re)connected nsqd connection.
//!
//! The connection is split like a consumer connection. A read loop answers
//! `_heartbeat_` with `NOP` even while nothing is being published and passes
//! every other frame back as a reply; a write loop serializes `PUB` and `NOP`.

use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::NsqConnection;
use super::protocol::{read_frame, validate_topic_name, Command, Frame, IdentifyBody};
use super::reader::write_commands;
use crate::messaging::errors::{MessagingError, MessagingResult};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ProducerConnection {
    commands: mpsc::UnboundedSender<Command>,
    replies: mpsc::UnboundedReceiver<Frame>,
    read_loop: JoinHandle<()>,
    write_loop: JoinHandle<()>,
}

impl ProducerConnection {
    async fn open(address: &str, identify: &IdentifyBody) -> MessagingResult<Self> {
        let connection = NsqConnection::connect(address, identify).await?;
        let (reader, writer) = connection.into_split();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::unbounded_channel();

        let write_loop = tokio::spawn(write_commands(address.to_string(), writer, command_rx));
        let read_loop = tokio::spawn(read_replies(
            address.to_string(),
            reader,
            commands.clone(),
            reply_tx,
        ));

        Ok(Self {
            commands,
            replies,
            read_loop,
            write_loop,
        })
    }

    /// nsqd hung up, or a socket write failed
    fn is_closed(&self) -> bool {
        self.read_loop.is_finished() || self.write_loop.is_finished()
    }

    /// Send one command and wait for its reply.
    ///
    /// A connection that closes before replying yields `Connection`.
    async fn request(&mut self, command: Command) -> MessagingResult<()> {
        let name = command.name();
        self.commands
            .send(command)
            .map_err(|_| MessagingError::connection("producer connection closed"))?;

        let reply = tokio::time::timeout(REPLY_TIMEOUT, self.replies.recv())
            .await
            .map_err(|_| MessagingError::timeout(name, REPLY_TIMEOUT.as_millis() as u64))?;
        match reply {
            Some(frame) if frame.is_ok() => Ok(()),
            Some(Frame::Error(data)) => Err(MessagingError::protocol(
                String::from_utf8_lossy(&data).into_owned(),
            )),
            Some(other) => Err(MessagingError::protocol(format!(
                "unexpected reply to {name}: {other:?}"
            ))),
            None => Err(MessagingError::connection(format!(
                "producer connection closed before {name} was acknowledged"
            ))),
        }
    }
}

impl Drop for ProducerConnection {
    fn drop(&mut self) {
        self.read_loop.abort();
        self.write_loop.abort();
    }
}

async fn read_replies(
    address: String,
    mut reader: BufReader<OwnedReadHalf>,
    commands: mpsc::UnboundedSender<Command>,
    replies: mpsc::UnboundedSender<Frame>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) if frame.is_heartbeat() => {
                if commands.send(Command::Nop).is_err() {
                    break;
                }
            }
            Ok(frame) => {
                if replies.send(frame).is_err() {
                    break;
                }
            }
            Err(error) => {
                debug!(address = %address, error = %error, "Producer connection closed");
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct NsqWriter {
    address: String,
    identify: IdentifyBody,
    connection: Mutex<Option<ProducerConnection>>,
}

impl NsqWriter {
    pub fn new(address: impl Into<String>, identify: IdentifyBody) -> Self {
        Self {
            address: address.into(),
            identify,
            connection: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Publish one message and wait for nsqd's `OK`.
    ///
    /// A reused connection that turns out to be dead is replaced and the
    /// publish retried once. Any other failure drops the connection so the
    /// next publish reconnects.
    pub async fn publish(&self, topic: &str, body: Vec<u8>) -> MessagingResult<()> {
        validate_topic_name(topic)?;

        let mut guard = self.connection.lock().await;
        let reused = matches!(guard.as_ref(), Some(connection) if !connection.is_closed());

        let mut result = self.publish_on(&mut guard, topic, &body).await;
        if reused && matches!(result, Err(MessagingError::Connection { .. })) {
            debug!(topic = %topic, address = %self.address, "Stale producer connection, reconnecting");
            result = self.publish_on(&mut guard, topic, &body).await;
        }

        if let Err(error) = &result {
            warn!(
                topic = %topic,
                address = %self.address,
                error = %error,
                "Publish failed, resetting producer connection"
            );
            *guard = None;
        }
        result.map_err(|e| match e {
            MessagingError::Publish { .. } => e,
            other => MessagingError::publish(topic, other.to_string()),
        })
    }

    async fn publish_on(
        &self,
        slot: &mut Option<ProducerConnection>,
        topic: &str,
        body: &[u8],
    ) -> MessagingResult<()> {
        if slot.as_ref().map_or(true, ProducerConnection::is_closed) {
            *slot = None;
            *slot = Some(ProducerConnection::open(&self.address, &self.identify).await?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(MessagingError::publish(topic, "producer connection unavailable"));
        };

        let result = connection
            .request(Command::Pub {
                topic: topic.to_string(),
                body: body.to_vec(),
            })
            .await;
        if matches!(result, Err(MessagingError::Connection { .. })) {
            *slot = None;
        }
        result
    }

    /// Connect if needed; used by health checks
    pub async fn ensure_connected(&self) -> MessagingResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().map_or(true, ProducerConnection::is_closed) {
            *guard = None;
            *guard = Some(ProducerConnection::open(&self.address, &self.identify).await?);
        }
        Ok(())
    }

    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            if connection.commands.send(Command::Cls).is_err() {
                debug!(address = %self.address, "Producer connection already closed");
                return;
            }
            // CLOSE_WAIT, or nothing if nsqd drops the socket first
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, connection.replies.recv()).await;
        }
    }
}
