//! # NSQ Messaging Service
//!
//! Native NSQ client speaking the `V2` TCP protocol.
//!
//! - Publishing goes to one configured nsqd over a single producer connection.
//! - Consuming discovers producers through nsqlookupd when lookupd addresses
//!   are configured, otherwise it connects to the configured nsqd directly.
//! - `finish` maps to `FIN`, `requeue(delay)` to `REQ <id> <delay_ms>`.
//! - nsqd's own `msg_timeout` is the redelivery safety net for deliveries
//!   that are never resolved.

mod connection;
mod lookup;
pub mod protocol;
mod reader;
mod writer;

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use self::lookup::LookupClient;
use self::protocol::{validate_channel_name, validate_topic_name, IdentifyBody};
use self::reader::{spawn_reader, ReaderSettings};
use self::writer::NsqWriter;
use crate::config::MessagingConfig;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::traits::MessagingService;
use crate::messaging::types::Subscription;

pub use self::lookup::parse_producers;

#[derive(Debug, Clone)]
pub struct NsqConfig {
    pub nsqd_tcp_address: String,
    pub lookupd_http_addresses: Vec<String>,
    pub lookupd_poll_interval: Duration,
    pub max_in_flight: u32,
    pub msg_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub client_id: String,
}

impl NsqConfig {
    pub fn from_messaging_config(config: &MessagingConfig) -> MessagingResult<Self> {
        let nsqd_tcp_address = config
            .nsqd_tcp_address
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| MessagingError::connection("nsqd_tcp_address is not configured"))?;

        Ok(Self {
            nsqd_tcp_address,
            lookupd_http_addresses: config.lookupd_http_addresses.clone(),
            lookupd_poll_interval: config.lookupd_poll_interval(),
            max_in_flight: config.max_in_flight.max(1),
            msg_timeout: config.msg_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
            client_id: config.client_id.clone(),
        })
    }

    fn identify(&self) -> IdentifyBody {
        IdentifyBody::new(
            &self.client_id,
            self.heartbeat_interval.as_millis() as u64,
            self.msg_timeout.as_millis() as u64,
        )
    }
}

#[derive(Debug)]
pub struct NsqMessagingService {
    config: NsqConfig,
    writer: NsqWriter,
    lookup: LookupClient,
    shutdown_tx: broadcast::Sender<()>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl NsqMessagingService {
    pub fn new(config: NsqConfig) -> MessagingResult<Self> {
        let writer = NsqWriter::new(&config.nsqd_tcp_address, config.identify());
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            writer,
            lookup: LookupClient::new()?,
            shutdown_tx,
            readers: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &NsqConfig {
        &self.config
    }
}

#[async_trait]
impl MessagingService for NsqMessagingService {
    async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> MessagingResult<()> {
        self.writer.publish(topic, body).await
    }

    async fn subscribe(&self, topic: &str, channel: &str) -> MessagingResult<Subscription> {
        validate_topic_name(topic)?;
        validate_channel_name(channel)?;

        let (sender, receiver) = mpsc::channel(self.config.max_in_flight as usize);
        let settings = ReaderSettings {
            topic: topic.to_string(),
            channel: channel.to_string(),
            nsqd_address: Some(self.config.nsqd_tcp_address.clone()),
            lookupd_addresses: self.config.lookupd_http_addresses.clone(),
            lookupd_poll_interval: self.config.lookupd_poll_interval,
            reconnect_delay: self.config.reconnect_delay,
            max_in_flight: self.config.max_in_flight,
            identify: self.config.identify(),
        };

        let handle = spawn_reader(
            settings,
            self.lookup.clone(),
            sender,
            self.shutdown_tx.subscribe(),
        );
        self.readers.lock().push(handle);

        Ok(Subscription::new(topic, channel, receiver))
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        match self.writer.ensure_connected().await {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!(address = %self.writer.address(), error = %error, "nsqd health check failed");
                Ok(false)
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "nsq"
    }

    async fn shutdown(&self) -> MessagingResult<()> {
        let _ = self.shutdown_tx.send(());
        let readers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.readers.lock());
        for handle in readers {
            if let Err(error) = handle.await {
                warn!(error = %error, "NSQ reader task ended abnormally");
            }
        }
        self.writer.close().await;
        info!(address = %self.config.nsqd_tcp_address, "NSQ messaging service shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::{
        encode_frame, encode_message, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE,
        MAGIC_V2, RESPONSE_HEARTBEAT, RESPONSE_OK,
    };
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn config(address: String) -> NsqConfig {
        NsqConfig {
            nsqd_tcp_address: address,
            lookupd_http_addresses: Vec::new(),
            lookupd_poll_interval: Duration::from_secs(15),
            max_in_flight: 4,
            msg_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(100),
            client_id: "rszr-test".to_string(),
        }
    }

    /// Read magic and IDENTIFY, answer OK
    async fn accept_handshake(stream: &mut BufReader<TcpStream>) {
        let mut magic = [0u8; 4];
        stream.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);

        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        assert_eq!(line, "IDENTIFY\n");
        let len = stream.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await.unwrap();
        let identify: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(identify["client_id"], "rszr-test");

        stream
            .get_mut()
            .write_all(&encode_frame(FRAME_TYPE_RESPONSE, RESPONSE_OK))
            .await
            .unwrap();
    }

    async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_publish_round_trip_against_fake_nsqd() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            accept_handshake(&mut stream).await;

            assert_eq!(read_line(&mut stream).await, "PUB image-uploaded\n");
            let len = stream.read_u32().await.unwrap();
            let mut body = vec![0u8; len as usize];
            stream.read_exact(&mut body).await.unwrap();
            stream
                .get_mut()
                .write_all(&encode_frame(FRAME_TYPE_RESPONSE, RESPONSE_OK))
                .await
                .unwrap();
            body
        });

        let service = NsqMessagingService::new(config(address)).unwrap();
        service
            .publish_raw("image-uploaded", br#"{"id":"u1","uri":"x"}"#.to_vec())
            .await
            .unwrap();

        let body = server.await.unwrap();
        assert_eq!(body, br#"{"id":"u1","uri":"x"}"#);
    }

    /// Read one `PUB` and answer OK
    async fn accept_pub(stream: &mut BufReader<TcpStream>) -> (String, Vec<u8>) {
        let line = read_line(stream).await;
        let len = stream.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await.unwrap();
        stream
            .get_mut()
            .write_all(&encode_frame(FRAME_TYPE_RESPONSE, RESPONSE_OK))
            .await
            .unwrap();
        (line, body)
    }

    #[tokio::test]
    async fn test_idle_producer_answers_heartbeat_and_reconnects_after_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (hung_up, on_hang_up) = oneshot::channel();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            accept_handshake(&mut stream).await;
            let first = accept_pub(&mut stream).await;

            // idle: nothing is being published when the heartbeat arrives
            stream
                .get_mut()
                .write_all(&encode_frame(FRAME_TYPE_RESPONSE, RESPONSE_HEARTBEAT))
                .await
                .unwrap();
            let nop = read_line(&mut stream).await;
            drop(stream);
            hung_up.send(()).unwrap();

            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            accept_handshake(&mut stream).await;
            let second = accept_pub(&mut stream).await;
            (first, nop, second)
        });

        let service = NsqMessagingService::new(config(address)).unwrap();
        service
            .publish_raw("image-resize", b"one".to_vec())
            .await
            .unwrap();
        on_hang_up.await.unwrap();
        service
            .publish_raw("image-resize", b"two".to_vec())
            .await
            .unwrap();

        let (first, nop, second) = server.await.unwrap();
        assert_eq!(first, ("PUB image-resize\n".to_string(), b"one".to_vec()));
        assert_eq!(nop, "NOP\n");
        assert_eq!(second, ("PUB image-resize\n".to_string(), b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_publish_error_frame_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            accept_handshake(&mut stream).await;
            read_line(&mut stream).await;
            let len = stream.read_u32().await.unwrap();
            let mut body = vec![0u8; len as usize];
            stream.read_exact(&mut body).await.unwrap();
            stream
                .get_mut()
                .write_all(&encode_frame(FRAME_TYPE_ERROR, b"E_PUB_FAILED"))
                .await
                .unwrap();
        });

        let service = NsqMessagingService::new(config(address)).unwrap();
        let err = service
            .publish_raw("image-resize", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Publish { .. }));
        assert!(err.to_string().contains("E_PUB_FAILED"));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_and_acknowledges() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            accept_handshake(&mut stream).await;

            assert_eq!(
                read_line(&mut stream).await,
                "SUB image-resize rszr-dispatcher\n"
            );
            stream
                .get_mut()
                .write_all(&encode_frame(FRAME_TYPE_RESPONSE, RESPONSE_OK))
                .await
                .unwrap();
            assert_eq!(read_line(&mut stream).await, "RDY 4\n");

            for (id, body) in [("0000000000000001", b"first"), ("0000000000000002", b"again")] {
                let message = encode_message(0, 1, id, body);
                stream
                    .get_mut()
                    .write_all(&encode_frame(FRAME_TYPE_MESSAGE, &message))
                    .await
                    .unwrap();
            }

            let first = read_line(&mut stream).await;
            let second = read_line(&mut stream).await;
            (first, second)
        });

        let service = NsqMessagingService::new(config(address)).unwrap();
        let mut subscription = service
            .subscribe("image-resize", "rszr-dispatcher")
            .await
            .unwrap();

        let first = subscription.recv().await.unwrap();
        assert_eq!(first.body(), b"first");
        assert_eq!(first.attempts(), 1);
        first.finish().await.unwrap();

        let second = subscription.recv().await.unwrap();
        second.requeue(Duration::from_millis(1000)).await.unwrap();

        let (fin, req) = server.await.unwrap();
        assert_eq!(fin, "FIN 0000000000000001\n");
        assert_eq!(req, "REQ 0000000000000002 1000\n");

        service.shutdown().await.unwrap();
    }
}
