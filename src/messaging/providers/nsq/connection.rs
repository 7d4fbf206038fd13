//! A single nsqd TCP connection after the `V2` handshake.

use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::protocol::{read_frame, Command, Frame, IdentifyBody, MAGIC_V2};
use crate::messaging::errors::{MessagingError, MessagingResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct NsqConnection {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl NsqConnection {
    /// Connect, send the protocol magic and `IDENTIFY`
    pub async fn connect(address: &str, identify: &IdentifyBody) -> MessagingResult<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| MessagingError::timeout(format!("connect {address}"), CONNECT_TIMEOUT.as_millis() as u64))?
            .map_err(|e| MessagingError::connection(format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut connection = Self {
            address: address.to_string(),
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        connection.writer.write_all(MAGIC_V2).await?;
        connection
            .send(&Command::Identify(identify.clone()))
            .await?;
        connection.expect_ok("IDENTIFY").await?;

        debug!(address = %address, client_id = %identify.client_id, "Connected to nsqd");
        Ok(connection)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn send(&mut self, command: &Command) -> MessagingResult<()> {
        let bytes = command.encode()?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> MessagingResult<Frame> {
        read_frame(&mut self.reader).await
    }

    /// Wait for `OK`, answering heartbeats on the way
    pub async fn expect_ok(&mut self, command: &str) -> MessagingResult<()> {
        loop {
            match self.read_frame().await? {
                frame if frame.is_ok() => return Ok(()),
                frame if frame.is_heartbeat() => self.send(&Command::Nop).await?,
                Frame::Error(data) => {
                    return Err(MessagingError::protocol(format!(
                        "{command} rejected by {}: {}",
                        self.address,
                        String::from_utf8_lossy(&data)
                    )))
                }
                other => {
                    return Err(MessagingError::protocol(format!(
                        "unexpected reply to {command} from {}: {other:?}",
                        self.address
                    )))
                }
            }
        }
    }

    pub fn into_split(self) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}
