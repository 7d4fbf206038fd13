//! NSQ `V2` TCP protocol: command encoding and frame decoding.
//!
//! ```text
//! frame   := [size: u32 BE][frame_type: u32 BE][data: size - 4 bytes]
//! message := [timestamp_ns: i64 BE][attempts: u16 BE][id: 16 bytes][body]
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::types::MessageId;

pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

pub const RESPONSE_OK: &[u8] = b"OK";
pub const RESPONSE_HEARTBEAT: &[u8] = b"_heartbeat_";
pub const RESPONSE_CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const MESSAGE_ID_LEN: usize = 16;
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;
const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Upper bound for a single frame; nsqd's default max message size is 1 MiB
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// `IDENTIFY` body
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyBody {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    /// Milliseconds
    pub heartbeat_interval: u64,
    /// Milliseconds
    pub msg_timeout: u64,
    pub feature_negotiation: bool,
}

impl IdentifyBody {
    pub fn new(client_id: impl Into<String>, heartbeat_interval_ms: u64, msg_timeout_ms: u64) -> Self {
        let client_id = client_id.into();
        Self {
            hostname: client_id.clone(),
            client_id,
            user_agent: format!("rszr/{}", env!("CARGO_PKG_VERSION")),
            heartbeat_interval: heartbeat_interval_ms,
            msg_timeout: msg_timeout_ms,
            feature_negotiation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Identify(IdentifyBody),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Pub { topic: String, body: Vec<u8> },
    Nop,
    Cls,
}

impl Command {
    pub fn encode(&self) -> MessagingResult<Vec<u8>> {
        let bytes = match self {
            Self::Identify(body) => {
                let json = serde_json::to_vec(body)?;
                with_body(b"IDENTIFY\n".to_vec(), &json)
            }
            Self::Sub { topic, channel } => format!("SUB {topic} {channel}\n").into_bytes(),
            Self::Rdy(count) => format!("RDY {count}\n").into_bytes(),
            Self::Fin(id) => format!("FIN {id}\n").into_bytes(),
            Self::Req { id, delay_ms } => format!("REQ {id} {delay_ms}\n").into_bytes(),
            Self::Touch(id) => format!("TOUCH {id}\n").into_bytes(),
            Self::Pub { topic, body } => with_body(format!("PUB {topic}\n").into_bytes(), body),
            Self::Nop => b"NOP\n".to_vec(),
            Self::Cls => b"CLS\n".to_vec(),
        };
        Ok(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify(_) => "IDENTIFY",
            Self::Sub { .. } => "SUB",
            Self::Rdy(_) => "RDY",
            Self::Fin(_) => "FIN",
            Self::Req { .. } => "REQ",
            Self::Touch(_) => "TOUCH",
            Self::Pub { .. } => "PUB",
            Self::Nop => "NOP",
            Self::Cls => "CLS",
        }
    }
}

fn with_body(mut header: Vec<u8>, body: &[u8]) -> Vec<u8> {
    header.reserve(4 + body.len());
    header.extend_from_slice(&(body.len() as u32).to_be_bytes());
    header.extend_from_slice(body);
    header
}

/// A message frame's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    pub timestamp: DateTime<Utc>,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(NsqMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Response(data) if data == RESPONSE_HEARTBEAT)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Response(data) if data == RESPONSE_OK)
    }
}

pub fn decode_frame(frame_type: u32, data: Vec<u8>) -> MessagingResult<Frame> {
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => decode_message(&data).map(Frame::Message),
        other => Err(MessagingError::protocol(format!("unknown frame type {other}"))),
    }
}

pub fn decode_message(data: &[u8]) -> MessagingResult<NsqMessage> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(MessagingError::protocol(format!(
            "message frame of {} bytes is shorter than its {MESSAGE_HEADER_LEN} byte header",
            data.len()
        )));
    }

    let mut timestamp_bytes = [0u8; 8];
    timestamp_bytes.copy_from_slice(&data[0..8]);
    let timestamp_ns = i64::from_be_bytes(timestamp_bytes);
    let attempts = u16::from_be_bytes([data[8], data[9]]);
    let id = String::from_utf8_lossy(&data[10..MESSAGE_HEADER_LEN]).into_owned();

    Ok(NsqMessage {
        timestamp: DateTime::from_timestamp_nanos(timestamp_ns),
        attempts,
        id: MessageId::from(id),
        body: data[MESSAGE_HEADER_LEN..].to_vec(),
    })
}

/// Read one complete frame
pub async fn read_frame<R>(reader: &mut R) -> MessagingResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await?;
    if !(4..=MAX_FRAME_SIZE).contains(&size) {
        return Err(MessagingError::protocol(format!("invalid frame size {size}")));
    }
    let frame_type = reader.read_u32().await?;
    let mut data = vec![0u8; (size - 4) as usize];
    reader.read_exact(&mut data).await?;
    decode_frame(frame_type, data)
}

/// Encode a frame the way nsqd does; used by fake brokers in tests
pub fn encode_frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Encode a message frame payload; used by fake brokers in tests
pub fn encode_message(timestamp_ns: i64, attempts: u16, id: &str, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(MESSAGE_HEADER_LEN + body.len());
    data.extend_from_slice(&timestamp_ns.to_be_bytes());
    data.extend_from_slice(&attempts.to_be_bytes());
    let mut id_bytes = [b'0'; MESSAGE_ID_LEN];
    for (slot, byte) in id_bytes.iter_mut().zip(id.bytes()) {
        *slot = byte;
    }
    data.extend_from_slice(&id_bytes);
    data.extend_from_slice(body);
    data
}

pub fn validate_topic_name(name: &str) -> MessagingResult<()> {
    validate_name("topic", name)
}

pub fn validate_channel_name(name: &str) -> MessagingResult<()> {
    validate_name("channel", name)
}

fn validate_name(kind: &str, name: &str) -> MessagingResult<()> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(MessagingError::invalid_name(
            kind,
            name,
            format!("length must be between 1 and {MAX_NAME_LEN}"),
        ));
    }
    if base.is_empty()
        || !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(MessagingError::invalid_name(
            kind,
            name,
            "only [.a-zA-Z0-9_-] and an optional #ephemeral suffix are allowed",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(
            Command::Sub {
                topic: "image-resize".into(),
                channel: "rszr-dispatcher".into()
            }
            .encode()
            .unwrap(),
            b"SUB image-resize rszr-dispatcher\n"
        );
        assert_eq!(Command::Rdy(10).encode().unwrap(), b"RDY 10\n");
        assert_eq!(
            Command::Req {
                id: MessageId::from("0a0b0c0d0e0f0102"),
                delay_ms: 1000
            }
            .encode()
            .unwrap(),
            b"REQ 0a0b0c0d0e0f0102 1000\n"
        );
        assert_eq!(Command::Nop.encode().unwrap(), b"NOP\n");
    }

    #[test]
    fn test_pub_carries_length_prefixed_body() {
        let encoded = Command::Pub {
            topic: "image-uploaded".into(),
            body: b"{}".to_vec(),
        }
        .encode()
        .unwrap();
        assert_eq!(&encoded[..19], b"PUB image-uploaded\n");
        assert_eq!(&encoded[19..23], &2u32.to_be_bytes());
        assert_eq!(&encoded[23..], b"{}");
    }

    #[test]
    fn test_message_frame_decoding() {
        let data = encode_message(1_700_000_000_000_000_000, 3, "0a0b0c0d0e0f0102", b"payload");
        let frame = decode_frame(FRAME_TYPE_MESSAGE, data).unwrap();
        let Frame::Message(message) = frame else {
            panic!("expected a message frame");
        };
        assert_eq!(message.attempts, 3);
        assert_eq!(message.id.as_str(), "0a0b0c0d0e0f0102");
        assert_eq!(message.body, b"payload");
        assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_truncated_message_is_a_protocol_error() {
        let err = decode_frame(FRAME_TYPE_MESSAGE, vec![0u8; 12]).unwrap_err();
        assert!(matches!(err, MessagingError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let mut bytes = encode_frame(FRAME_TYPE_RESPONSE, RESPONSE_HEARTBEAT);
        bytes.extend(encode_frame(FRAME_TYPE_ERROR, b"E_INVALID"));
        let mut reader = std::io::Cursor::new(bytes);

        assert!(read_frame(&mut reader).await.unwrap().is_heartbeat());
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Error(b"E_INVALID".to_vec())
        );
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_topic_name("image-resize").is_ok());
        assert!(validate_channel_name("rszr-dispatcher#ephemeral").is_ok());
        assert!(validate_topic_name("image-resize.dead-letter").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name(&"x".repeat(65)).is_err());
        assert!(validate_channel_name("#ephemeral").is_err());
    }
}
