//! Unit transport protocol.
//!
//! Text frames carry an envelope `{"event": "...", "data": ...}`:
//!
//! - dispatcher → unit: `process` with `{content, type, width, height, targetUri}`
//! - unit → dispatcher: `complete` with the base64 result as a bare string

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::ResizeJob;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed unit frame: {message}")]
    MalformedFrame { message: String },

    #[error("Invalid base64 content: {0}")]
    InvalidContent(#[from] base64::DecodeError),

    #[error("Frame encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum UnitMessage {
    Process(ProcessTask),
    Complete(String),
}

impl UnitMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::malformed_frame(e.to_string()))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Process(_) => crate::constants::unit_events::PROCESS,
            Self::Complete(_) => crate::constants::unit_events::COMPLETE,
        }
    }
}

/// Work shipped to a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTask {
    /// Base64 source bytes
    pub content: String,
    #[serde(rename = "type")]
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub target_uri: String,
}

impl ProcessTask {
    pub fn for_job(job: &ResizeJob, source: &[u8]) -> Self {
        Self {
            content: encode_content(source),
            format: format_hint(&job.uri),
            width: job.width,
            height: job.height,
            target_uri: job.target_uri.clone(),
        }
    }
}

/// Extension of the source file name without its dot, empty if there is none
pub fn format_hint(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    match name.rfind('.') {
        Some(dot) if dot > 0 => name[dot + 1..].to_string(),
        _ => String::new(),
    }
}

pub fn encode_content(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_content(content: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(STANDARD.decode(content.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_frame_shape() {
        let job = ResizeJob {
            id: "u1".into(),
            uri: "https://b.s3.amazonaws.com/u1.png".into(),
            target_uri: "https://b.s3.amazonaws.com/u1_100x100.png".into(),
            width: 100,
            height: 80,
        };
        let frame = UnitMessage::Process(ProcessTask::for_job(&job, b"PNG"))
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["event"], "process");
        assert_eq!(value["data"]["content"], "UE5H");
        assert_eq!(value["data"]["type"], "png");
        assert_eq!(value["data"]["width"], 100);
        assert_eq!(value["data"]["height"], 80);
        assert_eq!(
            value["data"]["targetUri"],
            "https://b.s3.amazonaws.com/u1_100x100.png"
        );
    }

    #[test]
    fn test_complete_frame_decodes() {
        let message = UnitMessage::decode(r#"{"event":"complete","data":"UE5H"}"#).unwrap();
        assert_eq!(message, UnitMessage::Complete("UE5H".into()));
        let UnitMessage::Complete(content) = message else {
            unreachable!()
        };
        assert_eq!(decode_content(&content).unwrap(), b"PNG");
    }

    #[test]
    fn test_garbled_frames_are_rejected() {
        assert!(matches!(
            UnitMessage::decode("hello"),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert!(matches!(
            UnitMessage::decode(r#"{"event":"resize","data":{}}"#),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode_content("not base64!"),
            Err(ProtocolError::InvalidContent(_))
        ));
    }

    #[test]
    fn test_format_hint() {
        assert_eq!(format_hint("https://b.s3.amazonaws.com/u1.png"), "png");
        assert_eq!(format_hint("https://b/x/photo.final.JPEG?v=1"), "JPEG");
        assert_eq!(format_hint("https://b/x/raw"), "");
    }
}
