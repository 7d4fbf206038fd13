//! Typed pipeline payloads and their queue-boundary validation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::topics;
use crate::messaging::{MessagingError, MessagingResult, QueueDelivery, QueueMessage};

/// Event types carried over the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ImageUploaded,
    ImageResize,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::ImageUploaded, EventType::ImageResize];

    pub fn topic(&self) -> &'static str {
        match self {
            Self::ImageUploaded => topics::IMAGE_UPLOADED,
            Self::ImageResize => topics::IMAGE_RESIZE,
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.topic() == topic)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// Payload validation beyond what serde already enforces
pub trait EventPayload: QueueMessage {
    fn validate(&self) -> Result<(), String>;
}

/// Decode and validate a delivery's payload.
///
/// Both decode and validation failures are reported as
/// [`MessagingError::MalformedPayload`].
pub fn decode_event<T: EventPayload>(delivery: &QueueDelivery) -> MessagingResult<T> {
    let payload: T = delivery.decode()?;
    payload
        .validate()
        .map_err(|reason| MessagingError::malformed_payload(delivery.topic(), reason))?;
    Ok(payload)
}

/// An upload that landed in object storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImageEvent {
    pub id: String,
    pub uri: String,
}

impl UploadedImageEvent {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
        }
    }
}

impl EventPayload for UploadedImageEvent {
    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id must not be empty".to_string());
        }
        if self.uri.trim().is_empty() {
            return Err("uri must not be empty".to_string());
        }
        Ok(())
    }
}

/// One resize variant of one upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeJob {
    /// Upload id the job was derived from
    pub id: String,
    pub uri: String,
    pub target_uri: String,
    pub width: u32,
    pub height: u32,
}

impl EventPayload for ResizeJob {
    fn validate(&self) -> Result<(), String> {
        if self.uri.trim().is_empty() {
            return Err("uri must not be empty".to_string());
        }
        if self.target_uri.trim().is_empty() {
            return Err("targetUri must not be empty".to_string());
        }
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            ));
        }
        Ok(())
    }
}
