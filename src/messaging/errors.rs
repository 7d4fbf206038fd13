//! # Messaging Error Types
//!
//! Structured errors for the queue client, shared by every provider.

use thiserror::Error;

/// Queue client errors
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Publish to topic {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Subscribe to {topic}/{channel} failed: {message}")]
    Subscribe {
        topic: String,
        channel: String,
        message: String,
    },

    #[error("Invalid {kind} name: {name}: {reason}")]
    InvalidName {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Malformed payload on topic {topic}: {message}")]
    MalformedPayload { topic: String, message: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Delivery {message_id} was already {state}")]
    DeliveryAlreadyResolved { message_id: String, state: String },

    #[error("Acknowledgement of {message_id} failed: {message}")]
    Acknowledgement { message_id: String, message: String },

    #[error("Lookup against {address} failed: {message}")]
    Lookup { address: String, message: String },

    #[error("Network timeout: {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Messaging provider is shut down: {component}")]
    Shutdown { component: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn subscribe(
        topic: impl Into<String>,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn invalid_name(
        kind: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidName {
            kind: kind.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_payload(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn already_resolved(message_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::DeliveryAlreadyResolved {
            message_id: message_id.into(),
            state: state.into(),
        }
    }

    pub fn acknowledgement(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            message_id: message_id.into(),
            message: message.into(),
        }
    }

    pub fn lookup(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lookup {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn shutdown(component: impl Into<String>) -> Self {
        Self::Shutdown {
            component: component.into(),
        }
    }

    /// Connection-level failures that a reconnect may cure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Publish { .. }
        )
    }
}

impl From<std::io::Error> for MessagingError {
    fn from(err: std::io::Error) -> Self {
        Self::connection(err.to_string())
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
