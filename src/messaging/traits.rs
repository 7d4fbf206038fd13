//! Provider-agnostic queue client traits.

use async_trait::async_trait;

use super::errors::{MessagingError, MessagingResult};
use super::types::Subscription;

/// Wire encoding of a queue payload.
///
/// Every serde type gets JSON encoding through the blanket impl below.
pub trait QueueMessage: Send + Sync + Clone + 'static {
    fn to_bytes(&self) -> Result<Vec<u8>, MessagingError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError>
    where
        Self: Sized;
}

impl<T> QueueMessage for T
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + Clone + 'static,
{
    fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(bytes).map_err(|e| MessagingError::serialization(e.to_string()))
    }
}

/// Publish/subscribe broker client.
///
/// Publishing never retries implicitly. Subscriptions survive broker
/// reconnects; deliveries simply resume once the provider is reconnected.
#[async_trait]
pub trait MessagingService: Send + Sync + 'static {
    /// Publish an already encoded body
    async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> MessagingResult<()>;

    /// Encode and publish a typed payload
    async fn publish<T: QueueMessage>(&self, topic: &str, message: &T) -> MessagingResult<()> {
        let body = message.to_bytes()?;
        self.publish_raw(topic, body).await
    }

    /// Start consuming `topic` as a member of `channel`
    async fn subscribe(&self, topic: &str, channel: &str) -> MessagingResult<Subscription>;

    async fn health_check(&self) -> MessagingResult<bool>;

    fn provider_name(&self) -> &'static str;

    /// Stop readers and close broker connections
    async fn shutdown(&self) -> MessagingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
    struct Upload {
        id: String,
        uri: String,
    }

    #[test]
    fn test_json_encoding_uses_field_names() {
        let msg = Upload {
            id: "u1".to_string(),
            uri: "https://b.s3.amazonaws.com/u1.png".to_string(),
        };
        let bytes = msg.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], "u1");
        assert_eq!(Upload::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_invalid_bytes_fail_to_decode() {
        let err = Upload::from_bytes(b"{\"id\": 1").unwrap_err();
        assert!(matches!(err, MessagingError::Serialization { .. }));
    }
}
