//! # Messaging Provider Enum
//!
//! Enum dispatch over the queue client implementations.

use super::errors::MessagingResult;
use super::providers::{InMemoryConfig, InMemoryMessagingService, NsqConfig, NsqMessagingService};
use super::traits::{MessagingService, QueueMessage};
use super::types::Subscription;
use crate::config::{MessagingConfig, ProviderKind};

/// Provider enum for zero-cost dispatch
///
/// `MessagingService` has generic methods, so providers are selected with an
/// enum instead of a trait object.
#[derive(Debug)]
pub enum MessagingProvider {
    /// nsqd over TCP, nsqlookupd for discovery
    Nsq(NsqMessagingService),

    /// In-process broker for tests and local runs
    InMemory(InMemoryMessagingService),
}

impl MessagingProvider {
    pub fn from_config(config: &MessagingConfig) -> MessagingResult<Self> {
        match config.provider {
            ProviderKind::Nsq => Ok(Self::Nsq(NsqMessagingService::new(
                NsqConfig::from_messaging_config(config)?,
            )?)),
            ProviderKind::InMemory => Ok(Self::InMemory(InMemoryMessagingService::with_config(
                InMemoryConfig {
                    msg_timeout: config.msg_timeout(),
                    max_in_flight: config.max_in_flight.max(1) as usize,
                    ..InMemoryConfig::default()
                },
            ))),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Nsq(s) => s.provider_name(),
            Self::InMemory(s) => s.provider_name(),
        }
    }

    pub async fn publish<T: QueueMessage>(&self, topic: &str, message: &T) -> MessagingResult<()> {
        match self {
            Self::Nsq(s) => s.publish(topic, message).await,
            Self::InMemory(s) => s.publish(topic, message).await,
        }
    }

    pub async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> MessagingResult<()> {
        match self {
            Self::Nsq(s) => s.publish_raw(topic, body).await,
            Self::InMemory(s) => s.publish_raw(topic, body).await,
        }
    }

    pub async fn subscribe(&self, topic: &str, channel: &str) -> MessagingResult<Subscription> {
        match self {
            Self::Nsq(s) => s.subscribe(topic, channel).await,
            Self::InMemory(s) => s.subscribe(topic, channel).await,
        }
    }

    pub async fn health_check(&self) -> MessagingResult<bool> {
        match self {
            Self::Nsq(s) => s.health_check().await,
            Self::InMemory(s) => s.health_check().await,
        }
    }

    pub async fn shutdown(&self) -> MessagingResult<()> {
        match self {
            Self::Nsq(s) => s.shutdown().await,
            Self::InMemory(s) => s.shutdown().await,
        }
    }

    /// The in-memory broker, when that is the active provider
    pub fn as_in_memory(&self) -> Option<&InMemoryMessagingService> {
        match self {
            Self::InMemory(s) => Some(s),
            Self::Nsq(_) => None,
        }
    }
}

impl From<InMemoryMessagingService> for MessagingProvider {
    fn from(service: InMemoryMessagingService) -> Self {
        Self::InMemory(service)
    }
}

impl From<NsqMessagingService> for MessagingProvider {
    fn from(service: NsqMessagingService) -> Self {
        Self::Nsq(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_selection_from_config() {
        let mut config = MessagingConfig::default();
        config.provider = ProviderKind::InMemory;
        let provider = MessagingProvider::from_config(&config).unwrap();
        assert_eq!(provider.provider_name(), "in_memory");
        assert!(provider.as_in_memory().is_some());
    }

    #[test]
    fn test_nsq_provider_requires_address() {
        let config = MessagingConfig::default();
        assert!(MessagingProvider::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_nsq_provider_with_address() {
        let mut config = MessagingConfig::default();
        config.nsqd_tcp_address = Some("127.0.0.1:4150".to_string());
        let provider = MessagingProvider::from_config(&config).unwrap();
        assert_eq!(provider.provider_name(), "nsq");
        assert!(provider.as_in_memory().is_none());
    }
}
