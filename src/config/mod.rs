//! # Configuration
//!
//! Typed configuration for both process roles, loaded by [`ConfigLoader`]
//! from built-in defaults, an optional TOML file, `RSZR_*` environment
//! variables and the legacy deployment variables (`NSQD_ADDRESS`,
//! `NSQD_PORT`, `NSQLOOKUPD_ADDRESSES`, `S3_BUCKET`, `S3_REGION`).
//!
//! Durations are stored as milliseconds and exposed through
//! [`std::time::Duration`] accessors.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{channels, defaults};
use crate::orchestration::{PresetCatalog, PresetError};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// The process a configuration is validated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    FanOut,
    Dispatcher,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RszrConfig {
    pub environment: String,
    pub messaging: MessagingConfig,
    pub channels: ChannelsConfig,
    pub storage: StorageConfig,
    pub dispatcher: DispatcherSettings,
    pub fan_out: FanOutSettings,
    pub retry: RetryConfig,
    /// Ordered `[width, height]` pairs
    pub presets: Vec<[u32; 2]>,
    pub logging: LoggingConfig,
}

impl Default for RszrConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            messaging: MessagingConfig::default(),
            channels: ChannelsConfig::default(),
            storage: StorageConfig::default(),
            dispatcher: DispatcherSettings::default(),
            fan_out: FanOutSettings::default(),
            retry: RetryConfig::default(),
            presets: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Nsq,
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub provider: ProviderKind,
    /// `host:port` of the nsqd instance used for publishing
    pub nsqd_tcp_address: Option<String>,
    /// nsqlookupd HTTP addresses used for consumer discovery
    pub lookupd_http_addresses: Vec<String>,
    pub lookupd_poll_interval_ms: u64,
    pub max_in_flight: u32,
    pub msg_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub client_id: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Nsq,
            nsqd_tcp_address: None,
            lookupd_http_addresses: Vec::new(),
            lookupd_poll_interval_ms: defaults::LOOKUPD_POLL_INTERVAL_MS,
            max_in_flight: defaults::MAX_IN_FLIGHT,
            msg_timeout_ms: defaults::MSG_TIMEOUT_MS,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            reconnect_delay_ms: defaults::RECONNECT_DELAY_MS,
            client_id: defaults::CLIENT_ID.to_string(),
        }
    }
}

impl MessagingConfig {
    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lookupd_poll_interval_ms)
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub fan_out: String,
    pub dispatcher: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            fan_out: channels::FAN_OUT.to_string(),
            dispatcher: channels::DISPATCHER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// Custom S3-compatible endpoint; objects are then addressed path-style
    pub endpoint: Option<String>,
    /// Static credentials; the AWS default provider chain is used when unset
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    pub public_read: bool,
    pub upload_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            public_read: true,
            upload_timeout_ms: defaults::UPLOAD_TIMEOUT_MS,
        }
    }
}

impl StorageConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub bind_address: String,
    pub requeue_delay_ms: u64,
    pub assignment_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Fixed seed for unit selection, mostly useful for reproducing runs
    pub selection_seed: Option<u64>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            bind_address: defaults::BIND_ADDRESS.to_string(),
            requeue_delay_ms: defaults::REQUEUE_DELAY_MS,
            assignment_timeout_ms: defaults::ASSIGNMENT_TIMEOUT_MS,
            fetch_timeout_ms: defaults::FETCH_TIMEOUT_MS,
            selection_seed: None,
        }
    }
}

impl DispatcherSettings {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutSettings {
    pub requeue_delay_ms: u64,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            requeue_delay_ms: defaults::REQUEUE_DELAY_MS,
        }
    }
}

impl FanOutSettings {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Deliveries attempted more often than this are dead-lettered. Unset means unbounded.
    pub max_attempts: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; falls back to `RUST_LOG`, then the environment default
    pub level: Option<String>,
    pub json_file: bool,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json_file: false,
            directory: "log".to_string(),
        }
    }
}

impl RszrConfig {
    /// Load from the default sources and validate the settings shared by every role
    pub fn load() -> ConfigResult<Self> {
        ConfigLoader::new().load()
    }

    pub fn preset_catalog(&self) -> Result<PresetCatalog, PresetError> {
        PresetCatalog::from_pairs(&self.presets)
    }

    /// Validate everything both roles depend on
    pub fn validate(&self) -> ConfigResult<()> {
        if self.messaging.provider == ProviderKind::Nsq {
            match self.messaging.nsqd_tcp_address.as_deref() {
                None | Some("") => {
                    return Err(ConfigurationError::missing_required_field(
                        "messaging.nsqd_tcp_address",
                        "nsq provider (set NSQD_ADDRESS)",
                    ))
                }
                Some(address) if !address.contains(':') => {
                    return Err(ConfigurationError::invalid_value(
                        "messaging.nsqd_tcp_address",
                        address,
                        "expected host:port",
                    ))
                }
                Some(_) => {}
            }
        }

        if self.messaging.max_in_flight == 0 {
            return Err(ConfigurationError::invalid_value(
                "messaging.max_in_flight",
                "0",
                "must be at least 1",
            ));
        }

        if self.retry.max_attempts == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                "0",
                "must be at least 1 when set",
            ));
        }

        self.preset_catalog()
            .map_err(|e| ConfigurationError::validation_error(format!("presets: {e}")))?;

        Ok(())
    }

    /// Validate the shared settings plus whatever `role` additionally requires
    pub fn validate_for_role(&self, role: ProcessRole) -> ConfigResult<()> {
        self.validate()?;

        if role == ProcessRole::Dispatcher {
            self.storage_target()?;

            let has_key = non_empty(self.storage.access_key_id.as_deref()).is_some();
            let has_secret = non_empty(self.storage.secret_access_key.as_deref()).is_some();
            if has_key != has_secret {
                return Err(ConfigurationError::validation_error(
                    "storage.access_key_id and storage.secret_access_key must be set together",
                ));
            }

            if self.dispatcher.assignment_timeout_ms == 0 {
                return Err(ConfigurationError::invalid_value(
                    "dispatcher.assignment_timeout_ms",
                    "0",
                    "must be positive",
                ));
            }
        }

        Ok(())
    }

    /// Bucket and region, both required by the dispatcher
    pub fn storage_target(&self) -> ConfigResult<(String, String)> {
        let bucket = non_empty(self.storage.bucket.as_deref()).ok_or_else(|| {
            ConfigurationError::missing_required_field("storage.bucket", "storage (set S3_BUCKET)")
        })?;
        let region = non_empty(self.storage.region.as_deref()).ok_or_else(|| {
            ConfigurationError::missing_required_field("storage.region", "storage (set S3_REGION)")
        })?;
        Ok((bucket.to_string(), region.to_string()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RszrConfig {
        let mut config = RszrConfig::default();
        config.messaging.nsqd_tcp_address = Some("127.0.0.1:4150".to_string());
        config.presets = vec![[100, 100], [200, 200]];
        config
    }

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = RszrConfig::default();
        assert_eq!(config.dispatcher.requeue_delay(), Duration::from_millis(1000));
        assert_eq!(
            config.dispatcher.assignment_timeout(),
            Duration::from_millis(5000)
        );
        assert!(config.storage.public_read);
        assert_eq!(config.retry.max_attempts, None);
    }

    #[test]
    fn test_nsq_provider_requires_address() {
        let mut config = valid_config();
        config.messaging.nsqd_tcp_address = None;

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MissingRequiredField { ref field, .. } if field == "messaging.nsqd_tcp_address"
        ));
    }

    #[test]
    fn test_in_memory_provider_needs_no_address() {
        let mut config = valid_config();
        config.messaging.provider = ProviderKind::InMemory;
        config.messaging.nsqd_tcp_address = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_presets_are_rejected() {
        let mut config = valid_config();
        config.presets.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_dispatcher_role_requires_storage() {
        let mut config = valid_config();
        assert!(config.validate_for_role(ProcessRole::FanOut).is_ok());
        assert!(config.validate_for_role(ProcessRole::Dispatcher).is_err());

        config.storage.bucket = Some("images".to_string());
        config.storage.region = Some("eu-west-1".to_string());
        assert!(config.validate_for_role(ProcessRole::Dispatcher).is_ok());
        assert_eq!(
            config.storage_target().unwrap(),
            ("images".to_string(), "eu-west-1".to_string())
        );
    }

    #[test]
    fn test_static_credentials_must_be_complete() {
        let mut config = valid_config();
        config.storage.bucket = Some("b".to_string());
        config.storage.region = Some("us-east-1".to_string());
        config.storage.access_key_id = Some("AKIDEXAMPLE".to_string());
        assert!(config.validate_for_role(ProcessRole::Dispatcher).is_err());
        assert!(config.validate_for_role(ProcessRole::FanOut).is_ok());

        config.storage.secret_access_key = Some("secret".to_string());
        assert!(config.validate_for_role(ProcessRole::Dispatcher).is_ok());

        let rendered = serde_json::to_string(&config.storage).unwrap();
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_address_without_port_is_invalid() {
        let mut config = valid_config();
        config.messaging.nsqd_tcp_address = Some("nsqd".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
