use thiserror::Error;

use crate::config::ConfigurationError;
use crate::execution::{DispatcherError, FetchError, StorageError};
use crate::messaging::MessagingError;
use crate::orchestration::PresetError;

/// Top-level error for process roles and bootstrapping.
///
/// Component code returns its own error type; the role runners in the binary
/// bubble everything up through this one with `?`.
#[derive(Debug, Error)]
pub enum RszrError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Preset error: {0}")]
    Preset(#[from] PresetError),

    #[error("Dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Server error: {0}")]
    Server(String),
}

impl RszrError {
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// Bad configuration rather than a runtime failure
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Preset(_))
    }
}

impl From<std::io::Error> for RszrError {
    fn from(err: std::io::Error) -> Self {
        Self::Server(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RszrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_at_startup_classification() {
        let config = RszrError::from(ConfigurationError::missing_required_field(
            "storage.bucket",
            "storage",
        ));
        assert!(config.is_fatal_at_startup());
        assert!(RszrError::from(PresetError::EmptyCatalog).is_fatal_at_startup());
        assert!(!RszrError::server("bind failed").is_fatal_at_startup());
    }
}
