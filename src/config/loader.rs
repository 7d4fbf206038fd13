//! Configuration Loader
//!
//! Layers configuration sources with the `config` crate, lowest precedence
//! first:
//!
//! 1. [`RszrConfig::default`]
//! 2. TOML file (`config/rszr.toml`, `RSZR_CONFIG`, or an explicit path)
//! 3. `RSZR_*` environment variables, `__` separating sections
//!    (`RSZR_DISPATCHER__ASSIGNMENT_TIMEOUT_MS=8000`)
//! 4. Legacy deployment variables: `NSQD_ADDRESS`/`NSQD_PORT`,
//!    `NSQLOOKUPD_ADDRESSES`, `S3_BUCKET`, `S3_REGION`
//!
//! The environment is read once into a map so tests can inject their own.

use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::error::{ConfigResult, ConfigurationError};
use super::RszrConfig;
use crate::constants::defaults;

const ENV_PREFIX: &str = "RSZR";
const DEFAULT_CONFIG_PATH: &str = "config/rszr.toml";

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit file; unlike the default path it must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Replace the process environment with a fixed map
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Load, merge and validate the shared settings
    pub fn load(&self) -> ConfigResult<RszrConfig> {
        let config = self.load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and merge without validation, used by `validate-config` to report every problem
    pub fn load_unvalidated(&self) -> ConfigResult<RszrConfig> {
        let env = self
            .env
            .clone()
            .unwrap_or_else(|| std::env::vars().collect());

        let (path, required) = match (&self.path, env.get("RSZR_CONFIG")) {
            (Some(path), _) => (path.clone(), true),
            (None, Some(path)) => (PathBuf::from(path), true),
            (None, None) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        debug!(
            path = %path.display(),
            required = required,
            "Loading rszr configuration"
        );

        let mut builder = Config::builder()
            .add_source(Config::try_from(&RszrConfig::default())?)
            .add_source(File::from(path.as_path()).format(FileFormat::Toml).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("messaging.lookupd_http_addresses")
                    .try_parsing(true)
                    .source(Some(env.clone())),
            );

        for (key, value) in legacy_overrides(&env)? {
            builder = builder.set_override(key, value)?;
        }

        let mut config: RszrConfig = builder.build()?.try_deserialize()?;

        if let Some(environment) = non_blank(env.get("RSZR_ENV")) {
            config.environment = environment.to_string();
        }

        Ok(config)
    }
}

/// Map the legacy deployment variables onto configuration keys
fn legacy_overrides(env: &HashMap<String, String>) -> ConfigResult<Vec<(&'static str, config::Value)>> {
    let mut overrides = Vec::new();

    if let Some(address) = non_blank(env.get("NSQD_ADDRESS")) {
        let port = match non_blank(env.get("NSQD_PORT")) {
            Some(port) => port.parse::<u16>().map_err(|_| {
                ConfigurationError::invalid_value("NSQD_PORT", port, "expected a TCP port")
            })?,
            None => defaults::NSQD_PORT,
        };
        let tcp_address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{port}")
        };
        overrides.push(("messaging.nsqd_tcp_address", tcp_address.into()));
    }

    if let Some(addresses) = non_blank(env.get("NSQLOOKUPD_ADDRESSES")) {
        let list: Vec<String> = addresses
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        overrides.push(("messaging.lookupd_http_addresses", list.into()));
    }

    if let Some(bucket) = non_blank(env.get("S3_BUCKET")) {
        overrides.push(("storage.bucket", bucket.to_string().into()));
    }

    if let Some(region) = non_blank(env.get("S3_REGION")) {
        overrides.push(("storage.region", region.to_string().into()));
    }

    Ok(overrides)
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}
