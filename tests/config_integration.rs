//! # Configuration Integration Tests
//!
//! The shipped `config/rszr.toml` must load and validate for both roles.

use std::collections::HashMap;
use std::time::Duration;

use rszr::config::{ConfigLoader, ProcessRole, ProviderKind};
use rszr::execution::DispatcherConfig;

fn shipped_config() -> ConfigLoader {
    ConfigLoader::new().with_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/rszr.toml"))
}

#[test]
fn test_shipped_config_is_valid_for_both_roles() -> anyhow::Result<()> {
    let config = shipped_config().with_env(HashMap::new()).load()?;

    config.validate_for_role(ProcessRole::FanOut)?;
    config.validate_for_role(ProcessRole::Dispatcher)?;
    assert_eq!(config.messaging.provider, ProviderKind::Nsq);

    let catalog = config.preset_catalog()?;
    let presets: Vec<String> = catalog.iter().map(ToString::to_string).collect();
    assert_eq!(presets, vec!["100x100", "320x240", "640x480", "1024x768"]);

    let dispatcher = DispatcherConfig::from_config(&config)?;
    assert_eq!(dispatcher.bucket, "rszr-images");
    assert_eq!(dispatcher.assignment_timeout, Duration::from_secs(5));
    assert_eq!(dispatcher.requeue_delay, Duration::from_secs(1));
    Ok(())
}

#[test]
fn test_deployment_variables_override_shipped_config() -> anyhow::Result<()> {
    let env: HashMap<String, String> = [
        ("NSQD_ADDRESS", "nsqd.internal"),
        ("S3_BUCKET", "prod-images"),
        ("RSZR_DISPATCHER__ASSIGNMENT_TIMEOUT_MS", "8000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let config = shipped_config().with_env(env).load()?;

    assert_eq!(
        config.messaging.nsqd_tcp_address.as_deref(),
        Some("nsqd.internal:4150")
    );
    assert_eq!(config.storage.bucket.as_deref(), Some("prod-images"));
    assert_eq!(config.dispatcher.assignment_timeout(), Duration::from_secs(8));
    Ok(())
}
