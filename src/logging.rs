//! # Structured Logging Module
//!
//! Environment-aware structured logging: a human readable console layer and,
//! when enabled, a JSON file layer for shipping dispatcher and fan-out traces.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Later calls are no-ops. An already installed global subscriber is kept.
pub fn init_structured_logging(config: &LoggingConfig, environment: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directive = resolve_directive(config.level.as_deref(), environment);

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(&directive));

        let mut log_path = None;
        let file_layer = if config.json_file {
            match open_log_file(&config.directory, environment) {
                Ok((path, appender)) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    // The writer thread must outlive every span in the process
                    std::mem::forget(guard);
                    log_path = Some(path);
                    Some(
                        fmt::layer()
                            .with_writer(writer)
                            .with_target(true)
                            .with_thread_ids(true)
                            .with_ansi(false)
                            .json()
                            .with_filter(EnvFilter::new(&directive)),
                    )
                }
                Err(error) => {
                    eprintln!("rszr: file logging disabled: {error}");
                    None
                }
            }
        } else {
            None
        };

        if tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            filter = %directive,
            log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn open_log_file(
    directory: &str,
    environment: &str,
) -> std::io::Result<(PathBuf, tracing_appender::rolling::RollingFileAppender)> {
    let log_dir = PathBuf::from(directory);
    fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "{}.{}.{}.log",
        environment,
        process::id(),
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let path = log_dir.join(&file_name);
    Ok((path, tracing_appender::rolling::never(&log_dir, file_name)))
}

/// Explicit level, then `RUST_LOG`, then the per-environment default
fn resolve_directive(explicit: Option<&str>, environment: &str) -> String {
    if let Some(level) = explicit.filter(|l| !l.trim().is_empty()) {
        return level.to_string();
    }
    match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default_level(environment).to_string(),
    }
}

fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}
