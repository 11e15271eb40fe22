//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry driven by [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level so a deployed
//! host can be turned up without touching its config file.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber from `config`.
///
/// Fails if a global subscriber is already installed or the log file cannot
/// be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let console_plain = (config.log_to_console && !config.json_format)
        .then(|| fmt::layer().with_target(true).with_level(true));
    let console_json = (config.log_to_console && config.json_format)
        .then(|| fmt::layer().json().with_target(true));

    let file_layer = match (&config.log_file_path, config.log_to_file) {
        (Some(path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file '{path}': {e}"))
                })?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_plain)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .map_err(|e| ProtocolError::Custom(format!("Failed to install subscriber: {e}")))
}

/// Filter directive for the configured level, e.g. `"dualnet=debug,info"`.
pub fn default_directive(config: &LoggingConfig) -> String {
    let level = config.log_level.as_str().to_ascii_lowercase();
    format!("{}={level},info", env!("CARGO_PKG_NAME"))
}
