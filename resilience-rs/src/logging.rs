//! # Structured Logging
//!
//! Subscriber bootstrap and correlation id helpers for the bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use serde::{Serialize, Deserialize};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, Registry};
use uuid::Uuid;
use crate::types::{Result, Error, ErrorKind};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to log to stderr instead of stdout
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "cli-bridge".to_string(),
            json_format: false,
            stderr: true,
        }
    }
}

/// Initializes the structured logging system
///
/// `RUST_LOG` wins over the configured level. Calling this twice is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    // Don't re-initialize if already done
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = Registry::default().with(filter);

    // JSON and text layers have distinct types, so each branch installs its own
    let installed = match (config.json_format, config.stderr) {
        (true, true) => tracing::subscriber::set_global_default(
            subscriber.with(fmt::layer().json().flatten_event(true).with_current_span(true).with_writer(std::io::stderr)),
        ),
        (true, false) => tracing::subscriber::set_global_default(
            subscriber.with(fmt::layer().json().flatten_event(true).with_current_span(true)),
        ),
        (false, true) => tracing::subscriber::set_global_default(
            subscriber.with(fmt::layer().with_target(true).with_writer(std::io::stderr)),
        ),
        (false, false) => tracing::subscriber::set_global_default(
            subscriber.with(fmt::layer().with_target(true)),
        ),
    };

    installed.map_err(|e| Error::new(
        ErrorKind::Configuration,
        format!("Failed to set global subscriber: {}", e),
    ))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Generates a fresh correlation id
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        // Start from defaults and selectively override from the provided config.
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }
        if let Ok(stderr) = cfg.get::<bool>("logging.stderr") {
            base.stderr = stderr;
        }

        Ok(base)
    }
}
