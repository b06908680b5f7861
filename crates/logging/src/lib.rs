//! Logging for Image Recognizer
//!
//! This crate installs the process-wide `tracing` subscriber, honouring
//! `RUST_LOG` when set and the configured level otherwise.

use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

use settings::LoggingSettings;

/// Errors raised while installing the subscriber
#[derive(Error, Debug)]
pub enum LoggingError {
    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),
}

/// Builds the filter used by [`init_logging`]
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(settings.level.to_string())
            .map_err(|e| LoggingError::Filter(e.to_string())),
    }
}

/// Installs the global subscriber
///
/// Returns `Ok(false)` when a subscriber was already installed, which makes the
/// call safe from tests and embedding applications.
pub fn init_logging(settings: &LoggingSettings) -> Result<bool, LoggingError> {
    let filter = build_filter(settings)?;

    let installed = if settings.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!(level = %settings.level, json = settings.json, "Logging initialized");
    }

    Ok(installed)
}
