//! Logging setup.
//!
//! Logs always go to stderr so stdout stays free for alert output.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Telemetry setup errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Tracing subscriber initialization failed: {0}")]
    InitializationError(String),
}

/// Build the log filter. `RUST_LOG`, when set and valid, wins over `level`.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] if `level` is not a valid
/// filter directive and `RUST_LOG` does not supply one.
pub fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(level.to_lowercase()).map_err(|e| TelemetryError::InvalidFilter {
        filter: level.to_owned(),
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Fails if the filter is invalid or a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(config.structured)
        .with_thread_ids(config.structured);

    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| TelemetryError::InitializationError(e.to_string()))
}
