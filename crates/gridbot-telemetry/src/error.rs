//! Telemetry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),

    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Metrics encoding failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
