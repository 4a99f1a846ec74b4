//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(#[from] gridbot_engine::EngineError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] gridbot_exchange::ExchangeError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] gridbot_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] gridbot_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
