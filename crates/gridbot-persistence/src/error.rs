//! Persistence error types.

use gridbot_core::BotId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bot not found: {0}")]
    BotNotFound(BotId),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
