//! Error types for gridbot-core.

use thiserror::Error;

use crate::bot::BotStatus;
use crate::execution::OrderStatus;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid order transition: {from} -> {to}")]
    InvalidOrderTransition { from: OrderStatus, to: OrderStatus },

    #[error("Invalid bot transition: {from} -> {to}")]
    InvalidBotTransition { from: BotStatus, to: BotStatus },

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] uuid::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
