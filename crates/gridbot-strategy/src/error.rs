//! Error types for gridbot-strategy.

use thiserror::Error;

/// Strategy error types.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Rejected at bot creation; never reaches a running engine.
    #[error("Invalid strategy configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported strategy state version: {0}")]
    UnsupportedStateVersion(u32),

    #[error("Strategy state mismatch: {0}")]
    StateMismatch(String),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StrategyResult<T> = Result<T, StrategyError>;
