//! Venue error types.

use gridbot_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by venue: {0}")]
    RateLimited(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Venue rejected request: code={code}, message={message}")]
    Rejected { code: i64, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid venue response: {0}")]
    InvalidResponse(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Unsupported by this venue: {0}")]
    Unsupported(String),

    #[error("Connector shut down")]
    Shutdown,

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ExchangeError {
    /// Transient failures worth another attempt.
    ///
    /// Rejections, balance and not-found errors are final: repeating them
    /// only feeds the circuit breaker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout
                | Self::RateLimited(_)
                | Self::ConnectionFailed(_)
                | Self::ConnectionClosed { .. }
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimited("429".into()).is_retryable());
        assert!(!ExchangeError::InsufficientBalance("USDT".into()).is_retryable());
        assert!(!ExchangeError::Rejected {
            code: -1013,
            message: "Filter failure: LOT_SIZE".into()
        }
        .is_retryable());
    }
}
