//! Risk error types.

use gridbot_core::Price;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::latch::TripReason;

#[derive(Debug, Error)]
pub enum RiskError {
    /// The bot's breaker is latched; every submission is refused until a
    /// manual reset.
    #[error("Circuit breaker tripped: {0}")]
    Tripped(TripReason),

    /// Order refused pre-submission without tripping the breaker.
    #[error("Order price {price} deviates {deviation_pct}% from market {market} (max {limit_pct}%)")]
    PriceDeviation {
        price: Price,
        market: Price,
        deviation_pct: Decimal,
        limit_pct: Decimal,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl RiskError {
    /// Whether this error stops the bot.
    pub fn is_trip(&self) -> bool {
        matches!(self, Self::Tripped(_))
    }
}

pub type RiskResult<T> = Result<T, RiskError>;
