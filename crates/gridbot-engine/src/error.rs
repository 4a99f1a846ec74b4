//! Engine error types.

use gridbot_core::{BotId, BotStatus, ClientOrderId, CoreError, OrderSide};
use gridbot_exchange::ExchangeError;
use gridbot_persistence::PersistenceError;
use gridbot_risk::RiskError;
use gridbot_strategy::StrategyError;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid bot setup; the bot never starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Risk error: {0}")]
    Risk(#[from] RiskError),

    #[error("Venue error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// An active order already holds this (side, grid level) slot.
    #[error("Duplicate order for {side} level {level}")]
    DuplicateSlot { side: OrderSide, level: u32 },

    #[error("Insufficient {asset}: need {needed}, free {free}")]
    InsufficientBalance {
        asset: String,
        needed: Decimal,
        free: Decimal,
    },

    /// The venue call timed out; the order may or may not exist venue-side.
    #[error("Submission outcome unknown for order {0}")]
    UnknownOutcome(ClientOrderId),

    #[error("Reconciliation conflict on order {order_id}: {detail}")]
    ReconciliationConflict {
        order_id: ClientOrderId,
        detail: String,
    },

    #[error("Venue call timed out: {0}")]
    Timeout(&'static str),

    #[error("Bot {bot_id} is {status}, cannot {action}")]
    InvalidState {
        bot_id: BotId,
        status: BotStatus,
        action: &'static str,
    },

    #[error("Bot not found: {0}")]
    BotNotFound(BotId),

    #[error("Bot already running: {0}")]
    AlreadyRunning(BotId),
}

impl EngineError {
    /// Errors that should stop the bot rather than skip one order.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Risk(e) => e.is_trip(),
            Self::Persistence(_) => true,
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
