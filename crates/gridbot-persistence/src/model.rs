//! Persisted bot record.

use chrono::{DateTime, Utc};
use gridbot_core::{BotId, BotStatus, ClientOrderId};
use gridbot_risk::CircuitBreakerConfig;
use gridbot_strategy::StrategyConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A configured bot and its durable runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub name: String,
    pub owner: String,
    /// Exchange account key; bots on one account share its connector.
    pub account: String,
    /// `BASE/QUOTE`, e.g. `BTC/USDT`.
    pub symbol: String,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    pub status: BotStatus,
    pub realized_pnl: Decimal,
    /// Versioned strategy state blob.
    pub strategy_state: Option<String>,
    /// Why the bot last stopped or errored.
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        account: impl Into<String>,
        symbol: impl Into<String>,
        strategy: StrategyConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BotId::new(),
            name: name.into(),
            owner: owner.into(),
            account: account.into(),
            symbol: symbol.into(),
            strategy,
            circuit_breaker: CircuitBreakerConfig::default(),
            status: BotStatus::Stopped,
            realized_pnl: Decimal::ZERO,
            strategy_state: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields written by `save_bot_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotStateUpdate {
    pub status: BotStatus,
    pub realized_pnl: Decimal,
    /// `None` leaves the stored blob untouched.
    pub strategy_state: Option<String>,
    pub reason: Option<String>,
}

/// How to find a stored order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderLookup {
    Client(ClientOrderId),
    Venue(String),
}
