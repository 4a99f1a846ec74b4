//! Fill notification passed to strategies.

use chrono::{DateTime, Utc};
use gridbot_core::{ClientOrderId, Order, OrderPurpose, OrderSide, Price, Size, Trade};
use rust_decimal::Decimal;

/// A recorded trade plus the order context a strategy needs to route it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFill {
    pub order_id: Option<ClientOrderId>,
    pub side: OrderSide,
    pub price: Price,
    pub quantity: Size,
    /// Fee in quote currency.
    pub fee: Decimal,
    pub grid_level: Option<u32>,
    /// `None` for trades recovered without a local order.
    pub purpose: Option<OrderPurpose>,
    pub executed_at: DateTime<Utc>,
}

impl StrategyFill {
    pub fn from_trade(trade: &Trade, order: Option<&Order>) -> Self {
        Self {
            order_id: trade.order_id.clone(),
            side: trade.side,
            price: trade.price,
            quantity: trade.quantity,
            fee: trade.fee,
            grid_level: order.and_then(|o| o.grid_level),
            purpose: order.map(|o| o.purpose),
            executed_at: trade.executed_at,
        }
    }
}
