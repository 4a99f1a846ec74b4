//! Order lifecycle types.
//!
//! This module provides:
//! - `OrderStatus`: the per-order state machine
//! - `DesiredOrder`: what a strategy asks for
//! - `Order`: a tracked order from local creation to a terminal state
//! - `FillEvent` / `Trade`: a venue execution and its append-only record

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::bot::BotId;
use crate::error::{CoreError, Result};
use crate::order::{ClientOrderId, OrderPurpose, OrderSide, OrderType};
use crate::{Price, Size};

// ============================================================================
// Order Status
// ============================================================================

/// State of an order in its lifecycle.
///
/// ```text
/// pending -> submitting -> open -> partially_filled -> filled
///                |           |            |
///                |           +-> cancelling -> cancelled
///                +-> rejected | error
/// ```
///
/// `filled`, `cancelled`, `rejected` and `error` are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, no network call made yet.
    #[default]
    Pending,
    /// Venue call in flight; outcome unknown until a response or reconciliation.
    Submitting,
    /// Accepted and resting on the venue.
    Open,
    /// Some quantity executed.
    PartiallyFilled,
    /// Cancel request in flight.
    Cancelling,
    /// Fully executed.
    Filled,
    /// Cancelled on the venue (or before ever being sent).
    Cancelled,
    /// Refused by the venue.
    Rejected,
    /// Retries exhausted or unrecoverable; needs operator or reconciliation.
    Error,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Error
        )
    }

    /// Active orders occupy their (bot, side, grid level) slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine permits `self -> next`.
    #[must_use]
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Submitting | Cancelled | Error)
                | (
                    Submitting,
                    Open | PartiallyFilled | Filled | Cancelled | Rejected | Error
                )
                | (Open, PartiallyFilled | Filled | Cancelling | Cancelled)
                | (
                    PartiallyFilled,
                    PartiallyFilled | Open | Filled | Cancelling | Cancelled
                )
                | (Cancelling, Open | PartiallyFilled | Filled | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitting => "submitting",
            Self::Open => "open",
            Self::PartiallyFilled => "partially_filled",
            Self::Cancelling => "cancelling",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Desired Order
// ============================================================================

/// Dedup key: at most one active order per bot may hold a given slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSlot {
    pub side: OrderSide,
    pub level: u32,
}

/// An order a strategy wants to exist. Carries no identity yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredOrder {
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price; for market orders the reference price used for sizing.
    pub price: Price,
    pub quantity: Size,
    pub grid_level: Option<u32>,
    pub purpose: OrderPurpose,
}

impl DesiredOrder {
    #[must_use]
    pub fn limit(side: OrderSide, price: Price, quantity: Size, grid_level: u32) -> Self {
        Self {
            side,
            order_type: OrderType::Limit,
            price,
            quantity,
            grid_level: Some(grid_level),
            purpose: OrderPurpose::Grid,
        }
    }

    #[must_use]
    pub fn market(side: OrderSide, reference: Price, quantity: Size, purpose: OrderPurpose) -> Self {
        Self {
            side,
            order_type: OrderType::Market,
            price: reference,
            quantity,
            grid_level: None,
            purpose,
        }
    }

    #[must_use]
    pub fn slot(&self) -> Option<GridSlot> {
        self.grid_level.map(|level| GridSlot {
            side: self.side,
            level,
        })
    }

    /// Quote notional at the order's (reference) price.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity.notional(self.price)
    }
}

// ============================================================================
// Order
// ============================================================================

/// Tracked order owned by a bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: ClientOrderId,
    pub bot_id: BotId,
    pub symbol: String,
    /// Venue-assigned id, `None` until the venue accepts the order.
    pub venue_order_id: Option<String>,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price (reference price for market orders).
    pub price: Price,
    pub quantity: Size,
    pub filled_quantity: Size,
    pub average_fill_price: Option<Price>,
    /// Accumulated fees, in quote currency.
    pub fee: Decimal,
    pub status: OrderStatus,
    pub grid_level: Option<u32>,
    pub purpose: OrderPurpose,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a local `pending` order from a strategy request.
    #[must_use]
    pub fn from_desired(
        bot_id: BotId,
        symbol: impl Into<String>,
        desired: &DesiredOrder,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ClientOrderId::new(),
            bot_id,
            symbol: symbol.into(),
            venue_order_id: None,
            side: desired.side,
            order_type: desired.order_type,
            price: desired.price,
            quantity: desired.quantity,
            filled_quantity: Size::ZERO,
            average_fill_price: None,
            fee: Decimal::ZERO,
            status: OrderStatus::Pending,
            grid_level: desired.grid_level,
            purpose: desired.purpose,
            retry_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    #[must_use]
    pub fn slot(&self) -> Option<GridSlot> {
        self.grid_level.map(|level| GridSlot {
            side: self.side,
            level,
        })
    }

    #[must_use]
    pub fn remaining(&self) -> Size {
        self.quantity.saturating_sub(self.filled_quantity)
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `Ok(false)` when already in `next` (no-op), so repeated
    /// reconciliation passes produce no writes.
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<bool> {
        if self.status == next && next != OrderStatus::PartiallyFilled {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidOrderTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(true)
    }

    /// Apply one execution to the order's fill accounting and status.
    ///
    /// The caller is responsible for idempotency (by venue trade id).
    pub fn record_fill(
        &mut self,
        quantity: Size,
        price: Price,
        fee_quote: Decimal,
        now: DateTime<Utc>,
    ) -> Result<OrderStatus> {
        if !quantity.is_positive() {
            return Err(CoreError::InvalidQuantity(format!(
                "fill quantity must be positive, got {quantity}"
            )));
        }
        let next = if self.filled_quantity + quantity >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next, now)?;

        let prior_notional = self
            .average_fill_price
            .map(|p| self.filled_quantity.notional(p))
            .unwrap_or(Decimal::ZERO);
        let total = self.filled_quantity + quantity;
        self.average_fill_price = Some(Price::new(
            (prior_notional + quantity.notional(price)) / total.inner(),
        ));
        self.filled_quantity = total;
        self.fee += fee_quote;
        Ok(self.status)
    }
}

// ============================================================================
// Fills and Trades
// ============================================================================

/// A single execution reported by the venue (stream or history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: String,
    pub venue_order_id: String,
    /// Client id echoed by the venue, when it reports one.
    pub client_order_id: Option<ClientOrderId>,
    /// Unique per execution; the idempotency key for fill application.
    pub venue_trade_id: String,
    pub side: OrderSide,
    pub price: Price,
    /// Quantity of this execution (not cumulative).
    pub quantity: Size,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Append-only fill record with its realized P&L.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub bot_id: BotId,
    /// Originating local order; `None` for trades recovered without one.
    pub order_id: Option<ClientOrderId>,
    pub venue_order_id: Option<String>,
    pub venue_trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Price,
    pub quantity: Size,
    /// Fee in quote currency.
    pub fee: Decimal,
    /// Realized P&L attributed to this fill, computed once at creation.
    pub realized_pnl: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    /// Ordering used whenever trades are replayed through FIFO.
    ///
    /// Numeric venue trade ids sort numerically so `"10"` follows `"9"`.
    pub fn sequence_key(&self) -> (DateTime<Utc>, Option<u64>, String) {
        (
            self.executed_at,
            self.venue_trade_id.parse().ok(),
            self.venue_trade_id.clone(),
        )
    }
}
