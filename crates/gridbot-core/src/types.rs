//! Market data and per-tick snapshot types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::error::{CoreError, Result};
use crate::execution::{Order, OrderStatus};
use crate::order::{ClientOrderId, OrderPurpose, OrderSide};
use crate::{Price, Size};

/// Boxed future used at object-safe async trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Split `"BTC/USDT"` into `("BTC", "USDT")`.
pub fn split_symbol(symbol: &str) -> Result<(&str, &str)> {
    match symbol.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok((base, quote)),
        _ => Err(CoreError::InvalidSymbol(symbol.to_string())),
    }
}

/// Last traded price for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Price,
    pub received_at: DateTime<Utc>,
}

impl Ticker {
    pub fn new(symbol: impl Into<String>, last: Price) -> Self {
        Self {
            symbol: symbol.into(),
            last,
            received_at: Utc::now(),
        }
    }
}

/// Free and locked balance of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Venue trading rules for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    /// Price increment. Zero means unrestricted.
    pub tick_size: Decimal,
    /// Quantity increment. Zero means unrestricted.
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolRules {
    /// Rules with no increments and no minimums.
    pub fn unrestricted(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            tick_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        }
    }

    pub fn round_price(&self, price: Price) -> Price {
        Price::new(price.floor_to(self.tick_size).inner().normalize())
    }

    pub fn round_quantity(&self, quantity: Size) -> Size {
        Size::new(quantity.floor_to(self.step_size).inner().normalize())
    }

    /// Whether an already-rounded order clears the venue minimums.
    pub fn accepts(&self, price: Price, quantity: Size) -> bool {
        quantity.is_positive()
            && quantity.inner() >= self.min_qty
            && quantity.notional(price) >= self.min_notional
    }
}

/// Strategy-facing view of one active order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub id: ClientOrderId,
    pub side: OrderSide,
    pub price: Price,
    pub quantity: Size,
    pub filled_quantity: Size,
    pub grid_level: Option<u32>,
    pub purpose: OrderPurpose,
    pub status: OrderStatus,
}

impl From<&Order> for ActiveOrder {
    fn from(o: &Order) -> Self {
        Self {
            id: o.id.clone(),
            side: o.side,
            price: o.price,
            quantity: o.quantity,
            filled_quantity: o.filled_quantity,
            grid_level: o.grid_level,
            purpose: o.purpose,
            status: o.status,
        }
    }
}

/// Everything a strategy sees on a tick. Strategies never call the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Price,
    pub base_free: Decimal,
    pub quote_free: Decimal,
    /// Quantity held according to the FIFO ledger.
    pub position: Size,
    pub active_orders: Vec<ActiveOrder>,
    pub now: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn has_active(&self, side: OrderSide) -> bool {
        self.active_orders.iter().any(|o| o.side == side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("BTC/USDT").unwrap(), ("BTC", "USDT"));
        assert!(split_symbol("BTCUSDT").is_err());
        assert!(split_symbol("/USDT").is_err());
    }

    #[test]
    fn test_symbol_rules_rounding() {
        let rules = SymbolRules {
            symbol: "BTC/USDT".to_string(),
            tick_size: dec!(0.01),
            step_size: dec!(0.00001),
            min_qty: dec!(0.00001),
            min_notional: dec!(10),
        };
        assert_eq!(
            rules.round_price(Price::new(dec!(43123.4567))),
            Price::new(dec!(43123.45))
        );
        let qty = rules.round_quantity(Size::new(dec!(0.000239999)));
        assert_eq!(qty, Size::new(dec!(0.00023)));
        assert!(rules.accepts(Price::new(dec!(50000)), qty));
        assert!(!rules.accepts(Price::new(dec!(40000)), qty));
    }
}
