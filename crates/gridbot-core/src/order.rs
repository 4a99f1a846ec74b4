//! Order vocabulary: side, type, purpose and client order identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Resting limit order (grid rungs).
    Limit,
    /// Immediate market order (DCA buys, take-profit and stop-loss exits).
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Why a strategy asked for an order.
///
/// Carried on the order so a fill can be routed back to the right piece of
/// strategy bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderPurpose {
    /// A grid rung order.
    Grid,
    /// A DCA purchase fired by the time trigger.
    DcaScheduled,
    /// A DCA purchase fired by the plain drop threshold (no ladder).
    DcaPriceDrop,
    /// A DCA safety-ladder rung fired by the price-drop trigger.
    DcaSafety { rung: u32 },
    /// Full-position exit on take-profit.
    TakeProfit,
    /// Position unwind after a grid stop-loss.
    StopLoss,
}

impl fmt::Display for OrderPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::DcaScheduled => write!(f, "dca_scheduled"),
            Self::DcaPriceDrop => write!(f, "dca_price_drop"),
            Self::DcaSafety { rung } => write!(f, "dca_safety[{rung}]"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopLoss => write!(f, "stop_loss"),
        }
    }
}

/// Client order ID, also sent to the venue as its client-assigned id.
///
/// A submission whose outcome is unknown (timeout) can be looked up on the
/// venue by this id during reconciliation, so it must be unique per order
/// and must never be regenerated on retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `gb_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("gb_{ts}_{}", &uuid[..8]))
    }

    /// Wrap an id reported back by the venue or loaded from storage.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientOrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_client_order_id_unique_and_prefixed() {
        let a = ClientOrderId::new();
        let b = ClientOrderId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("gb_"));
    }

    #[test]
    fn test_purpose_serde_tagged() {
        let json = serde_json::to_string(&OrderPurpose::DcaSafety { rung: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"dca_safety","rung":2}"#);
        let back: OrderPurpose = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OrderPurpose::DcaSafety { rung: 2 });
    }
}
