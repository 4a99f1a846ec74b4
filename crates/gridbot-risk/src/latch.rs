//! Trip latch for the circuit breaker.
//!
//! Once tripped, the latch stays tripped until an operator resets it.
//! There is no automatic cool-down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// TripReason
// ============================================================================

/// Why a bot's breaker tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    /// Too many submissions in the rolling minute.
    OrderRateExceeded { count: u32, limit: u32 },
    /// Realized plus unrealized loss in the rolling hour over the limit.
    LossLimitExceeded { loss: Decimal, limit: Decimal },
    /// Order priced too far from market, when configured to trip.
    PriceDeviation { deviation_pct: Decimal, limit_pct: Decimal },
    /// Operator-initiated.
    Manual { message: String },
    /// Unrecoverable engine condition (e.g. reconciliation conflict).
    Error { message: String },
}

impl TripReason {
    /// Stable identifier used in notifications and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderRateExceeded { .. } => "order_rate_exceeded",
            Self::LossLimitExceeded { .. } => "loss_limit_exceeded",
            Self::PriceDeviation { .. } => "price_deviation",
            Self::Manual { .. } => "manual",
            Self::Error { .. } => "error",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderRateExceeded { count, limit } => {
                write!(f, "order rate exceeded ({count}/{limit} per minute)")
            }
            Self::LossLimitExceeded { loss, limit } => {
                write!(f, "loss limit exceeded ({loss} >= {limit} per hour)")
            }
            Self::PriceDeviation {
                deviation_pct,
                limit_pct,
            } => write!(f, "price deviation {deviation_pct}% > {limit_pct}%"),
            Self::Manual { message } => write!(f, "manual: {message}"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

// ============================================================================
// TripLatch
// ============================================================================

/// Thread-safe trip latch. Shared via `Arc` when needed.
pub struct TripLatch {
    tripped: AtomicBool,
    state: RwLock<Option<(TripReason, DateTime<Utc>)>>,
}

impl Default for TripLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TripLatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            state: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Trip with `reason`. Returns `true` only for the call that tripped it;
    /// later calls keep the original reason.
    pub fn trip(&self, reason: TripReason) -> bool {
        if self
            .tripped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.state.write() = Some((reason.clone(), Utc::now()));
            error!(reason = %reason, kind = reason.kind(), "CIRCUIT BREAKER TRIPPED");
            true
        } else {
            warn!(new_reason = %reason, "Circuit breaker already tripped, ignoring");
            false
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<TripReason> {
        self.state.read().as_ref().map(|(r, _)| r.clone())
    }

    #[must_use]
    pub fn tripped_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().as_ref().map(|(_, at)| *at)
    }

    /// Manual reset. Never called automatically.
    pub fn reset(&self) {
        if self.is_tripped() {
            let previous = self.state.write().take();
            self.tripped.store(false, Ordering::SeqCst);
            info!(previous_reason = ?previous.map(|(r, _)| r), "Circuit breaker manually reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_initially_clear() {
        let latch = TripLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.reason().is_none());
        assert!(latch.tripped_at().is_none());
    }

    #[test]
    fn test_first_reason_wins() {
        let latch = TripLatch::new();
        assert!(latch.trip(TripReason::Manual {
            message: "operator".to_string()
        }));
        assert!(!latch.trip(TripReason::OrderRateExceeded {
            count: 50,
            limit: 50
        }));
        assert_eq!(latch.reason().map(|r| r.kind()), Some("manual"));
    }

    #[test]
    fn test_reset_clears() {
        let latch = TripLatch::new();
        latch.trip(TripReason::Error {
            message: "x".to_string(),
        });
        latch.reset();
        assert!(!latch.is_tripped());
        assert!(latch.reason().is_none());
    }
}
