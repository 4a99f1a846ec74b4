//! Per-bot circuit breaker.
//!
//! A synchronous gate consulted before every submission. The admission
//! check and the order-count record happen under one lock, so two
//! near-simultaneous submissions for the same bot can never both take the
//! last slot of the window.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use gridbot_core::Price;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RiskError, RiskResult};
use crate::latch::{TripLatch, TripReason};

/// Breaker thresholds; every field is overridable per bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_max_orders_per_minute")]
    pub max_orders_per_minute: u32,

    /// Loss limit as a percentage of the bot's investment.
    #[serde(default = "default_max_loss_per_hour_percent")]
    pub max_loss_per_hour_percent: Decimal,

    #[serde(default = "default_max_price_deviation_percent")]
    pub max_price_deviation_percent: Decimal,

    /// Trip the breaker on a deviating order instead of only rejecting it.
    #[serde(default)]
    pub trip_on_price_deviation: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_orders_per_minute: default_max_orders_per_minute(),
            max_loss_per_hour_percent: default_max_loss_per_hour_percent(),
            max_price_deviation_percent: default_max_price_deviation_percent(),
            trip_on_price_deviation: false,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> RiskResult<()> {
        if self.max_orders_per_minute == 0 {
            return Err(RiskError::ConfigError(
                "max_orders_per_minute must be positive".to_string(),
            ));
        }
        if self.max_loss_per_hour_percent <= Decimal::ZERO
            || self.max_price_deviation_percent <= Decimal::ZERO
        {
            return Err(RiskError::ConfigError(
                "loss and deviation limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_orders_per_minute() -> u32 {
    50
}
fn default_max_loss_per_hour_percent() -> Decimal {
    Decimal::new(5, 0) // 5%
}
fn default_max_price_deviation_percent() -> Decimal {
    Decimal::new(10, 0) // 10%
}

#[derive(Debug, Default)]
struct Windows {
    orders: VecDeque<DateTime<Utc>>,
    /// Realized losses (positive amounts) with their time.
    losses: VecDeque<(DateTime<Utc>, Decimal)>,
    /// Current mark-to-market loss, positive amount.
    unrealized_loss: Decimal,
}

impl Windows {
    fn prune(&mut self, now: DateTime<Utc>) {
        let minute_ago = now - Duration::seconds(60);
        while self.orders.front().is_some_and(|t| *t <= minute_ago) {
            self.orders.pop_front();
        }
        let hour_ago = now - Duration::hours(1);
        while self.losses.front().is_some_and(|(t, _)| *t <= hour_ago) {
            self.losses.pop_front();
        }
    }

    fn hourly_loss(&self) -> Decimal {
        self.losses.iter().map(|(_, l)| *l).sum::<Decimal>() + self.unrealized_loss
    }
}

/// Snapshot of the breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub tripped: Option<TripReason>,
    pub orders_last_minute: u32,
    pub loss_last_hour: Decimal,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Capital base for the loss percentage.
    investment: Decimal,
    windows: Mutex<Windows>,
    latch: TripLatch,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, investment: Decimal) -> Self {
        Self {
            config,
            investment,
            windows: Mutex::new(Windows::default()),
            latch: TripLatch::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.latch.is_tripped()
    }

    pub fn trip_reason(&self) -> Option<TripReason> {
        self.latch.reason()
    }

    /// Gate one submission and, when admitted, count it.
    ///
    /// `market` is the last known market price; a zero market price makes
    /// every order deviate by 100%.
    pub fn admit_order(&self, order_price: Price, market: Price, now: DateTime<Utc>) -> RiskResult<()> {
        let mut w = self.windows.lock();
        if let Some(reason) = self.latch.reason() {
            return Err(RiskError::Tripped(reason));
        }
        w.prune(now);

        let count = w.orders.len() as u32;
        if count >= self.config.max_orders_per_minute {
            return Err(self.trip(TripReason::OrderRateExceeded {
                count: count + 1,
                limit: self.config.max_orders_per_minute,
            }));
        }

        self.check_loss_locked(&w)?;

        let deviation_pct = order_price.deviation_pct(market);
        if deviation_pct > self.config.max_price_deviation_percent {
            if self.config.trip_on_price_deviation {
                return Err(self.trip(TripReason::PriceDeviation {
                    deviation_pct,
                    limit_pct: self.config.max_price_deviation_percent,
                }));
            }
            return Err(RiskError::PriceDeviation {
                price: order_price,
                market,
                deviation_pct,
                limit_pct: self.config.max_price_deviation_percent,
            });
        }

        w.orders.push_back(now);
        debug!(orders_last_minute = w.orders.len(), "Order admitted");
        Ok(())
    }

    /// Record a realized P&L amount; only losses count toward the limit.
    pub fn record_realized(&self, pnl: Decimal, now: DateTime<Utc>) {
        if pnl < Decimal::ZERO {
            let mut w = self.windows.lock();
            w.prune(now);
            w.losses.push_back((now, -pnl));
        }
    }

    /// Replace the current unrealized P&L (negative means a loss).
    pub fn update_unrealized(&self, pnl: Decimal) {
        self.windows.lock().unrealized_loss = if pnl < Decimal::ZERO {
            -pnl
        } else {
            Decimal::ZERO
        };
    }

    /// Evaluate the loss window outside a submission.
    pub fn check_loss(&self, now: DateTime<Utc>) -> RiskResult<()> {
        let mut w = self.windows.lock();
        if let Some(reason) = self.latch.reason() {
            return Err(RiskError::Tripped(reason));
        }
        w.prune(now);
        self.check_loss_locked(&w)
    }

    /// Trip from outside (operator or engine error).
    pub fn trip(&self, reason: TripReason) -> RiskError {
        self.latch.trip(reason);
        RiskError::Tripped(self.latch.reason().unwrap_or(TripReason::Error {
            message: "latch cleared concurrently".to_string(),
        }))
    }

    /// Operator restart: clears the latch and every window.
    pub fn reset(&self) {
        let mut w = self.windows.lock();
        *w = Windows::default();
        self.latch.reset();
    }

    pub fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        let mut w = self.windows.lock();
        w.prune(now);
        BreakerStatus {
            tripped: self.latch.reason(),
            orders_last_minute: w.orders.len() as u32,
            loss_last_hour: w.hourly_loss(),
        }
    }

    fn check_loss_locked(&self, w: &Windows) -> RiskResult<()> {
        if self.investment <= Decimal::ZERO {
            return Ok(());
        }
        let limit = self.investment * self.config.max_loss_per_hour_percent / Decimal::ONE_HUNDRED;
        let loss = w.hourly_loss();
        if loss >= limit {
            return Err(self.trip(TripReason::LossLimitExceeded { loss, limit }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn market() -> Price {
        Price::new(dec!(100))
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default(), dec!(1000))
    }

    #[test]
    fn test_default_config() {
        let c = CircuitBreakerConfig::default();
        assert_eq!(c.max_orders_per_minute, 50);
        assert_eq!(c.max_loss_per_hour_percent, dec!(5));
        assert_eq!(c.max_price_deviation_percent, dec!(10));
        assert!(!c.trip_on_price_deviation);
    }

    #[test]
    fn test_config_partial_override() {
        let c: CircuitBreakerConfig = toml::from_str("max_orders_per_minute = 10").unwrap();
        assert_eq!(c.max_orders_per_minute, 10);
        assert_eq!(c.max_loss_per_hour_percent, dec!(5));
    }

    #[test]
    fn test_51st_order_trips() {
        let b = breaker();
        for i in 0..50 {
            let now = t0() + Duration::milliseconds(i * 100);
            assert!(b.admit_order(market(), market(), now).is_ok(), "order {}", i + 1);
        }
        let err = b
            .admit_order(market(), market(), t0() + Duration::seconds(10))
            .unwrap_err();
        assert!(err.is_trip());
        assert!(b.is_tripped());
        assert_eq!(b.trip_reason().map(|r| r.kind()), Some("order_rate_exceeded"));

        // Latched: no automatic recovery after the window passes
        assert!(b
            .admit_order(market(), market(), t0() + Duration::minutes(10))
            .is_err());
    }

    #[test]
    fn test_rate_window_slides() {
        let b = breaker();
        for _ in 0..50 {
            b.admit_order(market(), market(), t0()).unwrap();
        }
        assert!(b
            .admit_order(market(), market(), t0() + Duration::seconds(61))
            .is_ok());
        assert!(!b.is_tripped());
    }

    #[test]
    fn test_price_deviation_rejects_without_tripping() {
        let b = breaker();
        let err = b
            .admit_order(Price::new(dec!(111)), market(), t0())
            .unwrap_err();
        assert!(matches!(err, RiskError::PriceDeviation { .. }));
        assert!(!b.is_tripped());
        assert!(b.admit_order(Price::new(dec!(110)), market(), t0()).is_ok());

        // Unknown market price: always refused
        assert!(b.admit_order(market(), Price::ZERO, t0()).is_err());
    }

    #[test]
    fn test_price_deviation_can_trip() {
        let config = CircuitBreakerConfig {
            trip_on_price_deviation: true,
            ..Default::default()
        };
        let b = CircuitBreaker::new(config, dec!(1000));
        assert!(b
            .admit_order(Price::new(dec!(80)), market(), t0())
            .unwrap_err()
            .is_trip());
    }

    #[test]
    fn test_loss_limit_realized_plus_unrealized() {
        let b = breaker();
        // Limit: 5% of 1000 = 50
        b.record_realized(dec!(-30), t0());
        b.record_realized(dec!(100), t0());
        assert!(b.check_loss(t0()).is_ok());

        b.update_unrealized(dec!(-20));
        let err = b.check_loss(t0() + Duration::minutes(1)).unwrap_err();
        assert!(err.is_trip());
        assert_eq!(b.trip_reason().map(|r| r.kind()), Some("loss_limit_exceeded"));
    }

    #[test]
    fn test_loss_window_expires() {
        let b = breaker();
        b.record_realized(dec!(-40), t0());
        b.update_unrealized(dec!(-15));
        assert!(b.check_loss(t0() + Duration::minutes(61)).is_ok());
        assert_eq!(b.status(t0() + Duration::minutes(61)).loss_last_hour, dec!(15));
    }

    #[test]
    fn test_reset_is_manual_and_clears_windows() {
        let b = breaker();
        b.trip(TripReason::Manual {
            message: "maintenance".to_string(),
        });
        assert!(b.admit_order(market(), market(), t0()).is_err());
        b.reset();
        assert!(!b.is_tripped());
        assert!(b.admit_order(market(), market(), t0()).is_ok());
        assert_eq!(b.status(t0()).orders_last_minute, 1);
    }

    #[test]
    fn test_concurrent_admission_is_atomic() {
        let b = Arc::new(breaker());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| b.admit_order(market(), market(), t0()).is_ok())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert!(b.is_tripped());
    }
}
