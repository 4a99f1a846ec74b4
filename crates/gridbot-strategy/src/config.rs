//! Strategy configuration.
//!
//! Validated once when a strategy is built; an invalid configuration never
//! reaches a running engine.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{StrategyError, StrategyResult};

/// Per-bot strategy configuration, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StrategyConfig {
    Grid(GridConfig),
    Dca(DcaConfig),
}

impl StrategyConfig {
    /// Validate against the venue's minimum order notional.
    pub fn validate(&self, min_notional: Decimal) -> StrategyResult<()> {
        match self {
            Self::Grid(c) => c.validate(min_notional),
            Self::Dca(c) => c.validate(min_notional),
        }
    }

    /// Capital at risk, used to size the loss circuit breaker.
    pub fn investment(&self) -> Decimal {
        match self {
            Self::Grid(c) => c.investment,
            Self::Dca(c) => c.total_budget,
        }
    }
}

// ============================================================================
// Grid
// ============================================================================

/// Grid strategy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    /// Number of intervals; the grid has `grid_count + 1` rungs.
    pub grid_count: u32,
    /// Total quote capital spread evenly across intervals.
    pub investment: Decimal,
    /// Unwind when price leaves the range by more than this percentage.
    /// `None` disables the stop-loss.
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: Option<Decimal>,
    /// A rung's sell is pushed up the ladder until it clears the buy price
    /// by this percentage. `None` always sells one rung up.
    #[serde(default)]
    pub min_sell_profit_pct: Option<Decimal>,
}

pub const MIN_GRID_COUNT: u32 = 5;
pub const MAX_GRID_COUNT: u32 = 100;

impl GridConfig {
    pub fn spacing(&self) -> Decimal {
        (self.upper_price - self.lower_price) / Decimal::from(self.grid_count)
    }

    pub fn per_grid(&self) -> Decimal {
        self.investment / Decimal::from(self.grid_count)
    }

    pub fn validate(&self, min_notional: Decimal) -> StrategyResult<()> {
        if self.lower_price <= Decimal::ZERO {
            return Err(invalid("lower_price must be positive"));
        }
        if self.upper_price <= self.lower_price {
            return Err(invalid("upper_price must be greater than lower_price"));
        }
        if !(MIN_GRID_COUNT..=MAX_GRID_COUNT).contains(&self.grid_count) {
            return Err(invalid(format!(
                "grid_count must be in [{MIN_GRID_COUNT}, {MAX_GRID_COUNT}], got {}",
                self.grid_count
            )));
        }
        if self.investment <= Decimal::ZERO {
            return Err(invalid("investment must be positive"));
        }
        let per_grid = self.per_grid();
        if per_grid < min_notional {
            return Err(invalid(format!(
                "investment per grid {per_grid} is below the venue minimum notional {min_notional}"
            )));
        }
        if let Some(pct) = self.stop_loss_percent {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE_HUNDRED {
                return Err(invalid("stop_loss_percent must be in (0, 100)"));
            }
        }
        if self.min_sell_profit_pct.is_some_and(|pct| pct < Decimal::ZERO) {
            return Err(invalid("min_sell_profit_pct must be >= 0"));
        }
        Ok(())
    }
}

fn default_stop_loss_percent() -> Option<Decimal> {
    Some(Decimal::new(5, 0)) // 5%
}

// ============================================================================
// DCA
// ============================================================================

/// Which triggers a DCA bot uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaType {
    TimeBased,
    PriceDrop,
    Hybrid,
}

impl DcaType {
    pub fn uses_time(&self) -> bool {
        matches!(self, Self::TimeBased | Self::Hybrid)
    }

    pub fn uses_drop(&self) -> bool {
        matches!(self, Self::PriceDrop | Self::Hybrid)
    }
}

/// Named purchase cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalPreset {
    Hourly,
    Daily,
    Weekly,
}

/// Purchase interval: a preset name or a number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DcaInterval {
    Seconds(u64),
    Preset(IntervalPreset),
}

impl DcaInterval {
    pub fn as_duration(&self) -> Duration {
        match self {
            Self::Seconds(s) => Duration::seconds(i64::try_from(*s).unwrap_or(i64::MAX)),
            Self::Preset(IntervalPreset::Hourly) => Duration::hours(1),
            Self::Preset(IntervalPreset::Daily) => Duration::days(1),
            Self::Preset(IntervalPreset::Weekly) => Duration::weeks(1),
        }
    }
}

/// One rung of the safety-order ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyOrder {
    /// Drop from the episode reference price, in percent.
    pub drop_percent: Decimal,
    /// Quote amount to buy when the rung fires.
    pub amount: Decimal,
}

/// DCA strategy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcaConfig {
    #[serde(rename = "type")]
    pub dca_type: DcaType,
    /// Quote amount per scheduled (or threshold) purchase.
    pub base_amount: Decimal,
    #[serde(default)]
    pub interval: Option<DcaInterval>,
    /// Drop percentage for threshold buys when no ladder is configured.
    #[serde(default)]
    pub drop_threshold: Option<Decimal>,
    /// Ordered by increasing `drop_percent`.
    #[serde(default)]
    pub safety_orders: Vec<SafetyOrder>,
    pub total_budget: Decimal,
    #[serde(default)]
    pub take_profit_percent: Option<Decimal>,
}

impl DcaConfig {
    pub fn validate(&self, min_notional: Decimal) -> StrategyResult<()> {
        if self.base_amount <= Decimal::ZERO {
            return Err(invalid("base_amount must be positive"));
        }
        if self.total_budget <= Decimal::ZERO {
            return Err(invalid("total_budget must be positive"));
        }
        if self.base_amount > self.total_budget {
            return Err(invalid("base_amount cannot exceed total_budget"));
        }
        if self.base_amount < min_notional {
            return Err(invalid(format!(
                "base_amount {} is below the venue minimum notional {min_notional}",
                self.base_amount
            )));
        }
        if let Some(t) = self.drop_threshold {
            if t <= Decimal::ZERO || t > Decimal::ONE_HUNDRED {
                return Err(invalid("drop_threshold must be in (0, 100]"));
            }
        }
        let mut prev = Decimal::ZERO;
        for (i, rung) in self.safety_orders.iter().enumerate() {
            if rung.drop_percent <= prev || rung.drop_percent > Decimal::ONE_HUNDRED {
                return Err(invalid(format!(
                    "safety_orders[{i}].drop_percent must be increasing and within (0, 100]"
                )));
            }
            if rung.amount < min_notional || rung.amount <= Decimal::ZERO {
                return Err(invalid(format!(
                    "safety_orders[{i}].amount must be positive and clear the minimum notional"
                )));
            }
            prev = rung.drop_percent;
        }
        if let Some(tp) = self.take_profit_percent {
            if tp <= Decimal::ZERO {
                return Err(invalid("take_profit_percent must be positive"));
            }
        }
        if self.dca_type.uses_time() && self.interval.is_none() {
            return Err(invalid(format!(
                "{:?} DCA requires an interval",
                self.dca_type
            )));
        }
        if self.dca_type.uses_drop()
            && self.drop_threshold.is_none()
            && self.safety_orders.is_empty()
        {
            return Err(invalid(
                "price-drop DCA requires a drop_threshold or a safety_orders ladder",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> StrategyError {
    StrategyError::InvalidConfig(msg.into())
}
