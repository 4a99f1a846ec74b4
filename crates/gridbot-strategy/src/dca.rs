//! Dollar-cost-averaging strategy.
//!
//! Triggers, checked once per tick, at most one purchase per tick:
//! - take-profit (full-position market sell) first
//! - time trigger, when enabled
//! - price-drop trigger: the next safety-ladder rung, or the plain drop
//!   threshold when no ladder is configured
//!
//! An "episode" runs from the first purchase to the exit that flattens the
//! position. Ladder rungs fire at most once per episode.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use gridbot_core::{DesiredOrder, MarketSnapshot, OrderPurpose, OrderSide, Price, Size, SymbolRules};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DcaConfig;
use crate::error::StrategyResult;
use crate::fill::StrategyFill;

/// Quantity precision for market purchases before venue step rounding.
const QTY_DP: u32 = 8;

/// Serializable DCA state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcaState {
    /// Cost of the open position, fees excluded.
    pub invested: Decimal,
    pub quantity: Size,
    /// Fees paid in the current episode, quote currency.
    pub fees_paid: Decimal,
    pub last_purchase_at: Option<DateTime<Utc>>,
    /// Cooldown anchor of the time trigger.
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub last_purchase_price: Option<Price>,
    /// Drop trigger anchor for the current episode.
    pub reference_price: Option<Price>,
    pub safety_fired: BTreeSet<u32>,
}

#[derive(Debug, Clone)]
pub struct DcaStrategy {
    config: DcaConfig,
    step_size: Decimal,
    state: DcaState,
}

impl DcaStrategy {
    pub fn new(config: DcaConfig, rules: &SymbolRules) -> StrategyResult<Self> {
        config.validate(rules.min_notional)?;
        Ok(Self {
            config,
            step_size: rules.step_size,
            state: DcaState::default(),
        })
    }

    pub fn config(&self) -> &DcaConfig {
        &self.config
    }

    pub fn state(&self) -> &DcaState {
        &self.state
    }

    pub fn restore(&mut self, state: DcaState) {
        self.state = state;
    }

    pub fn average_entry_price(&self) -> Option<Price> {
        if self.state.quantity.is_zero() {
            return None;
        }
        Some(Price::new(self.state.invested / self.state.quantity.inner()))
    }

    pub fn remaining_budget(&self) -> Decimal {
        self.config.total_budget - self.state.invested
    }

    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        self.state.quantity.notional(mark) - self.state.invested
    }

    /// No purchase the configuration could still make fits the budget.
    pub fn budget_exhausted(&self) -> bool {
        let remaining = self.remaining_budget();
        self.next_amounts().all(|amount| amount > remaining)
    }

    /// Budget exhausted and nothing left to exit. Without a take-profit
    /// there is no exit, so an exhausted budget alone is terminal.
    pub fn should_stop(&self) -> bool {
        self.budget_exhausted()
            && (self.state.quantity.is_zero() || self.config.take_profit_percent.is_none())
    }

    pub fn calculate_orders(&mut self, snapshot: &MarketSnapshot) -> Vec<DesiredOrder> {
        let price = snapshot.price;
        let orders = self.evaluate(snapshot);
        self.track_reference(price);
        orders
    }

    fn evaluate(&self, snapshot: &MarketSnapshot) -> Vec<DesiredOrder> {
        let price = snapshot.price;
        if !price.is_positive() {
            return Vec::new();
        }
        // One decision in flight at a time.
        if !snapshot.active_orders.is_empty() {
            return Vec::new();
        }

        if let Some(order) = self.take_profit_order(snapshot) {
            return vec![order];
        }

        let remaining = self.remaining_budget();

        if self.time_trigger_due(snapshot.now) {
            if self.config.base_amount <= remaining {
                debug!(amount = %self.config.base_amount, "DCA time trigger");
                return self.buy(price, self.config.base_amount, OrderPurpose::DcaScheduled);
            }
            debug!(remaining = %remaining, "DCA scheduled purchase skipped, budget exhausted");
        }

        if !self.config.dca_type.uses_drop() {
            return Vec::new();
        }
        let Some(reference) = self.state.reference_price else {
            return Vec::new();
        };

        if self.config.safety_orders.is_empty() {
            let Some(threshold) = self.config.drop_threshold else {
                return Vec::new();
            };
            if price <= drop_level(reference, threshold) && self.config.base_amount <= remaining {
                debug!(reference = %reference, price = %price, "DCA drop trigger");
                return self.buy(price, self.config.base_amount, OrderPurpose::DcaPriceDrop);
            }
            return Vec::new();
        }

        let next_rung = self
            .config
            .safety_orders
            .iter()
            .enumerate()
            .find(|(i, _)| !self.state.safety_fired.contains(&(*i as u32)));
        if let Some((i, rung)) = next_rung {
            if price <= drop_level(reference, rung.drop_percent) && rung.amount <= remaining {
                debug!(rung = i, reference = %reference, price = %price, "DCA safety order");
                return self.buy(price, rung.amount, OrderPurpose::DcaSafety { rung: i as u32 });
            }
        }
        Vec::new()
    }

    pub fn on_order_filled(&mut self, fill: &StrategyFill) {
        match fill.side {
            OrderSide::Buy => self.record_buy(fill),
            OrderSide::Sell => self.record_sell(fill),
        }
    }

    fn record_buy(&mut self, fill: &StrategyFill) {
        let s = &mut self.state;
        s.invested += fill.quantity.notional(fill.price);
        s.quantity += fill.quantity;
        s.fees_paid += fill.fee;
        s.last_purchase_at = Some(fill.executed_at);
        s.last_purchase_price = Some(fill.price);
        match fill.purpose {
            Some(OrderPurpose::DcaScheduled) => s.last_scheduled_at = Some(fill.executed_at),
            Some(OrderPurpose::DcaSafety { rung }) => {
                s.safety_fired.insert(rung);
            }
            Some(OrderPurpose::DcaPriceDrop) => s.reference_price = Some(fill.price),
            _ => {}
        }
        if s.reference_price.is_none() {
            s.reference_price = Some(fill.price);
        }
    }

    fn record_sell(&mut self, fill: &StrategyFill) {
        let s = &mut self.state;
        let before = s.quantity;
        let sold = fill.quantity.min(before);
        s.quantity = before - sold;
        if s.quantity.is_zero() {
            info!(price = %fill.price, "DCA position closed, new episode");
            s.invested = Decimal::ZERO;
            s.fees_paid = Decimal::ZERO;
            s.safety_fired.clear();
            s.reference_price = None;
            s.last_purchase_price = None;
        } else if before.is_positive() {
            s.invested = s.invested * s.quantity.inner() / before.inner();
        }
    }

    fn take_profit_order(&self, snapshot: &MarketSnapshot) -> Option<DesiredOrder> {
        let target = self.config.take_profit_percent?;
        let avg = self.average_entry_price()?;
        let gain = snapshot.price.pct_from(avg)?;
        if gain < target {
            return None;
        }
        let qty = self
            .state
            .quantity
            .min(Size::new(snapshot.base_free))
            .floor_to(self.step_size);
        if !qty.is_positive() {
            return None;
        }
        info!(avg = %avg, price = %snapshot.price, gain = %gain, "DCA take-profit");
        Some(DesiredOrder::market(
            OrderSide::Sell,
            snapshot.price,
            qty,
            OrderPurpose::TakeProfit,
        ))
    }

    fn time_trigger_due(&self, now: DateTime<Utc>) -> bool {
        if !self.config.dca_type.uses_time() {
            return false;
        }
        let Some(interval) = self.config.interval else {
            return false;
        };
        match self.state.last_scheduled_at {
            None => true,
            Some(last) => now - last >= interval.as_duration(),
        }
    }

    fn buy(&self, price: Price, amount: Decimal, purpose: OrderPurpose) -> Vec<DesiredOrder> {
        let qty = (amount / price.inner()).round_dp_with_strategy(QTY_DP, RoundingStrategy::ToZero);
        let qty = Size::new(qty).floor_to(self.step_size);
        if !qty.is_positive() {
            return Vec::new();
        }
        vec![DesiredOrder::market(OrderSide::Buy, price, qty, purpose)]
    }

    /// The highest price seen in the episode anchors the drop trigger.
    /// Once a ladder rung has fired the anchor is frozen.
    fn track_reference(&mut self, price: Price) {
        if !self.config.dca_type.uses_drop() || !price.is_positive() {
            return;
        }
        if !self.config.safety_orders.is_empty() && !self.state.safety_fired.is_empty() {
            return;
        }
        match self.state.reference_price {
            Some(r) if r >= price => {}
            _ => self.state.reference_price = Some(price),
        }
    }

    fn next_amounts(&self) -> impl Iterator<Item = Decimal> + '_ {
        let base = (self.config.dca_type.uses_time() || self.config.safety_orders.is_empty())
            .then_some(self.config.base_amount);
        let rungs = self
            .config
            .safety_orders
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.state.safety_fired.contains(&(*i as u32)))
            .map(|(_, r)| r.amount);
        base.into_iter().chain(rungs)
    }
}

fn drop_level(reference: Price, percent: Decimal) -> Price {
    Price::new(reference.inner() * (Decimal::ONE - percent / Decimal::ONE_HUNDRED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DcaInterval, DcaType, SafetyOrder};
    use chrono::{Duration, TimeZone};
    use gridbot_core::{ActiveOrder, ClientOrderId, OrderStatus};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn config(dca_type: DcaType) -> DcaConfig {
        DcaConfig {
            dca_type,
            base_amount: dec!(100),
            interval: Some(DcaInterval::Seconds(3600)),
            drop_threshold: Some(dec!(5)),
            safety_orders: Vec::new(),
            total_budget: dec!(500),
            take_profit_percent: None,
        }
    }

    fn dca(config: DcaConfig) -> DcaStrategy {
        DcaStrategy::new(config, &SymbolRules::unrestricted("BTC/USDT")).unwrap()
    }

    fn snapshot(price: Decimal, now: DateTime<Utc>, base_free: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTC/USDT".to_string(),
            price: Price::new(price),
            base_free,
            quote_free: dec!(10000),
            position: Size::new(base_free),
            active_orders: Vec::new(),
            now,
        }
    }

    fn fill_of(order: &DesiredOrder, at: DateTime<Utc>) -> StrategyFill {
        StrategyFill {
            order_id: None,
            side: order.side,
            price: order.price,
            quantity: order.quantity,
            fee: Decimal::ZERO,
            grid_level: None,
            purpose: Some(order.purpose),
            executed_at: at,
        }
    }

    #[test]
    fn test_budget_ceiling_skips_sixth_purchase() {
        let mut s = dca(config(DcaType::TimeBased));
        for i in 0..5 {
            let now = t0() + Duration::hours(i);
            assert!(!s.should_stop());
            let orders = s.calculate_orders(&snapshot(dec!(100), now, Decimal::ZERO));
            assert_eq!(orders.len(), 1, "purchase {} should fire", i + 1);
            assert_eq!(orders[0].purpose, OrderPurpose::DcaScheduled);
            assert_eq!(orders[0].quantity, Size::new(dec!(1)));
            s.on_order_filled(&fill_of(&orders[0], now));
        }
        assert_eq!(s.state().invested, dec!(500));
        assert!(s.should_stop());

        let sixth = s.calculate_orders(&snapshot(dec!(100), t0() + Duration::hours(5), dec!(5)));
        assert!(sixth.is_empty());
    }

    #[test]
    fn test_time_trigger_respects_interval() {
        let mut s = dca(config(DcaType::TimeBased));
        let first = s.calculate_orders(&snapshot(dec!(100), t0(), Decimal::ZERO));
        s.on_order_filled(&fill_of(&first[0], t0()));

        let early = t0() + Duration::minutes(59);
        assert!(s.calculate_orders(&snapshot(dec!(100), early, dec!(1))).is_empty());
        let due = t0() + Duration::minutes(60);
        assert_eq!(s.calculate_orders(&snapshot(dec!(100), due, dec!(1))).len(), 1);
    }

    #[test]
    fn test_skips_while_order_in_flight() {
        let mut s = dca(config(DcaType::TimeBased));
        let mut snap = snapshot(dec!(100), t0(), Decimal::ZERO);
        snap.active_orders.push(ActiveOrder {
            id: ClientOrderId::new(),
            side: OrderSide::Buy,
            price: Price::new(dec!(100)),
            quantity: Size::new(dec!(1)),
            filled_quantity: Size::ZERO,
            grid_level: None,
            purpose: OrderPurpose::DcaScheduled,
            status: OrderStatus::Submitting,
        });
        assert!(s.calculate_orders(&snap).is_empty());
    }

    #[test]
    fn test_average_entry_excludes_fees() {
        let mut s = dca(config(DcaType::TimeBased));
        let mut a = fill_of(
            &DesiredOrder::market(
                OrderSide::Buy,
                Price::new(dec!(100)),
                Size::new(dec!(1)),
                OrderPurpose::DcaScheduled,
            ),
            t0(),
        );
        a.fee = dec!(0.1);
        s.on_order_filled(&a);
        let b = fill_of(
            &DesiredOrder::market(
                OrderSide::Buy,
                Price::new(dec!(80)),
                Size::new(dec!(1)),
                OrderPurpose::DcaScheduled,
            ),
            t0() + Duration::hours(1),
        );
        s.on_order_filled(&b);
        assert_eq!(s.average_entry_price(), Some(Price::new(dec!(90))));
        assert_eq!(s.state().fees_paid, dec!(0.1));
    }

    #[test]
    fn test_take_profit_sells_all_and_resets_episode() {
        let mut c = config(DcaType::TimeBased);
        c.take_profit_percent = Some(dec!(10));
        let mut s = dca(c);

        let buy = s.calculate_orders(&snapshot(dec!(100), t0(), Decimal::ZERO));
        s.on_order_filled(&fill_of(&buy[0], t0()));

        let later = t0() + Duration::minutes(5);
        assert!(s.calculate_orders(&snapshot(dec!(109), later, dec!(1))).is_empty());
        let orders = s.calculate_orders(&snapshot(dec!(110), later, dec!(1)));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].purpose, OrderPurpose::TakeProfit);
        assert_eq!(orders[0].quantity, Size::new(dec!(1)));

        s.on_order_filled(&fill_of(&orders[0], later));
        assert!(s.state().quantity.is_zero());
        assert_eq!(s.state().invested, Decimal::ZERO);
        assert_eq!(s.remaining_budget(), dec!(500));
        assert!(!s.should_stop());
    }

    #[test]
    fn test_safety_ladder_fires_each_rung_once() {
        let mut c = config(DcaType::PriceDrop);
        c.drop_threshold = None;
        c.safety_orders = vec![
            SafetyOrder {
                drop_percent: dec!(5),
                amount: dec!(100),
            },
            SafetyOrder {
                drop_percent: dec!(10),
                amount: dec!(200),
            },
        ];
        let mut s = dca(c);

        // Establish the reference at 100
        assert!(s.calculate_orders(&snapshot(dec!(100), t0(), Decimal::ZERO)).is_empty());
        assert!(s.calculate_orders(&snapshot(dec!(96), t0(), Decimal::ZERO)).is_empty());

        let rung0 = s.calculate_orders(&snapshot(dec!(95), t0(), Decimal::ZERO));
        assert_eq!(rung0.len(), 1);
        assert_eq!(rung0[0].purpose, OrderPurpose::DcaSafety { rung: 0 });
        s.on_order_filled(&fill_of(&rung0[0], t0()));

        // Rung 0 does not fire again at the same depth
        assert!(s.calculate_orders(&snapshot(dec!(94), t0(), dec!(1))).is_empty());

        let rung1 = s.calculate_orders(&snapshot(dec!(90), t0(), dec!(1)));
        assert_eq!(rung1.len(), 1);
        assert_eq!(rung1[0].purpose, OrderPurpose::DcaSafety { rung: 1 });
        assert_eq!(rung1[0].quantity, Size::new(dec!(200) / dec!(90)).floor_to(dec!(0.00000001)));
    }

    #[test]
    fn test_drop_threshold_anchors_on_last_drop_buy() {
        let mut s = dca(config(DcaType::PriceDrop));
        s.calculate_orders(&snapshot(dec!(200), t0(), Decimal::ZERO));

        let first = s.calculate_orders(&snapshot(dec!(190), t0(), Decimal::ZERO));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].purpose, OrderPurpose::DcaPriceDrop);
        s.on_order_filled(&fill_of(&first[0], t0()));

        // Next threshold measured from the 190 fill: 180.5
        assert!(s.calculate_orders(&snapshot(dec!(181), t0(), dec!(1))).is_empty());
        assert_eq!(s.calculate_orders(&snapshot(dec!(180.5), t0(), dec!(1))).len(), 1);
    }

    #[test]
    fn test_hybrid_time_has_priority() {
        let mut s = dca(config(DcaType::Hybrid));
        s.state.reference_price = Some(Price::new(dec!(100)));
        let orders = s.calculate_orders(&snapshot(dec!(90), t0(), Decimal::ZERO));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].purpose, OrderPurpose::DcaScheduled);
    }
}
