//! Grid strategy.
//!
//! Rungs `0..=grid_count` sit at `lower + spacing * i`. Each rung has a buy
//! slot and a sell slot holding a target quantity and the id of the order
//! currently working that target, if any.
//!
//! ```text
//! buy fill  at rung N (qty q) -> sell target at rung N+1 += q
//!                                (or the first rung clearing min_sell_profit_pct)
//! sell fill at rung N (qty q) -> buy  target at rung N-1 += q
//! ```
//!
//! A slot with a positive target and no active order produces a desired
//! order on the next tick, so rungs are recycled rather than left empty.
//! There is no rung above the top or below the bottom of the range.

use gridbot_core::{
    ActiveOrder, DesiredOrder, MarketSnapshot, OrderPurpose, OrderSide, Price, Size, SymbolRules,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GridConfig;
use crate::error::{StrategyError, StrategyResult};
use crate::fill::StrategyFill;

/// Target quantity for one side of a rung.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSlot {
    pub target: Size,
    pub active_order: Option<gridbot_core::ClientOrderId>,
}

impl LevelSlot {
    fn wants_order(&self) -> bool {
        self.target.is_positive() && self.active_order.is_none()
    }
}

/// One price rung.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: u32,
    pub price: Price,
    pub buy: LevelSlot,
    pub sell: LevelSlot,
    /// Quantity bought at this rung and not yet sold one rung up.
    pub position: Size,
    pub avg_buy_price: Option<Price>,
}

impl GridLevel {
    fn slot_mut(&mut self, side: OrderSide) -> &mut LevelSlot {
        match side {
            OrderSide::Buy => &mut self.buy,
            OrderSide::Sell => &mut self.sell,
        }
    }

    fn add_position(&mut self, quantity: Size, price: Price) {
        let prior = self
            .avg_buy_price
            .map(|p| self.position.notional(p))
            .unwrap_or(Decimal::ZERO);
        let total = self.position + quantity;
        self.avg_buy_price = Some(Price::new(
            (prior + quantity.notional(price)) / total.inner(),
        ));
        self.position = total;
    }

    /// Returns the quantity that could not be released from this rung.
    fn release_position(&mut self, quantity: Size) -> Size {
        let released = quantity.min(self.position);
        self.position -= released;
        if self.position.is_zero() {
            self.avg_buy_price = None;
        }
        quantity - released
    }
}

/// Grid lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    #[default]
    Active,
    /// Stop-loss hit: cancel resting orders, then market-sell the position.
    Unwinding,
    /// Position flat after a stop-loss. Terminal.
    Unwound,
}

/// Serializable grid state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridState {
    pub levels: Vec<GridLevel>,
    /// Initial order set has been laid down.
    pub seeded: bool,
    pub mode: GridMode,
}

#[derive(Debug, Clone)]
pub struct GridStrategy {
    config: GridConfig,
    step_size: Decimal,
    state: GridState,
}

impl GridStrategy {
    /// Build a grid from validated configuration.
    pub fn new(config: GridConfig, rules: &SymbolRules) -> StrategyResult<Self> {
        config.validate(rules.min_notional)?;
        let spacing = config.spacing();
        let levels = (0..=config.grid_count)
            .map(|i| GridLevel {
                index: i,
                price: Price::new(config.lower_price + spacing * Decimal::from(i)),
                buy: LevelSlot::default(),
                sell: LevelSlot::default(),
                position: Size::ZERO,
                avg_buy_price: None,
            })
            .collect();
        Ok(Self {
            config,
            step_size: rules.step_size,
            state: GridState {
                levels,
                seeded: false,
                mode: GridMode::Active,
            },
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.state.levels
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn mode(&self) -> GridMode {
        self.state.mode
    }

    pub fn is_unwinding(&self) -> bool {
        self.state.mode == GridMode::Unwinding
    }

    pub fn should_stop(&self) -> bool {
        self.state.mode == GridMode::Unwound
    }

    /// Quantity held across rungs.
    pub fn total_position(&self) -> Size {
        self.state
            .levels
            .iter()
            .fold(Size::ZERO, |acc, l| acc + l.position)
    }

    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        self.state
            .levels
            .iter()
            .filter_map(|l| {
                l.avg_buy_price
                    .map(|avg| (mark.inner() - avg.inner()) * l.position.inner())
            })
            .sum()
    }

    /// Replace state with a previously serialized copy.
    pub fn restore(&mut self, state: GridState) -> StrategyResult<()> {
        let expected = self.config.grid_count as usize + 1;
        if state.levels.len() != expected {
            return Err(StrategyError::StateMismatch(format!(
                "grid state has {} rungs, configuration has {expected}",
                state.levels.len()
            )));
        }
        for (restored, fresh) in state.levels.iter().zip(&self.state.levels) {
            if restored.price != fresh.price {
                return Err(StrategyError::StateMismatch(format!(
                    "rung {} price {} does not match configured {}",
                    fresh.index, restored.price, fresh.price
                )));
            }
        }
        self.state = state;
        Ok(())
    }

    /// Re-attach venue-confirmed active orders after a restart.
    ///
    /// A grid with any active rung order is already seeded, so it is never
    /// re-seeded on top of orders that survived the restart.
    pub fn rehydrate(&mut self, active: &[ActiveOrder]) {
        self.sync_active(active);
        if active.iter().any(|o| o.grid_level.is_some()) {
            self.state.seeded = true;
        }
    }

    pub fn calculate_orders(&mut self, snapshot: &MarketSnapshot) -> Vec<DesiredOrder> {
        let price = snapshot.price;

        match self.state.mode {
            GridMode::Unwound => return Vec::new(),
            GridMode::Unwinding => return self.unwind_orders(snapshot),
            GridMode::Active => {}
        }

        if self.stop_loss_breached(price) {
            warn!(
                price = %price,
                lower = %self.config.lower_price,
                upper = %self.config.upper_price,
                "Grid stop-loss breached, unwinding"
            );
            self.state.mode = GridMode::Unwinding;
            return self.unwind_orders(snapshot);
        }

        self.sync_active(&snapshot.active_orders);

        if !self.state.seeded {
            self.seed(price, snapshot.base_free);
        }

        let mut orders: Vec<DesiredOrder> = Vec::new();
        for level in &self.state.levels {
            for (side, slot) in [(OrderSide::Buy, &level.buy), (OrderSide::Sell, &level.sell)] {
                if slot.wants_order() {
                    orders.push(DesiredOrder::limit(side, level.price, slot.target, level.index));
                }
            }
        }
        orders.sort_by_key(|o| ((o.price.inner() - price.inner()).abs(), o.side));
        orders
    }

    pub fn on_order_filled(&mut self, fill: &StrategyFill) {
        if fill.purpose == Some(OrderPurpose::StopLoss) {
            self.release_from_bottom(fill.quantity);
            return;
        }
        let Some(index) = fill.grid_level else {
            debug!(side = %fill.side, qty = %fill.quantity, "Fill without grid level ignored");
            return;
        };
        let idx = index as usize;
        if idx >= self.state.levels.len() {
            warn!(level = index, "Fill for unknown grid level ignored");
            return;
        }
        let qty = fill.quantity;

        {
            let level = &mut self.state.levels[idx];
            let slot = level.slot_mut(fill.side);
            slot.target = slot.target.saturating_sub(qty);
        }

        match fill.side {
            OrderSide::Buy => {
                self.state.levels[idx].add_position(qty, fill.price);
                match self.sell_rung_for(idx, fill.price) {
                    Some(above) => {
                        self.state.levels[above].sell.target += qty;
                        debug!(level = above, qty = %qty, "Grid sell target raised");
                    }
                    None if idx + 1 < self.state.levels.len() => {
                        debug!(level = index, qty = %qty, "No rung clears minimum sell profit, holding");
                    }
                    None => {}
                }
            }
            OrderSide::Sell => {
                if idx > 0 {
                    let below = &mut self.state.levels[idx - 1];
                    let rest = below.release_position(qty);
                    below.buy.target += qty;
                    debug!(level = index - 1, qty = %qty, "Grid buy target raised");
                    // Sells pushed up the ladder close positions bought further down.
                    if self.config.min_sell_profit_pct.is_some() {
                        self.release_below(idx - 1, rest);
                    }
                }
            }
        }
    }

    fn stop_loss_breached(&self, price: Price) -> bool {
        let Some(pct) = self.config.stop_loss_percent else {
            return false;
        };
        let factor = pct / Decimal::ONE_HUNDRED;
        let floor = self.config.lower_price * (Decimal::ONE - factor);
        let ceiling = self.config.upper_price * (Decimal::ONE + factor);
        price.inner() < floor || price.inner() > ceiling
    }

    fn unwind_orders(&mut self, snapshot: &MarketSnapshot) -> Vec<DesiredOrder> {
        // Resting orders are cancelled by the engine before the position is sold.
        if !snapshot.active_orders.is_empty() {
            return Vec::new();
        }
        let held = snapshot.position.min(Size::new(snapshot.base_free));
        let qty = held.floor_to(self.step_size);
        if !qty.is_positive() {
            info!("Grid unwound");
            self.state.mode = GridMode::Unwound;
            return Vec::new();
        }
        vec![DesiredOrder::market(
            OrderSide::Sell,
            snapshot.price,
            qty,
            OrderPurpose::StopLoss,
        )]
    }

    /// Lay down the initial order set: buys strictly below price, sells
    /// strictly above as far as free base inventory covers them.
    fn seed(&mut self, price: Price, base_free: Decimal) {
        let per_grid = self.config.per_grid();
        let step = self.step_size;
        let mut inventory = Size::new(base_free);
        let mut buys = 0u32;
        let mut sells = 0u32;

        for level in self.state.levels.iter_mut() {
            if level.price < price {
                level.buy.target = Size::new(per_grid / level.price.inner()).floor_to(step);
                buys += 1;
            }
        }
        // Closest sells first so limited inventory sits nearest the market.
        for level in self.state.levels.iter_mut().filter(|l| l.price > price) {
            let qty = Size::new(per_grid / level.price.inner()).floor_to(step);
            if qty > inventory {
                break;
            }
            inventory -= qty;
            level.sell.target = qty;
            sells += 1;
        }

        self.state.seeded = true;
        info!(price = %price, buys, sells, "Grid seeded");
    }

    fn sync_active(&mut self, active: &[ActiveOrder]) {
        for level in self.state.levels.iter_mut() {
            let index = level.index;
            let find = |side: OrderSide| {
                active
                    .iter()
                    .find(|o| o.side == side && o.grid_level == Some(index))
                    .map(|o| o.id.clone())
            };
            level.buy.active_order = find(OrderSide::Buy);
            level.sell.active_order = find(OrderSide::Sell);
        }
    }

    /// First rung above `idx` whose price clears the minimum sell profit
    /// over `bought_at`.
    fn sell_rung_for(&self, idx: usize, bought_at: Price) -> Option<usize> {
        let Some(pct) = self.config.min_sell_profit_pct else {
            return (idx + 1 < self.state.levels.len()).then_some(idx + 1);
        };
        let floor = bought_at.inner() * (Decimal::ONE + pct / Decimal::ONE_HUNDRED);
        self.state
            .levels
            .iter()
            .skip(idx + 1)
            .find(|l| l.price.inner() >= floor)
            .map(|l| l.index as usize)
    }

    fn release_below(&mut self, idx: usize, mut quantity: Size) {
        for level in self.state.levels[..idx].iter_mut().rev() {
            if !quantity.is_positive() {
                break;
            }
            quantity = level.release_position(quantity);
        }
    }

    fn release_from_bottom(&mut self, mut quantity: Size) {
        for level in self.state.levels.iter_mut() {
            if !quantity.is_positive() {
                break;
            }
            quantity = level.release_position(quantity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridbot_core::{ClientOrderId, OrderStatus};
    use rust_decimal_macros::dec;

    fn config() -> GridConfig {
        GridConfig {
            lower_price: dec!(40000),
            upper_price: dec!(48000),
            grid_count: 20,
            investment: dec!(1000),
            stop_loss_percent: Some(dec!(5)),
            min_sell_profit_pct: None,
        }
    }

    fn grid() -> GridStrategy {
        GridStrategy::new(config(), &SymbolRules::unrestricted("BTC/USDT")).unwrap()
    }

    fn snapshot(price: Decimal, base_free: Decimal, active: Vec<ActiveOrder>) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTC/USDT".to_string(),
            price: Price::new(price),
            base_free,
            quote_free: dec!(100000),
            position: Size::new(base_free),
            active_orders: active,
            now: Utc::now(),
        }
    }

    fn as_active(orders: &[DesiredOrder]) -> Vec<ActiveOrder> {
        orders
            .iter()
            .map(|o| ActiveOrder {
                id: ClientOrderId::new(),
                side: o.side,
                price: o.price,
                quantity: o.quantity,
                filled_quantity: Size::ZERO,
                grid_level: o.grid_level,
                purpose: o.purpose,
                status: OrderStatus::Open,
            })
            .collect()
    }

    fn fill(side: OrderSide, level: u32, price: Price, qty: Size) -> StrategyFill {
        StrategyFill {
            order_id: None,
            side,
            price,
            quantity: qty,
            fee: Decimal::ZERO,
            grid_level: Some(level),
            purpose: Some(OrderPurpose::Grid),
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_rung_prices() {
        let g = grid();
        assert_eq!(g.levels().len(), 21);
        assert_eq!(g.levels()[0].price, Price::new(dec!(40000)));
        assert_eq!(g.levels()[1].price, Price::new(dec!(40400)));
        assert_eq!(g.levels()[20].price, Price::new(dec!(48000)));
    }

    #[test]
    fn test_initial_orders_buy_below_sell_above() {
        let mut g = grid();
        let orders = g.calculate_orders(&snapshot(dec!(44100), dec!(10), vec![]));

        let buys: Vec<_> = orders.iter().filter(|o| o.side == OrderSide::Buy).collect();
        let sells: Vec<_> = orders.iter().filter(|o| o.side == OrderSide::Sell).collect();
        assert_eq!(buys.len(), 11);
        assert_eq!(sells.len(), 10);
        assert!(buys.iter().all(|o| o.price.inner() < dec!(44100)));
        assert!(sells.iter().all(|o| o.price.inner() > dec!(44100)));

        // Closest rung first
        assert_eq!(orders[0].grid_level, Some(10));
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].quantity, Size::new(dec!(50) / dec!(44000)));
        assert_eq!(orders[1].grid_level, Some(11));
        assert_eq!(orders[1].side, OrderSide::Sell);
    }

    #[test]
    fn test_rung_at_price_gets_no_order() {
        let mut g = grid();
        let orders = g.calculate_orders(&snapshot(dec!(44000), dec!(10), vec![]));
        assert!(orders.iter().all(|o| o.grid_level != Some(10)));
        assert_eq!(orders.len(), 20);
    }

    #[test]
    fn test_unfunded_sells_not_seeded() {
        let mut g = grid();
        let orders = g.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        assert!(orders.iter().all(|o| o.side == OrderSide::Buy));
        assert_eq!(orders.len(), 11);
    }

    #[test]
    fn test_partial_inventory_seeds_nearest_sells() {
        let mut g = grid();
        // Enough base for the rungs at 44400 and 44800 only
        let covered = dec!(50) / dec!(44400) + dec!(50) / dec!(44800) + dec!(0.0001);
        let orders = g.calculate_orders(&snapshot(dec!(44100), covered, vec![]));

        let mut sells: Vec<_> = orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .map(|o| o.grid_level.unwrap())
            .collect();
        sells.sort_unstable();
        assert_eq!(sells, vec![11, 12]);
        // Unfunded rungs carry no target, so a later recycle sells exactly
        // what was bought
        assert!(g.levels()[13..].iter().all(|l| l.sell.target.is_zero()));
    }

    #[test]
    fn test_no_duplicates_while_active() {
        let mut g = grid();
        let first = g.calculate_orders(&snapshot(dec!(44100), dec!(10), vec![]));
        let active = as_active(&first);
        let second = g.calculate_orders(&snapshot(dec!(44100), dec!(10), active));
        assert!(second.is_empty());
    }

    #[test]
    fn test_buy_fill_recycles_to_sell_one_rung_up() {
        let mut g = grid();
        let first = g.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        let mut active = as_active(&first);

        let bought = first[0].quantity;
        active.retain(|o| o.grid_level != Some(10));
        g.on_order_filled(&fill(OrderSide::Buy, 10, Price::new(dec!(44000)), bought));

        let next = g.calculate_orders(&snapshot(dec!(43950), bought.inner(), active.clone()));
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].side, OrderSide::Sell);
        assert_eq!(next[0].grid_level, Some(11));
        assert_eq!(next[0].price, Price::new(dec!(44400)));
        assert_eq!(next[0].quantity, bought);
        assert_eq!(g.total_position(), bought);

        // Sell at 11 fills: buy the same quantity back at rung 10
        g.on_order_filled(&fill(OrderSide::Sell, 11, Price::new(dec!(44400)), bought));
        let next = g.calculate_orders(&snapshot(dec!(44450), Decimal::ZERO, active));
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].side, OrderSide::Buy);
        assert_eq!(next[0].grid_level, Some(10));
        assert_eq!(next[0].quantity, bought);
        assert!(g.total_position().is_zero());
    }

    #[test]
    fn test_no_rung_beyond_top() {
        let mut g = grid();
        g.calculate_orders(&snapshot(dec!(48100), Decimal::ZERO, vec![]));
        let qty = g.levels()[20].buy.target;
        g.on_order_filled(&fill(OrderSide::Buy, 20, Price::new(dec!(48000)), qty));
        assert!(g.levels().iter().all(|l| l.sell.target.is_zero()));
    }

    #[test]
    fn test_partial_fill_reduces_target() {
        let mut g = grid();
        g.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        let target = g.levels()[10].buy.target;
        let half = Size::new(target.inner() / dec!(2));
        g.on_order_filled(&fill(OrderSide::Buy, 10, Price::new(dec!(44000)), half));
        assert_eq!(g.levels()[10].buy.target, target - half);
        assert_eq!(g.levels()[11].sell.target, half);
    }

    #[test]
    fn test_min_sell_profit_skips_close_rungs() {
        // One rung is ~0.9% at 44000, so 1.5% needs two rungs
        let mut g = GridStrategy::new(
            GridConfig {
                min_sell_profit_pct: Some(dec!(1.5)),
                ..config()
            },
            &SymbolRules::unrestricted("BTC/USDT"),
        )
        .unwrap();
        g.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        let qty = g.levels()[10].buy.target;
        g.on_order_filled(&fill(OrderSide::Buy, 10, Price::new(dec!(44000)), qty));
        assert!(g.levels()[11].sell.target.is_zero());
        assert_eq!(g.levels()[12].sell.target, qty);

        // Selling at 12 re-arms the buy one rung down and closes the rung-10 position
        g.on_order_filled(&fill(OrderSide::Sell, 12, Price::new(dec!(44800)), qty));
        assert_eq!(g.levels()[11].buy.target, qty);
        assert!(g.total_position().is_zero());

        // Nothing above 47500 clears 1.5%: the position is held
        g.on_order_filled(&fill(OrderSide::Buy, 19, Price::new(dec!(47600)), Size::new(dec!(0.001))));
        assert!(g.levels()[20].sell.target.is_zero());
        assert_eq!(g.levels()[19].position, Size::new(dec!(0.001)));
    }

    #[test]
    fn test_stop_loss_unwinds_then_stops() {
        let mut g = grid();
        let first = g.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        let active = as_active(&first);

        // 37000 < 40000 * 0.95: resting orders must go first
        let orders = g.calculate_orders(&snapshot(dec!(37000), dec!(0.5), active));
        assert!(orders.is_empty());
        assert!(g.is_unwinding());

        let orders = g.calculate_orders(&snapshot(dec!(37000), dec!(0.5), vec![]));
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].purpose, OrderPurpose::StopLoss);
        assert_eq!(orders[0].quantity, Size::new(dec!(0.5)));
        assert!(!g.should_stop());

        let orders = g.calculate_orders(&snapshot(dec!(37000), Decimal::ZERO, vec![]));
        assert!(orders.is_empty());
        assert!(g.should_stop());
    }

    #[test]
    fn test_restore_rejects_mismatched_state() {
        let mut g = grid();
        let mut other = GridStrategy::new(
            GridConfig {
                grid_count: 10,
                ..config()
            },
            &SymbolRules::unrestricted("BTC/USDT"),
        )
        .unwrap();
        other.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        assert!(g.restore(other.state().clone()).is_err());
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut g = grid();
        g.calculate_orders(&snapshot(dec!(44100), Decimal::ZERO, vec![]));
        g.on_order_filled(&fill(OrderSide::Buy, 10, Price::new(dec!(44000)), Size::new(dec!(0.01))));
        assert_eq!(g.unrealized_pnl(Price::new(dec!(44500))), dec!(5));
    }
}
