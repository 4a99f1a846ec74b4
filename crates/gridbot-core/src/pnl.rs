//! FIFO realized P&L.
//!
//! The live fill path and the reconciliation sweep both go through
//! [`FifoLedger::apply`], so a trade recovered from venue history gets
//! exactly the P&L it would have received had its fill arrived live.
//!
//! Buy fees are folded into the lot's cost basis; sell fees are deducted
//! from the realized amount of the sell. Neither changes order quantity.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::execution::Trade;
use crate::order::OrderSide;
use crate::types::split_symbol;
use crate::{Price, Size};

/// Convert a venue fee into quote currency.
///
/// Venues charge fees either in the quote asset or in the asset received
/// (base on buys). A fee denominated in base is valued at the fill price.
/// Unknown third-party assets are treated as quote.
pub fn fee_to_quote(fee: Decimal, fee_asset: Option<&str>, symbol: &str, price: Price) -> Decimal {
    let Some(asset) = fee_asset else {
        return fee;
    };
    match split_symbol(symbol) {
        Ok((base, _)) if base.eq_ignore_ascii_case(asset) => fee * price.inner(),
        _ => fee,
    }
}

/// Unconsumed bought quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub quantity: Size,
    /// Purchase price plus buy fee per unit.
    pub cost_per_unit: Decimal,
}

/// Result of pushing one fill through the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FifoOutcome {
    pub realized_pnl: Decimal,
    /// Sold quantity with no prior buy to match (e.g. inventory the bot did
    /// not buy). Realizes nothing.
    pub unmatched: Size,
}

/// Per bot+symbol queue of open buy lots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoLedger {
    lots: VecDeque<Lot>,
}

impl FifoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the ledger from recorded trades, in execution order.
    pub fn replay<'a>(trades: impl IntoIterator<Item = &'a Trade>) -> Self {
        let mut sorted: Vec<&Trade> = trades.into_iter().collect();
        sorted.sort_by_key(|t| t.sequence_key());
        let mut ledger = Self::new();
        for t in sorted {
            ledger.apply(t.side, t.quantity, t.price, t.fee);
        }
        ledger
    }

    /// Apply one fill. `fee_quote` must already be in quote currency.
    pub fn apply(
        &mut self,
        side: OrderSide,
        quantity: Size,
        price: Price,
        fee_quote: Decimal,
    ) -> FifoOutcome {
        if !quantity.is_positive() {
            return FifoOutcome::default();
        }
        match side {
            OrderSide::Buy => {
                self.lots.push_back(Lot {
                    quantity,
                    cost_per_unit: price.inner() + fee_quote / quantity.inner(),
                });
                FifoOutcome::default()
            }
            OrderSide::Sell => self.consume(quantity, price, fee_quote),
        }
    }

    fn consume(&mut self, quantity: Size, price: Price, fee_quote: Decimal) -> FifoOutcome {
        let mut remaining = quantity;
        let mut gross = Decimal::ZERO;
        let mut matched_any = false;

        while remaining.is_positive() {
            let Some(front) = self.lots.front_mut() else {
                break;
            };
            let take = remaining.min(front.quantity);
            gross += (price.inner() - front.cost_per_unit) * take.inner();
            front.quantity -= take;
            remaining -= take;
            matched_any = true;
            if front.quantity.is_zero() {
                self.lots.pop_front();
            }
        }

        // The whole sell fee is charged against the matched portion; an
        // entirely unmatched sell realizes nothing.
        let realized_pnl = if matched_any { gross - fee_quote } else { Decimal::ZERO };
        FifoOutcome {
            realized_pnl,
            unmatched: remaining,
        }
    }

    /// Total quantity held across open lots.
    pub fn open_quantity(&self) -> Size {
        self.lots.iter().fold(Size::ZERO, |acc, l| acc + l.quantity)
    }

    /// Mark-to-market P&L of open lots at `mark`. Negative means a loss.
    pub fn unrealized(&self, mark: Price) -> Decimal {
        self.lots
            .iter()
            .map(|l| (mark.inner() - l.cost_per_unit) * l.quantity.inner())
            .sum()
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::BotId;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn p(d: Decimal) -> Price {
        Price::new(d)
    }

    fn s(d: Decimal) -> Size {
        Size::new(d)
    }

    #[test]
    fn test_round_trip_with_fees_is_exact() {
        let mut ledger = FifoLedger::new();
        let buy = ledger.apply(OrderSide::Buy, s(dec!(1)), p(dec!(100)), dec!(0.1));
        assert_eq!(buy.realized_pnl, Decimal::ZERO);

        let sell = ledger.apply(OrderSide::Sell, s(dec!(1)), p(dec!(110)), dec!(0.11));
        assert_eq!(sell.realized_pnl, dec!(9.79));
        assert!(sell.unmatched.is_zero());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_sell_matches_oldest_lots_first() {
        let mut ledger = FifoLedger::new();
        ledger.apply(OrderSide::Buy, s(dec!(1)), p(dec!(100)), Decimal::ZERO);
        ledger.apply(OrderSide::Buy, s(dec!(1)), p(dec!(120)), Decimal::ZERO);

        let out = ledger.apply(OrderSide::Sell, s(dec!(1.5)), p(dec!(130)), Decimal::ZERO);
        // 1 @ (130-100) + 0.5 @ (130-120)
        assert_eq!(out.realized_pnl, dec!(35));
        assert_eq!(ledger.open_quantity(), s(dec!(0.5)));
        assert_eq!(ledger.unrealized(p(dec!(110))), dec!(-5));
    }

    #[test]
    fn test_oversell_reports_unmatched() {
        let mut ledger = FifoLedger::new();
        ledger.apply(OrderSide::Buy, s(dec!(1)), p(dec!(100)), Decimal::ZERO);
        let out = ledger.apply(OrderSide::Sell, s(dec!(3)), p(dec!(90)), Decimal::ZERO);
        assert_eq!(out.realized_pnl, dec!(-10));
        assert_eq!(out.unmatched, s(dec!(2)));

        let orphan = ledger.apply(OrderSide::Sell, s(dec!(1)), p(dec!(90)), dec!(0.5));
        assert_eq!(orphan.realized_pnl, Decimal::ZERO);
        assert_eq!(orphan.unmatched, s(dec!(1)));
    }

    #[test]
    fn test_fee_to_quote_base_asset() {
        let price = p(dec!(40000));
        assert_eq!(
            fee_to_quote(dec!(0.0001), Some("BTC"), "BTC/USDT", price),
            dec!(4)
        );
        assert_eq!(fee_to_quote(dec!(4), Some("USDT"), "BTC/USDT", price), dec!(4));
        assert_eq!(fee_to_quote(dec!(4), None, "BTC/USDT", price), dec!(4));
    }

    #[test]
    fn test_replay_sorts_by_execution() {
        let bot = BotId::new();
        let mk = |id: &str, side, px: Decimal, secs: i64| Trade {
            id: Uuid::new_v4(),
            bot_id: bot,
            order_id: None,
            venue_order_id: None,
            venue_trade_id: id.to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            price: p(px),
            quantity: s(dec!(1)),
            fee: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            executed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        };
        // Supplied out of order: the sell must be matched after both buys.
        let trades = vec![
            mk("12", OrderSide::Sell, dec!(150), 20),
            mk("11", OrderSide::Buy, dec!(120), 10),
            mk("10", OrderSide::Buy, dec!(100), 10),
        ];
        let mut ledger = FifoLedger::replay(&trades);
        assert_eq!(ledger.open_quantity(), s(dec!(1)));
        let out = ledger.apply(OrderSide::Sell, s(dec!(1)), p(dec!(130)), Decimal::ZERO);
        // Lot at 100 was consumed by trade 12, leaving 120.
        assert_eq!(out.realized_pnl, dec!(10));
    }
}
