//! In-memory store.
//!
//! Used directly in tests and paper trading, and as the index behind the
//! journal store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use gridbot_core::{BotId, BotStatus, BoxFuture, ClientOrderId, Order, Trade};
use parking_lot::RwLock;

use crate::error::{PersistenceError, PersistenceResult};
use crate::model::{Bot, BotStateUpdate, OrderLookup};
use crate::store::Persistence;

/// Indexed tables shared by the memory and journal stores.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    bots: HashMap<BotId, Bot>,
    orders: HashMap<ClientOrderId, Order>,
    venue_index: HashMap<String, ClientOrderId>,
    trades: Vec<Trade>,
    trade_keys: HashSet<(BotId, String)>,
}

impl Tables {
    pub(crate) fn check_new_bot(&self, bot: &Bot) -> PersistenceResult<()> {
        if self.bots.contains_key(&bot.id) {
            return Err(PersistenceError::Duplicate(format!("bot {}", bot.id)));
        }
        Ok(())
    }

    pub(crate) fn create_bot(&mut self, bot: Bot) -> PersistenceResult<()> {
        self.check_new_bot(&bot)?;
        self.bots.insert(bot.id, bot);
        Ok(())
    }

    pub(crate) fn load_bot(&self, id: BotId) -> PersistenceResult<Bot> {
        self.bots
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::BotNotFound(id))
    }

    pub(crate) fn running_bots(&self) -> Vec<Bot> {
        let mut bots: Vec<Bot> = self
            .bots
            .values()
            .filter(|b| b.status == BotStatus::Running)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        bots
    }

    pub(crate) fn save_bot_state(
        &mut self,
        id: BotId,
        update: BotStateUpdate,
        at: DateTime<Utc>,
    ) -> PersistenceResult<()> {
        let bot = self
            .bots
            .get_mut(&id)
            .ok_or(PersistenceError::BotNotFound(id))?;
        bot.status = update.status;
        bot.realized_pnl = update.realized_pnl;
        if let Some(blob) = update.strategy_state {
            bot.strategy_state = Some(blob);
        }
        bot.status_reason = update.reason;
        bot.updated_at = at;
        Ok(())
    }

    pub(crate) fn check_new_order(&self, order: &Order) -> PersistenceResult<()> {
        if self.orders.contains_key(&order.id) {
            return Err(PersistenceError::Duplicate(format!("order {}", order.id)));
        }
        Ok(())
    }

    pub(crate) fn create_order(&mut self, order: Order) -> PersistenceResult<()> {
        self.check_new_order(&order)?;
        self.index_venue_id(&order);
        self.orders.insert(order.id.clone(), order);
        Ok(())
    }

    pub(crate) fn check_existing_order(&self, order: &Order) -> PersistenceResult<()> {
        if !self.orders.contains_key(&order.id) {
            return Err(PersistenceError::OrderNotFound(order.id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn update_order(&mut self, order: Order) -> PersistenceResult<()> {
        self.check_existing_order(&order)?;
        self.index_venue_id(&order);
        self.orders.insert(order.id.clone(), order);
        Ok(())
    }

    pub(crate) fn find_order(&self, bot_id: BotId, lookup: &OrderLookup) -> Option<Order> {
        let id = match lookup {
            OrderLookup::Client(id) => Some(id),
            OrderLookup::Venue(venue_id) => self.venue_index.get(venue_id),
        }?;
        self.orders
            .get(id)
            .filter(|o| o.bot_id == bot_id)
            .cloned()
    }

    pub(crate) fn active_orders(&self, bot_id: BotId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .values()
            .filter(|o| o.bot_id == bot_id && o.is_active())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders
    }

    pub(crate) fn has_trade(&self, trade: &Trade) -> bool {
        self.trade_keys
            .contains(&(trade.bot_id, trade.venue_trade_id.clone()))
    }

    pub(crate) fn insert_trade(&mut self, trade: Trade) -> bool {
        if !self
            .trade_keys
            .insert((trade.bot_id, trade.venue_trade_id.clone()))
        {
            return false;
        }
        self.trades.push(trade);
        true
    }

    pub(crate) fn recent_trades(&self, bot_id: BotId, since: DateTime<Utc>) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| t.bot_id == bot_id && t.executed_at >= since)
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.sequence_key());
        trades
    }

    fn index_venue_id(&mut self, order: &Order) {
        if let Some(venue_id) = &order.venue_order_id {
            self.venue_index.insert(venue_id.clone(), order.id.clone());
        }
    }
}

/// Volatile store with a write counter.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    writes: AtomicU64,
    failing_order_updates: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful mutating calls since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` order updates with an I/O error, to exercise
    /// store outages.
    pub fn fail_order_updates(&self, n: u32) {
        self.failing_order_updates.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Option<PersistenceError> {
        self.failing_order_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| {
                PersistenceError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected order update failure",
                ))
            })
    }

    fn count<T>(&self, result: PersistenceResult<T>) -> PersistenceResult<T> {
        if result.is_ok() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

impl Persistence for MemoryStore {
    fn create_bot(&self, bot: Bot) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move { self.count(self.tables.write().create_bot(bot)) })
    }

    fn load_bot(&self, id: BotId) -> BoxFuture<'_, PersistenceResult<Bot>> {
        Box::pin(async move { self.tables.read().load_bot(id) })
    }

    fn list_running_bots(&self) -> BoxFuture<'_, PersistenceResult<Vec<Bot>>> {
        Box::pin(async move { Ok(self.tables.read().running_bots()) })
    }

    fn save_bot_state(
        &self,
        id: BotId,
        update: BotStateUpdate,
    ) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            let result = self.tables.write().save_bot_state(id, update, Utc::now());
            self.count(result)
        })
    }

    fn create_order(&self, order: Order) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move { self.count(self.tables.write().create_order(order)) })
    }

    fn update_order_status(&self, order: Order) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            if let Some(e) = self.injected_failure() {
                return Err(e);
            }
            self.count(self.tables.write().update_order(order))
        })
    }

    fn find_order(
        &self,
        bot_id: BotId,
        lookup: OrderLookup,
    ) -> BoxFuture<'_, PersistenceResult<Option<Order>>> {
        Box::pin(async move { Ok(self.tables.read().find_order(bot_id, &lookup)) })
    }

    fn list_active_orders(&self, bot_id: BotId) -> BoxFuture<'_, PersistenceResult<Vec<Order>>> {
        Box::pin(async move { Ok(self.tables.read().active_orders(bot_id)) })
    }

    fn insert_trade(&self, trade: Trade) -> BoxFuture<'_, PersistenceResult<bool>> {
        Box::pin(async move {
            let inserted = self.tables.write().insert_trade(trade);
            if inserted {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(inserted)
        })
    }

    fn list_recent_trades(
        &self,
        bot_id: BotId,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, PersistenceResult<Vec<Trade>>> {
        Box::pin(async move { Ok(self.tables.read().recent_trades(bot_id, since)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbot_core::{DesiredOrder, OrderSide, OrderStatus, Price, Size};
    use gridbot_strategy::{GridConfig, StrategyConfig};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    fn trade(bot_id: BotId, venue_trade_id: &str) -> Trade {
        Trade {
            id: Default::default(),
            bot_id,
            order_id: None,
            venue_order_id: Some("v1".to_string()),
            venue_trade_id: venue_trade_id.to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            price: Price::new(dec!(100)),
            quantity: Size::new(dec!(1)),
            fee: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            executed_at: Utc::now(),
        }
    }

    fn bot() -> Bot {
        Bot::new(
            "grid-1",
            "alice",
            "main",
            "BTC/USDT",
            StrategyConfig::Grid(GridConfig {
                lower_price: dec!(40000),
                upper_price: dec!(48000),
                grid_count: 20,
                investment: dec!(1000),
                stop_loss_percent: None,
                min_sell_profit_pct: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_bot_state_roundtrip() {
        let store = MemoryStore::new();
        let b = bot();
        let id = b.id;
        store.create_bot(b).await.unwrap();
        assert!(store.list_running_bots().await.unwrap().is_empty());

        store
            .save_bot_state(
                id,
                BotStateUpdate {
                    status: BotStatus::Running,
                    realized_pnl: dec!(1.5),
                    strategy_state: Some("{}".to_string()),
                    reason: None,
                },
            )
            .await
            .unwrap();
        let loaded = store.load_bot(id).await.unwrap();
        assert_eq!(loaded.status, BotStatus::Running);
        assert_eq!(loaded.realized_pnl, dec!(1.5));
        assert_eq!(store.list_running_bots().await.unwrap().len(), 1);
        assert_eq!(store.write_count(), 2);

        assert!(matches!(
            store.load_bot(BotId::new()).await,
            Err(PersistenceError::BotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_orders_active_and_lookup() {
        let store = MemoryStore::new();
        let bot_id = BotId::new();
        let desired = DesiredOrder::limit(
            OrderSide::Buy,
            Price::new(dec!(100)),
            Size::new(dec!(1)),
            0,
        );
        let mut order = Order::from_desired(bot_id, "BTC/USDT", &desired, Utc::now());
        store.create_order(order.clone()).await.unwrap();
        assert!(store.create_order(order.clone()).await.is_err());

        order.transition(OrderStatus::Submitting, Utc::now()).unwrap();
        order.transition(OrderStatus::Open, Utc::now()).unwrap();
        order.venue_order_id = Some("12345".to_string());
        store.update_order_status(order.clone()).await.unwrap();

        let found = store
            .find_order(bot_id, OrderLookup::Venue("12345".to_string()))
            .await
            .unwrap();
        assert_eq!(found.map(|o| o.id), Some(order.id.clone()));
        assert!(store
            .find_order(BotId::new(), OrderLookup::Client(order.id.clone()))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_active_orders(bot_id).await.unwrap().len(), 1);

        order.transition(OrderStatus::Cancelled, Utc::now()).unwrap();
        store.update_order_status(order).await.unwrap();
        assert!(store.list_active_orders(bot_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_trade_dedups_by_venue_trade_id() {
        let store = MemoryStore::new();
        let bot_id = BotId::new();
        assert!(store.insert_trade(trade(bot_id, "t1")).await.unwrap());
        assert!(!store.insert_trade(trade(bot_id, "t1")).await.unwrap());
        // Same venue trade id under another bot is a different record
        assert!(store.insert_trade(trade(BotId::new(), "t1")).await.unwrap());
        assert_eq!(
            store
                .list_recent_trades(bot_id, DateTime::<Utc>::MIN_UTC)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.write_count(), 2);
    }
}
