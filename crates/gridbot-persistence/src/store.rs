//! Persistence contract.
//!
//! Every call is durable once it returns. The engine never relies on an
//! in-memory write surviving a crash.

use chrono::{DateTime, Utc};
use gridbot_core::{BotId, BoxFuture, Order, Trade};

use crate::error::PersistenceResult;
use crate::model::{Bot, BotStateUpdate, OrderLookup};

/// Durable store consumed by the engine.
///
/// Object-safe so one store can be shared as `Arc<dyn Persistence>`.
pub trait Persistence: Send + Sync {
    fn create_bot(&self, bot: Bot) -> BoxFuture<'_, PersistenceResult<()>>;

    fn load_bot(&self, id: BotId) -> BoxFuture<'_, PersistenceResult<Bot>>;

    /// Bots persisted as `running`, for rehydration on process start.
    fn list_running_bots(&self) -> BoxFuture<'_, PersistenceResult<Vec<Bot>>>;

    fn save_bot_state(
        &self,
        id: BotId,
        update: BotStateUpdate,
    ) -> BoxFuture<'_, PersistenceResult<()>>;

    fn create_order(&self, order: Order) -> BoxFuture<'_, PersistenceResult<()>>;

    /// Overwrite a stored order's mutable fields (status, fills, venue id).
    fn update_order_status(&self, order: Order) -> BoxFuture<'_, PersistenceResult<()>>;

    fn find_order(
        &self,
        bot_id: BotId,
        lookup: OrderLookup,
    ) -> BoxFuture<'_, PersistenceResult<Option<Order>>>;

    fn list_active_orders(&self, bot_id: BotId) -> BoxFuture<'_, PersistenceResult<Vec<Order>>>;

    /// Append a trade. Returns `false` when the venue trade id is already
    /// recorded for this bot.
    fn insert_trade(&self, trade: Trade) -> BoxFuture<'_, PersistenceResult<bool>>;

    fn list_recent_trades(
        &self,
        bot_id: BotId,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, PersistenceResult<Vec<Trade>>>;
}
