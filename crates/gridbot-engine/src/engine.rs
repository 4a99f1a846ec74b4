//! Per-bot engine: lifecycle state machine and the tick.
//!
//! # Tick
//!
//! ```text
//! tick()
//!   ├─ overlap guard            → Skipped
//!   ├─ not running              → Idle
//!   ├─ ticker, active orders, balances
//!   ├─ breaker.check_loss       → Tripped (bot → error, orders cancelled)
//!   ├─ Strategy::calculate_orders(snapshot), persist state
//!   ├─ per desired order:
//!   │    round → cooldown → balance check → breaker.admit_order → OrderManager.submit
//!   └─ Strategy::should_stop    → Finished (bot → stopped)
//! ```
//!
//! Ticks are safe to skip: every tick recomputes from persisted orders and
//! the venue, nothing carries over in memory.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use gridbot_core::{
    split_symbol, ActiveOrder, BotId, BotStatus, DesiredOrder, FillEvent,
    MarketSnapshot, OrderSide, OrderType, SymbolRules,
};
use gridbot_exchange::{ExchangeConnector, ExchangeResult, RetryPolicy};
use gridbot_persistence::{Bot, BotStateUpdate, Persistence};
use gridbot_risk::{CircuitBreaker, RiskError, TripReason};
use gridbot_strategy::Strategy;
use gridbot_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::notify::{BotEvent, NotificationSink};
use crate::order_manager::{FillOutcome, FillSource, OrderManager};
use crate::reconcile::Reconciler;
use crate::settings::EngineSettings;

/// What one `tick` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Previous tick still in progress.
    Skipped,
    /// Bot not running.
    Idle,
    Ran { submitted: usize, skipped: usize },
    /// Circuit breaker tripped; the bot is now in `error`.
    Tripped(TripReason),
    /// Strategy completed; the bot is now `stopped`.
    Finished,
}

/// Last state written with `save_bot_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SavedState {
    status: BotStatus,
    realized_pnl: Decimal,
    blob: String,
    reason: Option<String>,
}

pub struct BotEngine {
    bot_id: BotId,
    name: String,
    account: String,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    rules: SymbolRules,
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn NotificationSink>,
    settings: EngineSettings,
    breaker: CircuitBreaker,
    orders: OrderManager,
    status: RwLock<BotStatus>,
    status_reason: RwLock<Option<String>>,
    /// Held for the duration of a tick, a stop or a reconciliation pass.
    pub(crate) tick_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    /// (side, level) pairs already reported as short of balance.
    balance_warned: Mutex<HashSet<(OrderSide, Option<u32>)>>,
    /// (side, level) pairs whose last submission failed, until when they
    /// are left alone.
    cooldowns: Mutex<HashMap<(OrderSide, Option<u32>), DateTime<Utc>>>,
    last_saved: tokio::sync::Mutex<Option<SavedState>>,
}

impl BotEngine {
    /// Start (or rehydrate) a bot.
    ///
    /// Restores the persisted strategy blob, rebuilds the ledger and slot
    /// reservations from stored trades and orders, reconciles against the
    /// venue, then attaches the surviving active orders to the strategy so
    /// a grid that is already seeded is never seeded again.
    pub async fn start(
        bot: Bot,
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<dyn Persistence>,
        notifier: Arc<dyn NotificationSink>,
        retry: RetryPolicy,
        settings: EngineSettings,
    ) -> EngineResult<Arc<Self>> {
        if bot.status == BotStatus::Error {
            return Err(EngineError::InvalidState {
                bot_id: bot.id,
                status: bot.status,
                action: "start",
            });
        }
        let (base, quote) = split_symbol(&bot.symbol)?;
        let (base_asset, quote_asset) = (base.to_string(), quote.to_string());

        let rules = match tokio::time::timeout(
            settings.venue_timeout(),
            connector.get_symbol_rules(&bot.symbol),
        )
        .await
        {
            Ok(rules) => rules?,
            Err(_) => return Err(EngineError::Timeout("get_symbol_rules")),
        };

        let mut strategy = Strategy::from_config(&bot.strategy, &rules)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        bot.circuit_breaker
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let rehydrating = bot.strategy_state.is_some();
        if let Some(raw) = &bot.strategy_state {
            strategy.restore_state(raw)?;
        }

        let breaker = CircuitBreaker::new(bot.circuit_breaker.clone(), bot.strategy.investment());
        let orders = OrderManager::new(
            bot.id,
            bot.symbol.clone(),
            connector.clone(),
            store.clone(),
            notifier.clone(),
            retry,
            settings.venue_timeout(),
            strategy,
        );

        let engine = Arc::new(Self {
            bot_id: bot.id,
            name: bot.name,
            account: bot.account,
            symbol: bot.symbol,
            base_asset,
            quote_asset,
            rules,
            connector,
            store,
            notifier,
            settings: settings.clone(),
            breaker,
            orders,
            status: RwLock::new(bot.status),
            status_reason: RwLock::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            balance_warned: Mutex::new(HashSet::new()),
            cooldowns: Mutex::new(HashMap::new()),
            last_saved: tokio::sync::Mutex::new(None),
        });

        engine.orders.load().await?;
        let report = Reconciler::new(settings).reconcile_bot(&engine, false).await?;

        let active = engine.orders.active_orders().await?;
        {
            let snapshot: Vec<ActiveOrder> = active.iter().map(ActiveOrder::from).collect();
            engine.orders.lock_book().await.strategy.rehydrate(&snapshot);
        }

        {
            let mut status = engine.status.write();
            if *status != BotStatus::Running {
                *status = status.transition(BotStatus::Running)?;
            }
        }
        engine.save_state().await?;

        info!(
            bot_id = %engine.bot_id,
            name = %engine.name,
            symbol = %engine.symbol,
            account = %engine.account,
            rehydrating,
            active_orders = active.len(),
            recovered_trades = report.trades_recovered,
            "Bot started"
        );
        Ok(engine)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn rules(&self) -> &SymbolRules {
        &self.rules
    }

    pub fn status(&self) -> BotStatus {
        *self.status.read()
    }

    pub fn status_reason(&self) -> Option<String> {
        self.status_reason.read().clone()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub fn connector(&self) -> &Arc<dyn ExchangeConnector> {
        &self.connector
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Cancelled on stop or detach. Loops driving this bot exit on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn realized_pnl(&self) -> Decimal {
        self.orders.lock_book().await.realized_pnl
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    pub async fn tick(&self) -> EngineResult<TickOutcome> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            Metrics::tick_skipped(&self.bot_id.to_string());
            debug!(bot_id = %self.bot_id, "Tick already in progress, skipping");
            return Ok(TickOutcome::Skipped);
        };
        if self.shutdown.is_cancelled() || self.status() != BotStatus::Running {
            return Ok(TickOutcome::Idle);
        }

        let started = Instant::now();
        let outcome = self.run_tick().await;
        Metrics::tick_duration(
            &self.bot_id.to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        outcome
    }

    async fn run_tick(&self) -> EngineResult<TickOutcome> {
        let ticker = self
            .venue("get_ticker", self.connector.get_ticker(&self.symbol))
            .await?;
        let market = ticker.last;

        let unrealized = self.orders.lock_book().await.ledger.unrealized(market);
        self.breaker.update_unrealized(unrealized);
        if let Err(RiskError::Tripped(reason)) = self.breaker.check_loss(Utc::now()) {
            self.trip(reason.clone()).await?;
            return Ok(TickOutcome::Tripped(reason));
        }

        let mut active = self.orders.active_orders().await?;
        let wants_flat = self.orders.lock_book().await.strategy.wants_flat_book();
        if wants_flat && !active.is_empty() {
            info!(bot_id = %self.bot_id, resting = active.len(), "Strategy unwinding, cancelling resting orders");
            self.orders.cancel_all().await?;
            active = self.orders.active_orders().await?;
        }

        let base = self
            .venue("get_balance", self.connector.get_balance(&self.base_asset))
            .await?;
        let quote = self
            .venue("get_balance", self.connector.get_balance(&self.quote_asset))
            .await?;

        let desired = {
            let mut book = self.orders.lock_book().await;
            let snapshot = MarketSnapshot {
                symbol: self.symbol.clone(),
                price: market,
                base_free: base.free,
                quote_free: quote.free,
                position: book.ledger.open_quantity(),
                active_orders: active.iter().map(ActiveOrder::from).collect(),
                now: Utc::now(),
            };
            book.strategy.calculate_orders(&snapshot)
        };
        self.save_state().await?;

        let mut base_free = base.free;
        let mut quote_free = quote.free;
        let mut submitted = 0;
        let mut skipped = 0;
        for desired in desired {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(order) = self.conform(desired) else {
                skipped += 1;
                continue;
            };
            if order.slot().is_some_and(|slot| self.orders.slot_taken(&slot)) {
                skipped += 1;
                continue;
            }
            if self.cooling_down(&order) {
                skipped += 1;
                continue;
            }
            if !self.reserve_balance(&order, &mut base_free, &mut quote_free) {
                skipped += 1;
                continue;
            }

            match self.breaker.admit_order(order.price, market, Utc::now()) {
                Ok(()) => {}
                Err(RiskError::Tripped(reason)) => {
                    self.trip(reason.clone()).await?;
                    return Ok(TickOutcome::Tripped(reason));
                }
                Err(e) => {
                    warn!(bot_id = %self.bot_id, side = %order.side, level = ?order.grid_level, error = %e, "Order refused by risk gate");
                    skipped += 1;
                    continue;
                }
            }

            match self.orders.submit(&order).await {
                Ok(_) => {
                    self.cooldowns.lock().remove(&(order.side, order.grid_level));
                    submitted += 1;
                }
                Err(EngineError::DuplicateSlot { side, level }) => {
                    debug!(bot_id = %self.bot_id, %side, level, "Slot taken concurrently, skipping");
                    skipped += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if matches!(e, EngineError::Exchange(_)) {
                        let until = Utc::now() + self.settings.failed_order_cooldown();
                        self.cooldowns
                            .lock()
                            .insert((order.side, order.grid_level), until);
                    }
                    warn!(bot_id = %self.bot_id, side = %order.side, level = ?order.grid_level, error = %e, "Order not placed");
                    skipped += 1;
                }
            }
        }

        let finished = self.orders.lock_book().await.strategy.should_stop();
        if finished {
            self.halt(BotStatus::Stopped, "strategy completed".to_string())
                .await?;
            return Ok(TickOutcome::Finished);
        }

        if submitted > 0 {
            debug!(bot_id = %self.bot_id, submitted, skipped, "Tick complete");
        }
        Ok(TickOutcome::Ran { submitted, skipped })
    }

    /// Round to venue increments. `None` when the result is below the
    /// venue's minimums.
    fn conform(&self, desired: DesiredOrder) -> Option<DesiredOrder> {
        let price = match desired.order_type {
            OrderType::Limit => self.rules.round_price(desired.price),
            OrderType::Market => desired.price,
        };
        let quantity = self.rules.round_quantity(desired.quantity);
        if !self.rules.accepts(price, quantity) {
            debug!(
                bot_id = %self.bot_id,
                side = %desired.side,
                %price,
                %quantity,
                min_qty = %self.rules.min_qty,
                min_notional = %self.rules.min_notional,
                "Order below venue minimums, skipping"
            );
            return None;
        }
        Some(DesiredOrder {
            price,
            quantity,
            ..desired
        })
    }

    /// Whether the order's (side, level) is blocked after a failed
    /// submission. Expired entries are dropped.
    fn cooling_down(&self, order: &DesiredOrder) -> bool {
        let key = (order.side, order.grid_level);
        let mut cooldowns = self.cooldowns.lock();
        match cooldowns.get(&key) {
            Some(until) if *until > Utc::now() => {
                debug!(bot_id = %self.bot_id, side = %order.side, level = ?order.grid_level, %until, "Slot cooling down after failed submission");
                true
            }
            Some(_) => {
                cooldowns.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Pre-submission balance check. Each shortfall is logged once until it
    /// clears.
    fn reserve_balance(
        &self,
        order: &DesiredOrder,
        base_free: &mut Decimal,
        quote_free: &mut Decimal,
    ) -> bool {
        let (asset, free, needed) = match order.side {
            OrderSide::Buy => (&self.quote_asset, quote_free, order.notional()),
            OrderSide::Sell => (&self.base_asset, base_free, order.quantity.inner()),
        };
        let key = (order.side, order.grid_level);
        if *free < needed {
            if self.balance_warned.lock().insert(key) {
                let err = EngineError::InsufficientBalance {
                    asset: asset.clone(),
                    needed,
                    free: *free,
                };
                Metrics::order_error(&self.bot_id.to_string(), "insufficient_balance");
                warn!(bot_id = %self.bot_id, side = %order.side, level = ?order.grid_level, error = %err, "Order skipped");
            }
            return false;
        }
        *free -= needed;
        self.balance_warned.lock().remove(&key);
        true
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    /// Apply a venue execution to this bot.
    pub async fn on_fill(
        &self,
        fill: &FillEvent,
        source: FillSource,
        adopt_unmatched: bool,
    ) -> EngineResult<FillOutcome> {
        let outcome = self.orders.apply_fill(fill, source, adopt_unmatched).await?;
        if let FillOutcome::Applied { trade, .. } = &outcome {
            let bot = self.bot_id.to_string();
            self.breaker.record_realized(trade.realized_pnl, Utc::now());
            Metrics::fill_applied(&bot, trade.side.as_str(), source.as_str());
            let pnl = self.realized_pnl().await;
            Metrics::realized_pnl(&bot, pnl.to_f64().unwrap_or_default());
            self.save_state().await?;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop the bot and cancel its resting orders. Idempotent.
    ///
    /// Waits for an in-flight tick to finish; a submission is never cut
    /// off halfway.
    pub async fn stop(&self, reason: &str) -> EngineResult<()> {
        self.shutdown.cancel();
        let _guard = self.tick_lock.lock().await;
        match self.status() {
            BotStatus::Stopped | BotStatus::Error => Ok(()),
            BotStatus::Running | BotStatus::Paused => {
                self.halt(BotStatus::Stopped, reason.to_string()).await
            }
        }
    }

    /// Stop placing orders; resting orders stay on the book.
    pub async fn pause(&self) -> EngineResult<()> {
        let _guard = self.tick_lock.lock().await;
        self.set_status(BotStatus::Paused, None)?;
        self.save_state().await?;
        info!(bot_id = %self.bot_id, "Bot paused");
        Ok(())
    }

    pub async fn resume(&self) -> EngineResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::InvalidState {
                bot_id: self.bot_id,
                status: self.status(),
                action: "resume",
            });
        }
        let _guard = self.tick_lock.lock().await;
        self.set_status(BotStatus::Running, None)?;
        self.save_state().await?;
        info!(bot_id = %self.bot_id, "Bot resumed");
        Ok(())
    }

    /// Operator reset out of `error`. Clears the breaker; the bot stays
    /// stopped until started again.
    pub async fn reset_error(&self) -> EngineResult<()> {
        let _guard = self.tick_lock.lock().await;
        self.set_status(BotStatus::Stopped, Some("reset by operator".to_string()))?;
        self.breaker.reset();
        self.cooldowns.lock().clear();
        self.save_state().await?;
        info!(bot_id = %self.bot_id, "Bot reset");
        Ok(())
    }

    /// Release the engine on process shutdown without touching orders or
    /// status; the bot is rehydrated on the next start.
    pub fn detach(&self) {
        self.shutdown.cancel();
        info!(bot_id = %self.bot_id, status = %self.status(), "Bot detached");
    }

    async fn trip(&self, reason: TripReason) -> EngineResult<()> {
        Metrics::breaker_tripped(&self.bot_id.to_string(), reason.kind());
        error!(
            bot_id = %self.bot_id,
            kind = reason.kind(),
            %reason,
            "Circuit breaker tripped"
        );
        self.notifier.notify(BotEvent::CircuitBreakerTriggered {
            bot_id: self.bot_id,
            kind: reason.kind().to_string(),
            detail: reason.to_string(),
        });
        self.halt(BotStatus::Error, format!("circuit breaker: {reason}"))
            .await
    }

    /// Move to `stopped` or `error`, cancel resting orders, persist and notify.
    /// Caller holds the tick lock.
    async fn halt(&self, next: BotStatus, reason: String) -> EngineResult<()> {
        if self.status() == next {
            return Ok(());
        }
        self.set_status(next, Some(reason.clone()))?;
        self.shutdown.cancel();

        let cancelled = match self.orders.cancel_all().await {
            Ok(n) => n,
            Err(e) => {
                error!(bot_id = %self.bot_id, error = %e, "Cancelling orders on halt failed");
                0
            }
        };
        self.save_state().await?;

        info!(bot_id = %self.bot_id, status = %next, %reason, cancelled, "Bot halted");
        self.notifier.notify(BotEvent::BotStopped {
            bot_id: self.bot_id,
            reason,
        });
        Ok(())
    }

    fn set_status(&self, next: BotStatus, reason: Option<String>) -> EngineResult<()> {
        {
            let mut status = self.status.write();
            if *status == next {
                return Ok(());
            }
            *status = status.transition(next)?;
        }
        *self.status_reason.write() = reason;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Crate-internal helpers
    // ------------------------------------------------------------------

    /// Persist status, P&L and strategy blob. Skips the write when nothing
    /// changed since the last one.
    pub(crate) async fn save_state(&self) -> EngineResult<bool> {
        let mut last = self.last_saved.lock().await;
        let (blob, realized_pnl) = {
            let book = self.orders.lock_book().await;
            (book.strategy.serialize_state()?, book.realized_pnl)
        };
        let current = SavedState {
            status: self.status(),
            realized_pnl,
            blob,
            reason: self.status_reason(),
        };
        if last.as_ref() == Some(&current) {
            return Ok(false);
        }

        self.store
            .save_bot_state(
                self.bot_id,
                BotStateUpdate {
                    status: current.status,
                    realized_pnl: current.realized_pnl,
                    strategy_state: Some(current.blob.clone()),
                    reason: current.reason.clone(),
                },
            )
            .await?;
        *last = Some(current);
        Ok(true)
    }

    pub(crate) fn notify(&self, event: BotEvent) {
        self.notifier.notify(event);
    }

    /// Run a venue call under the configured timeout.
    pub(crate) async fn venue<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = ExchangeResult<T>>,
    ) -> EngineResult<T> {
        match tokio::time::timeout(self.settings.venue_timeout(), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout(what)),
        }
    }
}

impl std::fmt::Debug for BotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotEngine")
            .field("bot_id", &self.bot_id)
            .field("name", &self.name)
            .field("symbol", &self.symbol)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbot_core::Price;
    use gridbot_exchange::PaperExchange;
    use gridbot_persistence::MemoryStore;
    use gridbot_strategy::{GridConfig, StrategyConfig};
    use rust_decimal_macros::dec;

    use crate::notify::{ChannelNotifier, NullNotifier};

    const SYMBOL: &str = "ETH/USDT";

    fn grid_bot() -> Bot {
        Bot::new(
            "eth-grid",
            "ops",
            "paper",
            SYMBOL,
            StrategyConfig::Grid(GridConfig {
                lower_price: dec!(90),
                upper_price: dec!(110),
                grid_count: 5,
                investment: dec!(1000),
                stop_loss_percent: Some(dec!(5)),
                min_sell_profit_pct: None,
            }),
        )
    }

    fn venue() -> Arc<PaperExchange> {
        let venue = Arc::new(PaperExchange::new());
        venue.deposit("USDT", dec!(10000));
        venue.deposit("ETH", dec!(50));
        venue.set_price(SYMBOL, Price::new(dec!(100)));
        venue
    }

    async fn start(bot: Bot, venue: Arc<PaperExchange>, store: Arc<MemoryStore>) -> Arc<BotEngine> {
        store.create_bot(bot.clone()).await.unwrap();
        BotEngine::start(
            bot,
            venue,
            store,
            Arc::new(NullNotifier),
            RetryPolicy::immediate(1),
            EngineSettings::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_then_tick_places_grid() {
        let venue = venue();
        let store = Arc::new(MemoryStore::new());
        let engine = start(grid_bot(), venue.clone(), store.clone()).await;
        assert_eq!(engine.status(), BotStatus::Running);

        let outcome = engine.tick().await.unwrap();
        let TickOutcome::Ran { submitted, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        // Three buys below 100, three sells above
        assert_eq!(submitted, 6);
        assert_eq!(venue.open_order_count(SYMBOL), 6);

        // Second tick finds every slot occupied
        let again = engine.tick().await.unwrap();
        assert!(matches!(again, TickOutcome::Ran { submitted: 0, .. }));
        assert_eq!(venue.create_calls(), 6);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_cancels() {
        let venue = venue();
        let store = Arc::new(MemoryStore::new());
        let (notifier, mut events) = ChannelNotifier::new();
        let bot = grid_bot();
        store.create_bot(bot.clone()).await.unwrap();
        let engine = BotEngine::start(
            bot,
            venue.clone(),
            store.clone(),
            Arc::new(notifier),
            RetryPolicy::immediate(1),
            EngineSettings::default(),
        )
        .await
        .unwrap();
        engine.tick().await.unwrap();

        engine.stop("operator").await.unwrap();
        engine.stop("operator").await.unwrap();
        assert_eq!(engine.status(), BotStatus::Stopped);
        assert_eq!(venue.open_order_count(SYMBOL), 0);
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "bot_stopped");
        assert!(events.try_recv().is_err());

        let stored = store.load_bot(engine.bot_id()).await.unwrap();
        assert_eq!(stored.status, BotStatus::Stopped);
        assert_eq!(stored.status_reason.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn test_pause_blocks_ticks() {
        let venue = venue();
        let store = Arc::new(MemoryStore::new());
        let engine = start(grid_bot(), venue, store).await;
        engine.pause().await.unwrap();
        assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
        engine.resume().await.unwrap();
        assert!(matches!(engine.tick().await.unwrap(), TickOutcome::Ran { .. }));
    }

    #[tokio::test]
    async fn test_error_bot_refuses_start() {
        let mut bot = grid_bot();
        bot.status = BotStatus::Error;
        let err = BotEngine::start(
            bot,
            venue(),
            Arc::new(MemoryStore::new()),
            Arc::new(NullNotifier),
            RetryPolicy::immediate(1),
            EngineSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { action: "start", .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_is_configuration_error() {
        let mut bot = grid_bot();
        bot.strategy = StrategyConfig::Grid(GridConfig {
            lower_price: dec!(110),
            upper_price: dec!(90),
            grid_count: 5,
            investment: dec!(1000),
            stop_loss_percent: None,
            min_sell_profit_pct: None,
        });
        let err = BotEngine::start(
            bot,
            venue(),
            Arc::new(MemoryStore::new()),
            Arc::new(NullNotifier),
            RetryPolicy::immediate(1),
            EngineSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
