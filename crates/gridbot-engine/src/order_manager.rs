//! Order lifecycle manager.
//!
//! Owns every order a bot places, from local creation to a terminal state.
//!
//! # Submission
//!
//! 1. Reserve the (side, grid level) slot       → `DuplicateSlot` if held
//! 2. Persist as `pending`, then `submitting`
//! 3. Venue call through `RetryPolicy::run_timed`
//!    - accepted          → `open`
//!    - timed out         → stays `submitting` (unknown outcome, left to reconciliation)
//!    - venue refused     → `rejected`
//!    - retries exhausted → `error`
//!
//! # Fill application
//!
//! Serialized per bot by the book lock. Idempotent by venue trade id: the
//! trade is appended first and the order, ledger and strategy are only
//! touched when the append is new.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gridbot_core::{
    fee_to_quote, BotId, ClientOrderId, DesiredOrder, FifoLedger, FillEvent, GridSlot, Order,
    OrderStatus, OrderType, Trade,
};
use gridbot_exchange::{
    CancelOutcome, ExchangeConnector, ExchangeError, OrderRequest, RetryPolicy, VenueOrder,
    VenueOrderStatus,
};
use gridbot_persistence::{OrderLookup, Persistence};
use gridbot_strategy::{Strategy, StrategyFill};
use gridbot_telemetry::Metrics;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::notify::{BotEvent, NotificationSink};

/// Error prefix of orders awaiting operator review after reconciliation.
pub const CONFLICT_PREFIX: &str = "reconciliation conflict";

/// Whether `order` carries an unresolved reconciliation conflict.
pub fn is_conflict(order: &Order) -> bool {
    order
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with(CONFLICT_PREFIX))
}

/// Per-bot state mutated by fills: strategy, FIFO ledger and P&L.
pub struct BotBook {
    pub strategy: Strategy,
    pub ledger: FifoLedger,
    pub realized_pnl: Decimal,
    seen_trades: HashSet<String>,
}

impl BotBook {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ledger: FifoLedger::new(),
            realized_pnl: Decimal::ZERO,
            seen_trades: HashSet::new(),
        }
    }

    pub fn has_trade(&self, venue_trade_id: &str) -> bool {
        self.seen_trades.contains(venue_trade_id)
    }
}

/// Where a fill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSource {
    Stream,
    Reconcile,
}

impl FillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Reconcile => "reconcile",
        }
    }
}

/// Result of `apply_fill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// New trade recorded.
    Applied {
        trade: Trade,
        /// Order status after the fill, when a local order matched.
        order_status: Option<OrderStatus>,
    },
    /// Trade id already recorded.
    Duplicate,
    /// No local order of this bot matches the fill.
    Unmatched,
}

pub struct OrderManager {
    bot_id: BotId,
    symbol: String,
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
    venue_timeout: Duration,
    /// Slot reservations of active orders.
    slots: DashMap<GridSlot, ClientOrderId>,
    book: Mutex<BotBook>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_id: BotId,
        symbol: impl Into<String>,
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<dyn Persistence>,
        notifier: Arc<dyn NotificationSink>,
        retry: RetryPolicy,
        venue_timeout: Duration,
        strategy: Strategy,
    ) -> Self {
        Self {
            bot_id,
            symbol: symbol.into(),
            connector,
            store,
            notifier,
            retry,
            venue_timeout,
            slots: DashMap::new(),
            book: Mutex::new(BotBook::new(strategy)),
        }
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Lock the bot's book. Fill application holds the same lock.
    pub async fn lock_book(&self) -> MutexGuard<'_, BotBook> {
        self.book.lock().await
    }

    /// Rebuild ledger, seen trades and slot reservations from the store.
    ///
    /// Returns the bot's active orders.
    pub async fn load(&self) -> EngineResult<Vec<Order>> {
        let trades = self
            .store
            .list_recent_trades(self.bot_id, chrono::DateTime::<Utc>::MIN_UTC)
            .await?;
        let active = self.store.list_active_orders(self.bot_id).await?;

        let mut book = self.book.lock().await;
        book.ledger = FifoLedger::replay(&trades);
        book.realized_pnl = trades.iter().map(|t| t.realized_pnl).sum();
        book.seen_trades = trades.iter().map(|t| t.venue_trade_id.clone()).collect();

        self.slots.clear();
        for order in &active {
            if let Some(slot) = order.slot() {
                self.slots.insert(slot, order.id.clone());
            }
        }
        debug!(
            bot_id = %self.bot_id,
            trades = trades.len(),
            active = active.len(),
            "Order book loaded"
        );
        Ok(active)
    }

    pub async fn active_orders(&self) -> EngineResult<Vec<Order>> {
        Ok(self.store.list_active_orders(self.bot_id).await?)
    }

    /// Whether an active order holds `slot`.
    pub fn slot_taken(&self, slot: &GridSlot) -> bool {
        self.slots.contains_key(slot)
    }

    /// Submit a desired order.
    pub async fn submit(&self, desired: &DesiredOrder) -> EngineResult<Order> {
        let now = Utc::now();
        let mut order = Order::from_desired(self.bot_id, &self.symbol, desired, now);

        if let Some(slot) = order.slot() {
            match self.slots.entry(slot) {
                Entry::Vacant(vacant) => {
                    vacant.insert(order.id.clone());
                }
                Entry::Occupied(_) => {
                    return Err(EngineError::DuplicateSlot {
                        side: slot.side,
                        level: slot.level,
                    });
                }
            }
        }

        if let Err(e) = self.persist_submitting(&mut order).await {
            self.release_slot(&order);
            self.abandon_unsent(order).await;
            return Err(e);
        }

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            client_order_id: order.id.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: (order.order_type == OrderType::Limit).then_some(order.price),
        };

        let (result, attempts) = self
            .retry
            .run_timed("create_order", self.venue_timeout, || {
                self.connector.create_order(request.clone())
            })
            .await;
        order.retry_count = attempts.saturating_sub(1);
        match result {
            Ok(venue_order_id) => self.mark_accepted(order, venue_order_id).await,
            Err(ExchangeError::Timeout) => self.mark_unknown(order).await,
            Err(e) => self.mark_failed(order, e).await,
        }
    }

    async fn persist_submitting(&self, order: &mut Order) -> EngineResult<()> {
        self.store.create_order(order.clone()).await?;
        order.transition(OrderStatus::Submitting, Utc::now())?;
        self.store.update_order_status(order.clone()).await?;
        Ok(())
    }

    /// Best-effort close of an order that never reached the venue, so a
    /// stale `pending` row does not outlive the released slot.
    async fn abandon_unsent(&self, mut order: Order) {
        order.error = Some("store write failed before submission".to_string());
        if order.transition(OrderStatus::Cancelled, Utc::now()).is_err() {
            return;
        }
        if let Err(e) = self.store.update_order_status(order.clone()).await {
            warn!(order_id = %order.id, error = %e, "Could not close unsent order");
        }
    }

    async fn mark_accepted(&self, order: Order, venue_order_id: String) -> EngineResult<Order> {
        // A fill may have been applied while the response was in flight.
        let _book = self.book.lock().await;
        let mut current = self.reload(&order).await?;
        current.retry_count = order.retry_count;
        if current.venue_order_id.is_none() {
            current.venue_order_id = Some(venue_order_id);
        }
        if current.status == OrderStatus::Submitting {
            current.transition(OrderStatus::Open, Utc::now())?;
        }
        self.store.update_order_status(current.clone()).await?;

        Metrics::order_submitted(&self.bot_id.to_string(), current.side.as_str());
        info!(
            bot_id = %self.bot_id,
            order_id = %current.id,
            venue_order_id = current.venue_order_id.as_deref().unwrap_or_default(),
            side = %current.side,
            price = %current.price,
            quantity = %current.quantity,
            level = ?current.grid_level,
            status = %current.status,
            "Order submitted"
        );
        Ok(current)
    }

    async fn mark_unknown(&self, mut order: Order) -> EngineResult<Order> {
        order.error = Some("submission timed out, outcome unknown".to_string());
        order.updated_at = Utc::now();
        self.store.update_order_status(order.clone()).await?;
        Metrics::order_error(&self.bot_id.to_string(), "timeout");
        warn!(
            bot_id = %self.bot_id,
            order_id = %order.id,
            "Order submission timed out, leaving for reconciliation"
        );
        Err(EngineError::UnknownOutcome(order.id))
    }

    async fn mark_failed(&self, mut order: Order, error: ExchangeError) -> EngineResult<Order> {
        let status = match error {
            ExchangeError::Rejected { .. } | ExchangeError::InsufficientBalance(_) => {
                OrderStatus::Rejected
            }
            _ => OrderStatus::Error,
        };
        let detail = error.to_string();
        order.error = Some(detail.clone());
        order.transition(status, Utc::now())?;
        // The venue holds nothing for this order, so the slot frees even if
        // the store write fails.
        self.release_slot(&order);
        self.store.update_order_status(order.clone()).await?;

        Metrics::order_error(&self.bot_id.to_string(), status.as_str());
        warn!(
            bot_id = %self.bot_id,
            order_id = %order.id,
            %status,
            retries = order.retry_count,
            error = %detail,
            "Order submission failed"
        );
        self.notifier.notify(BotEvent::OrderError {
            bot_id: self.bot_id,
            order_id: order.id.clone(),
            detail,
        });
        Err(EngineError::Exchange(error))
    }

    /// Apply one venue execution.
    ///
    /// Fills matching no local order are recorded only when
    /// `adopt_unmatched` is set.
    pub async fn apply_fill(
        &self,
        fill: &FillEvent,
        source: FillSource,
        adopt_unmatched: bool,
    ) -> EngineResult<FillOutcome> {
        if fill.symbol != self.symbol {
            return Ok(FillOutcome::Unmatched);
        }

        let mut book = self.book.lock().await;
        if book.has_trade(&fill.venue_trade_id) {
            debug!(trade_id = %fill.venue_trade_id, source = source.as_str(), "Duplicate fill ignored");
            return Ok(FillOutcome::Duplicate);
        }

        let mut order = self.find_for_fill(fill).await?;
        if order.is_none() && !adopt_unmatched {
            debug!(
                bot_id = %self.bot_id,
                venue_order_id = %fill.venue_order_id,
                "Fill matches no local order"
            );
            return Ok(FillOutcome::Unmatched);
        }

        let now = Utc::now();
        let fee_quote = fee_to_quote(fill.fee, fill.fee_asset.as_deref(), &self.symbol, fill.price);

        // Commit the ledger only once the trade is durably recorded.
        let mut ledger = book.ledger.clone();
        let fifo = ledger.apply(fill.side, fill.quantity, fill.price, fee_quote);
        if fifo.unmatched.is_positive() {
            debug!(unmatched = %fifo.unmatched, "Sell exceeds recorded buys");
        }

        let trade = Trade {
            id: Uuid::new_v4(),
            bot_id: self.bot_id,
            order_id: order.as_ref().map(|o| o.id.clone()),
            venue_order_id: Some(fill.venue_order_id.clone()),
            venue_trade_id: fill.venue_trade_id.clone(),
            symbol: self.symbol.clone(),
            side: fill.side,
            price: fill.price,
            quantity: fill.quantity,
            fee: fee_quote,
            realized_pnl: fifo.realized_pnl,
            executed_at: fill.executed_at,
        };

        let inserted = self.store.insert_trade(trade.clone()).await?;
        book.seen_trades.insert(trade.venue_trade_id.clone());
        if !inserted {
            return Ok(FillOutcome::Duplicate);
        }
        book.ledger = ledger;
        book.realized_pnl += fifo.realized_pnl;

        let mut order_status = None;
        if let Some(o) = order.as_mut() {
            if o.venue_order_id.is_none() {
                o.venue_order_id = Some(fill.venue_order_id.clone());
            }
            if o.is_active() {
                let status = o.record_fill(fill.quantity, fill.price, fee_quote, now)?;
                self.store.update_order_status(o.clone()).await?;
                if status == OrderStatus::Filled {
                    self.release_slot(o);
                }
                order_status = Some(status);
            } else {
                warn!(
                    order_id = %o.id,
                    status = %o.status,
                    trade_id = %trade.venue_trade_id,
                    "Fill for terminal order recorded as trade only"
                );
                order_status = Some(o.status);
            }
        }

        book.strategy
            .on_order_filled(&StrategyFill::from_trade(&trade, order.as_ref()));

        info!(
            bot_id = %self.bot_id,
            trade_id = %trade.venue_trade_id,
            side = %trade.side,
            price = %trade.price,
            quantity = %trade.quantity,
            fee = %trade.fee,
            realized_pnl = %trade.realized_pnl,
            source = source.as_str(),
            "Fill applied"
        );
        Ok(FillOutcome::Applied {
            trade,
            order_status,
        })
    }

    /// Best-effort cancel. Returns `true` when the order ends up cancelled.
    ///
    /// A cancel that loses the race to a fill is a no-op; the fill path
    /// completes the order.
    pub async fn cancel(&self, order: &Order) -> EngineResult<bool> {
        let Some(venue_order_id) = order.venue_order_id.clone() else {
            return self.cancel_unsent(order).await;
        };

        {
            let _book = self.book.lock().await;
            let mut current = self.reload(order).await?;
            if !current.is_active() {
                return Ok(false);
            }
            if current.transition(OrderStatus::Cancelling, Utc::now())? {
                self.store.update_order_status(current).await?;
            }
        }

        let outcome = tokio::time::timeout(
            self.venue_timeout,
            self.connector.cancel_order(&self.symbol, &venue_order_id),
        )
        .await;

        let _book = self.book.lock().await;
        let mut current = self.reload(order).await?;
        let now = Utc::now();
        match outcome {
            Ok(Ok(CancelOutcome::Cancelled)) => {
                if current.is_active() {
                    current.transition(OrderStatus::Cancelled, now)?;
                    self.store.update_order_status(current.clone()).await?;
                    self.release_slot(&current);
                }
                debug!(order_id = %current.id, %venue_order_id, "Order cancelled");
                Ok(true)
            }
            Ok(Ok(CancelOutcome::AlreadyFilled)) => {
                self.revert_cancelling(&mut current).await?;
                info!(order_id = %current.id, "Cancel raced a fill, fill path takes priority");
                Ok(false)
            }
            Ok(Ok(CancelOutcome::NotFound)) => {
                if current.is_active() {
                    current.error = Some("venue has no record of the order".to_string());
                    current.transition(OrderStatus::Cancelled, now)?;
                    self.store.update_order_status(current.clone()).await?;
                    self.release_slot(&current);
                }
                warn!(order_id = %current.id, %venue_order_id, "Cancel target unknown to venue");
                Ok(true)
            }
            Ok(Err(e)) => {
                self.revert_cancelling(&mut current).await?;
                Err(e.into())
            }
            Err(_) => {
                self.revert_cancelling(&mut current).await?;
                Err(EngineError::Timeout("cancel_order"))
            }
        }
    }

    /// Cancel every active order of the bot. Failures are logged and skipped.
    pub async fn cancel_all(&self) -> EngineResult<usize> {
        let active = self.active_orders().await?;
        let mut cancelled = 0;
        for order in &active {
            match self.cancel(order).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!(order_id = %order.id, error = %e, "Cancel failed"),
            }
        }
        if !active.is_empty() {
            info!(bot_id = %self.bot_id, cancelled, total = active.len(), "Cancelled active orders");
        }
        Ok(cancelled)
    }

    /// Bring a local order in line with the venue's view of it.
    ///
    /// Fill quantities only move through `apply_fill`; this adopts the venue
    /// id and terminal cancel/reject states. Returns whether anything was written.
    pub async fn adopt_venue_state(&self, order: &Order, venue: &VenueOrder) -> EngineResult<bool> {
        let _book = self.book.lock().await;
        let mut current = self.reload(order).await?;
        if !current.is_active() {
            return Ok(false);
        }
        let now = Utc::now();
        let mut changed = false;

        if current.venue_order_id.is_none() {
            current.venue_order_id = Some(venue.venue_order_id.clone());
            current.updated_at = now;
            changed = true;
        }

        let target = match venue.status {
            VenueOrderStatus::New | VenueOrderStatus::PartiallyFilled | VenueOrderStatus::Filled
                if current.status == OrderStatus::Submitting =>
            {
                Some(OrderStatus::Open)
            }
            VenueOrderStatus::Canceled | VenueOrderStatus::Expired => Some(OrderStatus::Cancelled),
            VenueOrderStatus::Rejected if current.status == OrderStatus::Submitting => {
                Some(OrderStatus::Rejected)
            }
            VenueOrderStatus::Rejected => Some(OrderStatus::Cancelled),
            _ => None,
        };
        if let Some(next) = target {
            changed |= current.transition(next, now)?;
        }

        if changed {
            self.store.update_order_status(current.clone()).await?;
            if !current.is_active() {
                self.release_slot(&current);
            }
            info!(
                order_id = %current.id,
                venue_status = ?venue.status,
                status = %current.status,
                "Order reconciled with venue"
            );
        }
        Ok(changed)
    }

    /// Mark an active order the venue no longer recognizes. The mark is
    /// stored on the order, so it survives restarts and is reported once.
    /// Returns `false` when the order was already flagged.
    pub async fn flag_conflict(&self, order: &Order, detail: &str) -> EngineResult<bool> {
        let _book = self.book.lock().await;
        let mut current = self.reload(order).await?;
        if !current.is_active() || is_conflict(&current) {
            return Ok(false);
        }
        current.error = Some(format!("{CONFLICT_PREFIX}: {detail}"));
        current.updated_at = Utc::now();
        self.store.update_order_status(current).await?;
        Ok(true)
    }

    /// Move an order to `error` and surface it.
    pub async fn fail_order(&self, order: &Order, detail: &str) -> EngineResult<bool> {
        let _book = self.book.lock().await;
        let mut current = self.reload(order).await?;
        if !current.is_active() {
            return Ok(false);
        }
        current.error = Some(detail.to_string());
        current.transition(OrderStatus::Error, Utc::now())?;
        self.store.update_order_status(current.clone()).await?;
        self.release_slot(&current);

        Metrics::order_error(&self.bot_id.to_string(), "error");
        self.notifier.notify(BotEvent::OrderError {
            bot_id: self.bot_id,
            order_id: current.id.clone(),
            detail: detail.to_string(),
        });
        Ok(true)
    }

    async fn cancel_unsent(&self, order: &Order) -> EngineResult<bool> {
        let _book = self.book.lock().await;
        let mut current = self.reload(order).await?;
        if current.status != OrderStatus::Pending {
            // Submitting without a venue id: outcome unknown until reconciled
            debug!(order_id = %current.id, status = %current.status, "Order not cancellable yet");
            return Ok(false);
        }
        current.transition(OrderStatus::Cancelled, Utc::now())?;
        self.store.update_order_status(current.clone()).await?;
        self.release_slot(&current);
        Ok(true)
    }

    async fn revert_cancelling(&self, current: &mut Order) -> EngineResult<()> {
        if current.status != OrderStatus::Cancelling {
            return Ok(());
        }
        let back = if current.filled_quantity.is_positive() {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        };
        current.transition(back, Utc::now())?;
        self.store.update_order_status(current.clone()).await?;
        Ok(())
    }

    async fn reload(&self, order: &Order) -> EngineResult<Order> {
        Ok(self
            .store
            .find_order(self.bot_id, OrderLookup::Client(order.id.clone()))
            .await?
            .unwrap_or_else(|| order.clone()))
    }

    async fn find_for_fill(&self, fill: &FillEvent) -> EngineResult<Option<Order>> {
        if let Some(client_id) = &fill.client_order_id {
            let found = self
                .store
                .find_order(self.bot_id, OrderLookup::Client(client_id.clone()))
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(self
            .store
            .find_order(self.bot_id, OrderLookup::Venue(fill.venue_order_id.clone()))
            .await?)
    }

    fn release_slot(&self, order: &Order) {
        if let Some(slot) = order.slot() {
            self.slots.remove_if(&slot, |_, holder| *holder == order.id);
        }
    }
}
