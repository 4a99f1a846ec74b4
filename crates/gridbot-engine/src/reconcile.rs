//! Reconciliation against the venue's authoritative history.
//!
//! Per bot, holding the bot's tick lock:
//! 1. Resolve orders whose submission outcome is unknown (by client id)
//! 2. Replay recent venue trades through the fill path (dedup by trade id)
//! 3. Per active order, apply executed quantity the trade window missed,
//!    then close out orders the venue reports cancelled or expired
//!
//! Repeated passes against unchanged venue state write nothing.

use chrono::Utc;
use gridbot_core::{BotId, ClientOrderId, FillEvent, Order, OrderStatus, Price};
use gridbot_exchange::{ExchangeError, OrderRef, VenueOrder};
use rust_decimal::Decimal;
use gridbot_telemetry::Metrics;
use tracing::{debug, info, warn};

use crate::engine::BotEngine;
use crate::error::{EngineError, EngineResult};
use crate::notify::BotEvent;
use crate::order_manager::{FillOutcome, FillSource};
use crate::registry::BotRegistry;
use crate::settings::EngineSettings;

/// What one pass repaired for one bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub bot_id: BotId,
    pub trades_recovered: usize,
    pub orders_updated: usize,
    /// Newly flagged conflicts.
    pub conflicts: Vec<ClientOrderId>,
}

impl ReconcileReport {
    fn new(bot_id: BotId) -> Self {
        Self {
            bot_id,
            trades_recovered: 0,
            orders_updated: 0,
            conflicts: Vec::new(),
        }
    }

    pub fn writes(&self) -> usize {
        self.trades_recovered + self.orders_updated + self.conflicts.len()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    settings: EngineSettings,
}

impl Reconciler {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Reconcile every running or paused bot in the registry.
    ///
    /// Trades with no local order are adopted only by a bot that is alone
    /// on its account and symbol.
    pub async fn run(&self, registry: &BotRegistry) -> Vec<ReconcileReport> {
        let mut reports = Vec::new();
        for engine in registry.running() {
            let adopt = registry.count_on(engine.account(), engine.symbol()) == 1;
            match self.reconcile_bot(&engine, adopt).await {
                Ok(report) => {
                    if report.writes() > 0 {
                        info!(
                            bot_id = %report.bot_id,
                            trades = report.trades_recovered,
                            orders = report.orders_updated,
                            conflicts = report.conflicts.len(),
                            "Reconciliation repaired divergence"
                        );
                    }
                    reports.push(report);
                }
                Err(e) => warn!(bot_id = %engine.bot_id(), error = %e, "Reconciliation failed"),
            }
        }
        reports
    }

    pub async fn reconcile_bot(
        &self,
        engine: &BotEngine,
        adopt_unmatched: bool,
    ) -> EngineResult<ReconcileReport> {
        let _guard = engine.tick_lock.lock().await;
        let mut report = ReconcileReport::new(engine.bot_id());

        self.resolve_unknown_submissions(engine, &mut report).await?;
        self.recover_trades(engine, adopt_unmatched, &mut report)
            .await?;
        self.refresh_order_states(engine, &mut report).await?;

        if report.writes() > 0 {
            engine.save_state().await?;
        }
        debug!(
            bot_id = %report.bot_id,
            writes = report.writes(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    async fn resolve_unknown_submissions(
        &self,
        engine: &BotEngine,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let orders = engine.orders();
        let unknown: Vec<_> = orders
            .active_orders()
            .await?
            .into_iter()
            .filter(|o| o.status == OrderStatus::Submitting && o.venue_order_id.is_none())
            .collect();

        for order in unknown {
            let lookup = engine.connector().fetch_order(
                engine.symbol(),
                OrderRef::Client(order.id.clone()),
            );
            match engine.venue("fetch_order", lookup).await {
                Ok(venue) => {
                    if orders.adopt_venue_state(&order, &venue).await? {
                        report.orders_updated += 1;
                        Metrics::reconcile_write("order");
                    }
                }
                Err(EngineError::Exchange(ExchangeError::OrderNotFound(_))) => {
                    if orders
                        .fail_order(&order, "submission never reached the venue")
                        .await?
                    {
                        report.orders_updated += 1;
                        Metrics::reconcile_write("order");
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Could not resolve unknown submission");
                }
            }
        }
        Ok(())
    }

    async fn recover_trades(
        &self,
        engine: &BotEngine,
        adopt_unmatched: bool,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let since = Utc::now() - self.settings.reconcile_lookback();
        let fetch = engine.connector().get_recent_trades(
            engine.symbol(),
            since,
            self.settings.trade_fetch_limit,
        );
        let fills = engine.venue("get_recent_trades", fetch).await?;

        for fill in &fills {
            let outcome = engine
                .on_fill(fill, FillSource::Reconcile, adopt_unmatched)
                .await?;
            if let FillOutcome::Applied { trade, .. } = outcome {
                report.trades_recovered += 1;
                Metrics::reconcile_write("trade");
                info!(
                    bot_id = %engine.bot_id(),
                    trade_id = %trade.venue_trade_id,
                    "Recovered missed trade"
                );
            }
        }
        Ok(())
    }

    async fn refresh_order_states(
        &self,
        engine: &BotEngine,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        let orders = engine.orders();
        for order in orders.active_orders().await? {
            let Some(venue_order_id) = order.venue_order_id.clone() else {
                continue;
            };
            let lookup = engine
                .connector()
                .fetch_order(engine.symbol(), OrderRef::Venue(venue_order_id.clone()));
            match engine.venue("fetch_order", lookup).await {
                Ok(venue) => {
                    if let Some(fill) = missing_execution(engine.symbol(), &order, &venue) {
                        debug!(
                            order_id = %order.id,
                            venue_filled = %venue.filled_quantity,
                            local_filled = %order.filled_quantity,
                            "Venue fills outside the trade window"
                        );
                        let outcome = engine.on_fill(&fill, FillSource::Reconcile, false).await?;
                        if let FillOutcome::Applied { trade, .. } = outcome {
                            report.trades_recovered += 1;
                            Metrics::reconcile_write("trade");
                            info!(
                                bot_id = %engine.bot_id(),
                                trade_id = %trade.venue_trade_id,
                                quantity = %trade.quantity,
                                "Recovered fill from venue order state"
                            );
                        }
                    }
                    if orders.adopt_venue_state(&order, &venue).await? {
                        report.orders_updated += 1;
                        Metrics::reconcile_write("order");
                    }
                }
                Err(EngineError::Exchange(ExchangeError::OrderNotFound(_))) => {
                    let detail = format!("venue no longer recognizes order {venue_order_id}");
                    if !orders.flag_conflict(&order, &detail).await? {
                        continue;
                    }
                    let conflict = EngineError::ReconciliationConflict {
                        order_id: order.id.clone(),
                        detail,
                    };
                    warn!(bot_id = %engine.bot_id(), error = %conflict, "Flagged for operator review");
                    Metrics::reconcile_write("conflict");
                    engine.notify(BotEvent::ReconciliationConflict {
                        bot_id: engine.bot_id(),
                        order_id: order.id.clone(),
                        detail: conflict.to_string(),
                    });
                    report.conflicts.push(order.id);
                }
                Err(e) => warn!(order_id = %order.id, error = %e, "Order status check failed"),
            }
        }
        Ok(())
    }
}

/// Executed quantity the venue reports for a finished order that no local
/// trade accounts for.
///
/// The trade id is derived from the venue's cumulative quantity, so later
/// passes see the same id and skip it.
fn missing_execution(symbol: &str, order: &Order, venue: &VenueOrder) -> Option<FillEvent> {
    if venue.status.is_open() || venue.filled_quantity <= order.filled_quantity {
        return None;
    }
    let missing = venue.filled_quantity - order.filled_quantity;
    let venue_avg = venue.average_price.unwrap_or(order.price);
    // Back out the locally known part of the venue's average
    let local_notional = order
        .average_fill_price
        .map(|p| order.filled_quantity.notional(p))
        .unwrap_or(Decimal::ZERO);
    let price = Price::new(
        (venue.filled_quantity.notional(venue_avg) - local_notional) / missing.inner(),
    );
    Some(FillEvent {
        symbol: symbol.to_string(),
        venue_order_id: venue.venue_order_id.clone(),
        client_order_id: Some(order.id.clone()),
        venue_trade_id: format!("recon-{}-{}", venue.venue_order_id, venue.filled_quantity),
        side: order.side,
        price,
        quantity: missing,
        fee: Decimal::ZERO,
        fee_asset: None,
        executed_at: Utc::now(),
    })
}
