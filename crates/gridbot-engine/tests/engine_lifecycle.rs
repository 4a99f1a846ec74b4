//! End-to-end engine tests against the paper venue.
//!
//! Covers:
//! - Slot dedup under concurrent submissions and ticks
//! - Idempotent fill application and FIFO realized P&L
//! - Circuit breaker trip on order rate
//! - Circuit breaker trip on loss, price-deviation gate
//! - Cooldown of a rung the venue refused
//! - DCA budget ceiling and hybrid trigger independence
//! - Rehydration without duplicate orders

mod common;

use std::collections::HashMap;

use common::{dca_bot, grid_bot, small_grid, Harness, SYMBOL};
use gridbot_core::{BotStatus, DesiredOrder, OrderPurpose, OrderSide, OrderStatus, Price, Size};
use gridbot_engine::{EngineError, FillOutcome, FillSource, TickOutcome};
use gridbot_exchange::ExchangeError;
use gridbot_persistence::{Bot, Persistence};
use gridbot_risk::TripReason;
use gridbot_strategy::{DcaConfig, DcaInterval, DcaType, Strategy, StrategyConfig};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_concurrent_submissions_hold_one_order_per_slot() {
    let h = Harness::new();
    let engine = h.create_and_start(small_grid()).await;

    let desired = DesiredOrder::limit(OrderSide::Buy, Price::new(dec!(94)), Size::new(dec!(1)), 1);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let desired = desired.clone();
        handles.push(tokio::spawn(async move {
            engine.orders().submit(&desired).await
        }));
    }
    let mut accepted = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::DuplicateSlot { .. }) => duplicates += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 7);

    // Concurrent ticks on top: overlapping ones are skipped
    let mut ticks = Vec::new();
    for _ in 0..6 {
        let engine = engine.clone();
        ticks.push(tokio::spawn(async move { engine.tick().await }));
    }
    for tick in ticks {
        tick.await.unwrap().unwrap();
    }

    let active = h.store.list_active_orders(engine.bot_id()).await.unwrap();
    let mut per_slot: HashMap<(OrderSide, u32), usize> = HashMap::new();
    for order in &active {
        let level = order.grid_level.unwrap();
        *per_slot.entry((order.side, level)).or_default() += 1;
    }
    assert!(per_slot.values().all(|&n| n == 1), "slots: {per_slot:?}");
    assert_eq!(active.len(), 6);
    assert_eq!(h.venue.open_order_count(SYMBOL), 6);
}

#[tokio::test]
async fn test_same_fill_applied_once() {
    let h = Harness::new();
    h.venue.set_publish_fills(false);
    let engine = h.create_and_start(small_grid()).await;
    engine.tick().await.unwrap();

    // Price through the 98 buy
    let fills = h.venue.set_price(SYMBOL, Price::new(dec!(97)));
    assert_eq!(fills.len(), 1);
    let fill = &fills[0];

    let first = engine.on_fill(fill, FillSource::Stream, false).await.unwrap();
    assert!(matches!(
        first,
        FillOutcome::Applied {
            order_status: Some(OrderStatus::Filled),
            ..
        }
    ));
    let pnl = engine.realized_pnl().await;
    let position = engine.orders().lock_book().await.ledger.open_quantity();

    let second = engine.on_fill(fill, FillSource::Reconcile, false).await.unwrap();
    assert_eq!(second, FillOutcome::Duplicate);
    assert_eq!(engine.realized_pnl().await, pnl);
    assert_eq!(engine.orders().lock_book().await.ledger.open_quantity(), position);

    let since = chrono::DateTime::<chrono::Utc>::MIN_UTC;
    let trades = h.store.list_recent_trades(engine.bot_id(), since).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].venue_trade_id, fill.venue_trade_id);
}

#[tokio::test]
async fn test_round_trip_realized_pnl_is_exact() {
    let mut h = Harness::new();
    let engine = h.create_and_start(small_grid()).await;

    let buy = DesiredOrder::market(
        OrderSide::Buy,
        Price::new(dec!(100)),
        Size::new(dec!(1)),
        OrderPurpose::TakeProfit,
    );
    engine.orders().submit(&buy).await.unwrap();
    let fill = h.next_fill().await;
    engine.on_fill(&fill, FillSource::Stream, false).await.unwrap();

    h.venue.set_price(SYMBOL, Price::new(dec!(110)));
    let sell = DesiredOrder::market(
        OrderSide::Sell,
        Price::new(dec!(110)),
        Size::new(dec!(1)),
        OrderPurpose::TakeProfit,
    );
    engine.orders().submit(&sell).await.unwrap();
    let fill = h.next_fill().await;
    let outcome = engine.on_fill(&fill, FillSource::Stream, false).await.unwrap();

    // 110 - 100 - 0.1 (buy fee) - 0.11 (sell fee)
    let FillOutcome::Applied { trade, .. } = outcome else {
        panic!("sell not applied");
    };
    assert_eq!(trade.realized_pnl, dec!(9.79));
    assert_eq!(engine.realized_pnl().await, dec!(9.79));

    let stored = h.store.load_bot(engine.bot_id()).await.unwrap();
    assert_eq!(stored.realized_pnl, dec!(9.79));
}

#[tokio::test]
async fn test_51st_order_in_a_minute_trips_breaker() {
    let mut h = Harness::new();
    // 100 intervals of 0.1 around 100: 50 buys and 50 sells want placing
    let engine = h
        .create_and_start(grid_bot(dec!(95), dec!(105), 100, dec!(5000)))
        .await;

    let outcome = engine.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Tripped(TripReason::OrderRateExceeded {
            count: 51,
            limit: 50
        })
    );
    assert_eq!(h.venue.create_calls(), 50);
    assert_eq!(engine.status(), BotStatus::Error);
    assert!(engine.breaker().is_tripped());

    // Tripping cancels everything that was placed
    assert_eq!(h.venue.open_order_count(SYMBOL), 0);
    assert!(h
        .store
        .list_active_orders(engine.bot_id())
        .await
        .unwrap()
        .is_empty());

    let events = h.drain_events();
    let names: Vec<_> = events.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["circuit_breaker_triggered", "bot_stopped"]);

    let stored = h.store.load_bot(engine.bot_id()).await.unwrap();
    assert_eq!(stored.status, BotStatus::Error);
    assert!(stored.status_reason.unwrap().contains("order rate exceeded"));

    // Latched until an operator resets
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::Idle);
    engine.reset_error().await.unwrap();
    assert_eq!(engine.status(), BotStatus::Stopped);
    assert!(!engine.breaker().is_tripped());
}

#[tokio::test]
async fn test_dca_budget_ceiling_stops_bot() {
    let mut h = Harness::new();
    let engine = h.create_and_start(dca_bot(dec!(100), dec!(500))).await;

    for purchase in 1..=5 {
        let outcome = engine.tick().await.unwrap();
        assert!(
            matches!(outcome, TickOutcome::Ran { submitted: 1, .. }),
            "purchase {purchase}: {outcome:?}"
        );
        let fill = h.next_fill().await;
        engine.on_fill(&fill, FillSource::Stream, false).await.unwrap();
    }
    assert!(engine.orders().lock_book().await.strategy.should_stop());

    // Sixth purchase is skipped and the bot completes
    assert_eq!(engine.tick().await.unwrap(), TickOutcome::Finished);
    assert_eq!(h.venue.create_calls(), 5);
    assert_eq!(engine.status(), BotStatus::Stopped);

    let stored = h.store.load_bot(engine.bot_id()).await.unwrap();
    assert_eq!(stored.status, BotStatus::Stopped);
    assert_eq!(stored.status_reason.as_deref(), Some("strategy completed"));
}

#[tokio::test]
async fn test_rehydration_restores_grid_without_duplicates() {
    let h = Harness::new();
    let bot = small_grid();
    let bot_id = bot.id;
    let engine = h.create_and_start(bot).await;

    engine.tick().await.unwrap();
    // Second tick attaches order ids to the rungs and persists them
    engine.tick().await.unwrap();
    let before = engine.orders().lock_book().await.strategy.snapshot_state();
    assert_eq!(h.venue.create_calls(), 6);

    // Process exit: engine dropped without stopping the bot
    engine.detach();
    drop(engine);

    let persisted = h.store.load_bot(bot_id).await.unwrap();
    assert_eq!(persisted.status, BotStatus::Running);
    let running = h.store.list_running_bots().await.unwrap();
    assert_eq!(running.len(), 1);

    let restarted = h.start(persisted).await;
    let after = restarted.orders().lock_book().await.strategy.snapshot_state();
    assert_eq!(after, before);

    let outcome = restarted.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Ran { submitted: 0, .. }));
    assert_eq!(h.venue.create_calls(), 6);
    assert_eq!(h.venue.open_order_count(SYMBOL), 6);
}

#[tokio::test]
async fn test_stop_twice_is_idempotent() {
    let mut h = Harness::new();
    let engine = h.create_and_start(small_grid()).await;
    engine.tick().await.unwrap();

    let (a, b) = tokio::join!(engine.stop("operator"), engine.stop("operator"));
    a.unwrap();
    b.unwrap();

    assert_eq!(engine.status(), BotStatus::Stopped);
    assert_eq!(h.venue.open_order_count(SYMBOL), 0);
    let stopped: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter(|e| e.name() == "bot_stopped")
        .collect();
    assert_eq!(stopped.len(), 1);
}

#[tokio::test]
async fn test_rejected_rung_not_resubmitted_next_tick() {
    let mut h = Harness::new();
    let engine = h.create_and_start(small_grid()).await;

    h.venue.fail_next_create(ExchangeError::Rejected {
        code: -2010,
        message: "Account has insufficient balance".to_string(),
    });
    let outcome = engine.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Ran { submitted: 5, skipped: 1 });
    assert_eq!(h.venue.create_calls(), 6);
    let errors: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter(|e| e.name() == "order_error")
        .collect();
    assert_eq!(errors.len(), 1);

    // The refused rung waits out its cooldown instead of hitting the venue again
    for _ in 0..3 {
        let outcome = engine.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Ran { submitted: 0, skipped: 1 });
    }
    assert_eq!(h.venue.create_calls(), 6);
    assert_eq!(h.venue.open_order_count(SYMBOL), 5);
    assert_eq!(engine.status(), BotStatus::Running);
}

#[tokio::test]
async fn test_loss_limit_trips_breaker_on_tick() {
    let mut h = Harness::new();
    let mut bot = small_grid();
    // 1% of the 1000 investment
    bot.circuit_breaker.max_loss_per_hour_percent = dec!(1);
    let engine = h.create_and_start(bot).await;
    engine.tick().await.unwrap();

    // Buys at 98 and 94 fill; marked at 91 they are ~20 under water
    let fills = h.venue.set_price(SYMBOL, Price::new(dec!(91)));
    assert_eq!(fills.len(), 2);
    for fill in &fills {
        engine.on_fill(fill, FillSource::Stream, false).await.unwrap();
    }
    assert_eq!(engine.status(), BotStatus::Running);
    h.drain_events();

    let outcome = engine.tick().await.unwrap();
    assert!(
        matches!(outcome, TickOutcome::Tripped(TripReason::LossLimitExceeded { .. })),
        "{outcome:?}"
    );
    assert_eq!(engine.status(), BotStatus::Error);
    assert_eq!(h.venue.open_order_count(SYMBOL), 0);
    assert!(h
        .store
        .list_active_orders(engine.bot_id())
        .await
        .unwrap()
        .is_empty());

    let names: Vec<_> = h.drain_events().iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["circuit_breaker_triggered", "bot_stopped"]);
    let stored = h.store.load_bot(engine.bot_id()).await.unwrap();
    assert_eq!(stored.status, BotStatus::Error);
    assert!(stored.status_reason.unwrap().starts_with("circuit breaker"));
}

#[tokio::test]
async fn test_price_deviation_rejects_far_orders() {
    let h = Harness::new();
    let mut bot = small_grid();
    bot.circuit_breaker.max_price_deviation_percent = dec!(3);
    let engine = h.create_and_start(bot).await;

    // Only the rungs at 98 and 102 sit within 3% of 100
    let outcome = engine.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Ran { submitted: 2, skipped: 4 });
    assert_eq!(h.venue.create_calls(), 2);
    assert_eq!(engine.status(), BotStatus::Running);
    assert!(!engine.breaker().is_tripped());

    // Escalated to a trip when configured
    let h = Harness::new();
    let mut bot = small_grid();
    bot.circuit_breaker.max_price_deviation_percent = dec!(3);
    bot.circuit_breaker.trip_on_price_deviation = true;
    let engine = h.create_and_start(bot).await;
    let outcome = engine.tick().await.unwrap();
    assert!(
        matches!(outcome, TickOutcome::Tripped(TripReason::PriceDeviation { .. })),
        "{outcome:?}"
    );
    assert_eq!(engine.status(), BotStatus::Error);
    assert_eq!(h.venue.open_order_count(SYMBOL), 0);
}

#[tokio::test]
async fn test_hybrid_dca_triggers_keep_separate_cooldowns() {
    let mut h = Harness::new();
    let bot = Bot::new(
        "btc-hybrid",
        "ops",
        "paper",
        SYMBOL,
        StrategyConfig::Dca(DcaConfig {
            dca_type: DcaType::Hybrid,
            base_amount: dec!(100),
            interval: Some(DcaInterval::Seconds(3600)),
            drop_threshold: Some(dec!(5)),
            safety_orders: Vec::new(),
            total_budget: dec!(1000),
            take_profit_percent: None,
        }),
    );
    let engine = h.create_and_start(bot).await;

    // Scheduled purchase starts the hourly cooldown
    assert!(matches!(engine.tick().await.unwrap(), TickOutcome::Ran { submitted: 1, .. }));
    let scheduled = h.next_fill().await;
    engine.on_fill(&scheduled, FillSource::Stream, false).await.unwrap();
    assert!(matches!(engine.tick().await.unwrap(), TickOutcome::Ran { submitted: 0, .. }));

    // A 6% drop inside the same hour still buys
    h.venue.set_price(SYMBOL, Price::new(dec!(94)));
    assert!(matches!(engine.tick().await.unwrap(), TickOutcome::Ran { submitted: 1, .. }));
    let dropped = h.next_fill().await;
    engine.on_fill(&dropped, FillSource::Stream, false).await.unwrap();

    {
        let book = engine.orders().lock_book().await;
        let Strategy::Dca(dca) = &book.strategy else {
            panic!("expected a DCA strategy");
        };
        // The drop buy moved the drop anchor, not the schedule
        assert_eq!(dca.state().last_scheduled_at, Some(scheduled.executed_at));
        assert_eq!(dca.state().reference_price, Some(Price::new(dec!(94))));
        // Two purchases of 100, the second floored to whole satoshis
        assert!(dca.state().invested > dec!(199.99), "{}", dca.state().invested);
    }

    // Neither trigger is due: schedule waits out the hour, price has not
    // dropped another 5% from 94
    assert!(matches!(engine.tick().await.unwrap(), TickOutcome::Ran { submitted: 0, .. }));
    assert_eq!(h.venue.create_calls(), 2);
}
