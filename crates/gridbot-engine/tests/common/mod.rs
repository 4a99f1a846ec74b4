//! Shared harness: engines driven against the paper venue and memory store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridbot_core::{FillEvent, Price};
use gridbot_engine::{BotEngine, BotEvent, ChannelNotifier, EngineSettings};
use gridbot_exchange::{ExchangeConnector, PaperExchange, RetryPolicy};
use gridbot_persistence::{Bot, MemoryStore, Persistence};
use gridbot_strategy::{DcaConfig, DcaInterval, DcaType, GridConfig, StrategyConfig};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};

pub const SYMBOL: &str = "BTC/USDT";

pub struct Harness {
    pub venue: Arc<PaperExchange>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<ChannelNotifier>,
    pub events: mpsc::UnboundedReceiver<BotEvent>,
    pub fills: broadcast::Receiver<FillEvent>,
}

impl Harness {
    /// Paper venue priced at 100 with ample balances.
    pub fn new() -> Self {
        let venue = Arc::new(PaperExchange::new());
        venue.deposit("USDT", dec!(1000000));
        venue.deposit("BTC", dec!(100));
        venue.set_price(SYMBOL, Price::new(dec!(100)));
        let fills = venue.stream_fills();
        let (notifier, events) = ChannelNotifier::new();
        Self {
            venue,
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(notifier),
            events,
            fills,
        }
    }

    pub fn settings() -> EngineSettings {
        EngineSettings {
            venue_timeout_ms: 200,
            ..EngineSettings::default()
        }
    }

    pub async fn create(&self, bot: &Bot) {
        self.store.create_bot(bot.clone()).await.unwrap();
    }

    pub async fn start(&self, bot: Bot) -> Arc<BotEngine> {
        BotEngine::start(
            bot,
            self.venue.clone(),
            self.store.clone(),
            self.notifier.clone(),
            RetryPolicy::immediate(2),
            Self::settings(),
        )
        .await
        .unwrap()
    }

    pub async fn create_and_start(&self, bot: Bot) -> Arc<BotEngine> {
        self.create(&bot).await;
        self.start(bot).await
    }

    /// Next fill published by the venue.
    pub async fn next_fill(&mut self) -> FillEvent {
        tokio::time::timeout(Duration::from_secs(1), self.fills.recv())
            .await
            .expect("no fill published")
            .unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<BotEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn grid_bot(lower: Decimal, upper: Decimal, grid_count: u32, investment: Decimal) -> Bot {
    Bot::new(
        "btc-grid",
        "ops",
        "paper",
        SYMBOL,
        StrategyConfig::Grid(GridConfig {
            lower_price: lower,
            upper_price: upper,
            grid_count,
            investment,
            stop_loss_percent: Some(dec!(5)),
            min_sell_profit_pct: None,
        }),
    )
}

/// 90..110 in five intervals: buys at 90/94/98, sells at 102/106/110.
pub fn small_grid() -> Bot {
    grid_bot(dec!(90), dec!(110), 5, dec!(1000))
}

pub fn dca_bot(base_amount: Decimal, total_budget: Decimal) -> Bot {
    Bot::new(
        "btc-dca",
        "ops",
        "paper",
        SYMBOL,
        StrategyConfig::Dca(DcaConfig {
            dca_type: DcaType::TimeBased,
            base_amount,
            interval: Some(DcaInterval::Seconds(0)),
            drop_threshold: None,
            safety_orders: Vec::new(),
            total_budget,
            take_profit_percent: None,
        }),
    )
}
