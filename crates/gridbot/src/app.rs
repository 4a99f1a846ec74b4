//! Supervisor: owns the store, the account connectors and every live bot.
//!
//! Startup order:
//! 1. Create bots declared in the config that the store does not know yet
//! 2. Rehydrate bots persisted as running (a failure marks the bot `error`)
//! 3. Start stopped bots flagged `autostart`
//!
//! Each live bot gets a tick loop; each account with live bots gets one
//! fill router fanning the account's fill stream out to per-bot queues.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use gridbot_core::{BotId, BotStatus};
use gridbot_engine::{
    BotEngine, BotRegistry, EngineSettings, LogNotifier, NotificationSink, Reconciler,
    TickOutcome,
};
use gridbot_exchange::ExchangeConnector;
use gridbot_persistence::{
    Bot, BotStateUpdate, JournalStore, MemoryStore, Persistence, PersistenceError,
};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountConnectors;
use crate::config::{AppConfig, StoreKind};
use crate::dispatch::FillDispatcher;
use crate::error::AppResult;

pub struct Supervisor {
    config: AppConfig,
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn NotificationSink>,
    connectors: Arc<AccountConnectors>,
    registry: Arc<BotRegistry>,
    /// Connector each account's fill router listens on.
    routed: Mutex<HashMap<String, Weak<dyn ExchangeConnector>>>,
    /// Wakes the reconciliation loop ahead of its interval.
    reconcile_now: Arc<Notify>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Open the configured store and build the supervisor.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let store: Arc<dyn Persistence> = match config.store.kind {
            StoreKind::Journal => Arc::new(JournalStore::open(&config.store.path)?),
            StoreKind::Memory => {
                warn!("In-memory store: bot state will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store, Arc::new(LogNotifier)))
    }

    pub fn with_store(
        config: AppConfig,
        store: Arc<dyn Persistence>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let connectors = Arc::new(AccountConnectors::new(
            &config.accounts,
            config.retry.clone(),
        ));
        Self {
            config,
            store,
            notifier,
            connectors,
            registry: Arc::new(BotRegistry::new()),
            routed: Mutex::new(HashMap::new()),
            reconcile_now: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<BotRegistry> {
        &self.registry
    }

    pub fn connectors(&self) -> &Arc<AccountConnectors> {
        &self.connectors
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    fn settings(&self) -> &EngineSettings {
        &self.config.engine
    }

    /// Run until Ctrl+C, then detach every bot and close connectors.
    pub async fn run(self) -> AppResult<()> {
        self.start().await?;
        info!(bots = self.registry.len(), "Supervisor running");

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down"),
                    Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
                }
            }
            _ = self.shutdown.cancelled() => {}
        }

        self.shutdown().await;
        Ok(())
    }

    /// Sync configured bots into the store, rehydrate, autostart, and
    /// start the reconciliation loop.
    pub async fn start(&self) -> AppResult<()> {
        self.sync_configured_bots().await?;
        self.rehydrate().await?;
        self.autostart().await;
        self.spawn_reconcile_loop();
        Ok(())
    }

    /// Stop background work without touching bot state: bots persisted as
    /// running are rehydrated by the next process.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for engine in self.registry.all() {
            engine.detach();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }

        self.connectors.shutdown_all().await;
        info!("Supervisor stopped");
    }

    /// Start a stored bot: build its engine, register it, and spawn its
    /// tick loop and the account's fill router.
    pub async fn launch(&self, bot: Bot) -> AppResult<Arc<BotEngine>> {
        let account = bot.account.clone();
        let connector = self.connectors.acquire(&account).await?;

        let started = BotEngine::start(
            bot,
            Arc::clone(&connector),
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            self.config.retry.clone(),
            self.settings().clone(),
        )
        .await;
        let engine = match started {
            Ok(engine) => engine,
            Err(e) => {
                self.connectors.release(&account).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.registry.insert(Arc::clone(&engine)) {
            engine.detach();
            self.connectors.release(&account).await;
            return Err(e.into());
        }

        self.ensure_fill_router(&account, connector);
        self.spawn_tick_loop(Arc::clone(&engine));
        Ok(engine)
    }

    /// Stop a live bot on operator request.
    pub async fn stop_bot(&self, id: BotId, reason: &str) -> AppResult<()> {
        let engine = self
            .registry
            .get(id)
            .ok_or(gridbot_engine::EngineError::BotNotFound(id))?;
        engine.stop(reason).await?;
        // Whoever removes the engine releases its connector reference
        if self.registry.remove(id).is_some() {
            self.connectors.release(engine.account()).await;
        }
        Ok(())
    }

    async fn sync_configured_bots(&self) -> AppResult<()> {
        for configured in &self.config.bots {
            match self.store.load_bot(configured.id).await {
                Ok(_) => debug!(bot_id = %configured.id, "Bot already stored"),
                Err(PersistenceError::BotNotFound(_)) => {
                    self.store.create_bot(configured.to_bot()).await?;
                    info!(
                        bot_id = %configured.id,
                        name = %configured.name,
                        symbol = %configured.symbol,
                        "Bot created from config"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn rehydrate(&self) -> AppResult<()> {
        let bots = self.store.list_running_bots().await?;
        info!(count = bots.len(), "Rehydrating running bots");

        for bot in bots {
            let (id, realized_pnl) = (bot.id, bot.realized_pnl);
            if let Err(e) = self.launch(bot).await {
                error!(bot_id = %id, error = %e, "Rehydration failed");
                let update = BotStateUpdate {
                    status: BotStatus::Error,
                    realized_pnl,
                    strategy_state: None,
                    reason: Some(format!("rehydration failed: {e}")),
                };
                self.store.save_bot_state(id, update).await?;
            }
        }
        Ok(())
    }

    async fn autostart(&self) {
        let ids: Vec<BotId> = self
            .config
            .bots
            .iter()
            .filter(|b| b.autostart)
            .map(|b| b.id)
            .collect();

        for id in ids {
            if self.registry.get(id).is_some() {
                continue;
            }
            let bot = match self.store.load_bot(id).await {
                Ok(bot) => bot,
                Err(e) => {
                    warn!(bot_id = %id, error = %e, "Autostart lookup failed");
                    continue;
                }
            };
            if bot.status != BotStatus::Stopped {
                // Error needs an operator reset first
                debug!(bot_id = %id, status = %bot.status, "Autostart skipped");
                continue;
            }
            if let Err(e) = self.launch(bot).await {
                error!(bot_id = %id, error = %e, "Autostart failed");
            }
        }
    }

    fn spawn_tick_loop(&self, engine: Arc<BotEngine>) {
        let registry = Arc::clone(&self.registry);
        let connectors = Arc::clone(&self.connectors);
        let token = engine.shutdown_token();
        let period = self.settings().tick_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match engine.tick().await {
                            Ok(TickOutcome::Tripped(_) | TickOutcome::Finished) => break,
                            Ok(outcome) => debug!(bot_id = %engine.bot_id(), ?outcome, "Tick"),
                            Err(e) if e.is_fatal() => {
                                error!(bot_id = %engine.bot_id(), error = %e, "Tick failed");
                            }
                            Err(e) => warn!(bot_id = %engine.bot_id(), error = %e, "Tick failed"),
                        }
                    }
                }
            }

            // An engine that halted itself is retired here; a detached one
            // stays registered until shutdown.
            if !matches!(engine.status(), BotStatus::Running | BotStatus::Paused)
                && registry.remove(engine.bot_id()).is_some()
            {
                connectors.release(engine.account()).await;
            }
            debug!(bot_id = %engine.bot_id(), status = %engine.status(), "Tick loop exited");
        });
        self.tasks.lock().push(handle);
    }

    fn ensure_fill_router(&self, account: &str, connector: Arc<dyn ExchangeConnector>) {
        {
            let mut routed = self.routed.lock();
            let current = routed.get(account).and_then(Weak::upgrade);
            if current.is_some_and(|c| same_connector(&c, &connector)) {
                return;
            }
            // First bot on the account, or the previous connector was retired
            routed.insert(account.to_string(), Arc::downgrade(&connector));
        }

        let registry = Arc::clone(&self.registry);
        let token = self.shutdown.clone();
        let reconcile_now = Arc::clone(&self.reconcile_now);
        let account = account.to_string();
        let mut fills = connector.stream_fills();

        let handle = tokio::spawn(async move {
            info!(account = %account, "Fill router started");
            let mut dispatch = FillDispatcher::new(account.as_str());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = fills.recv() => match received {
                        Ok(fill) => {
                            dispatch.dispatch(registry.all(), &fill);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            // Skipped fills are replayed from venue history
                            warn!(account = %account, missed, "Fill router lagged, reconciling");
                            reconcile_now.notify_one();
                        }
                        Err(RecvError::Closed) => {
                            info!(account = %account, "Fill stream closed");
                            break;
                        }
                    }
                }
            }
            dispatch.close().await;
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_reconcile_loop(&self) {
        let registry = Arc::clone(&self.registry);
        let token = self.shutdown.clone();
        let reconcile_now = Arc::clone(&self.reconcile_now);
        let reconciler = Reconciler::new(self.settings().clone());
        let period = self.settings().reconcile_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; start-up already reconciled
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = reconcile_now.notified() => ticker.reset(),
                }
                let reports = reconciler.run(&registry).await;
                debug!(bots = reports.len(), "Reconciliation sweep complete");
            }
        });
        self.tasks.lock().push(handle);
    }
}

fn same_connector(a: &Arc<dyn ExchangeConnector>, b: &Arc<dyn ExchangeConnector>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
