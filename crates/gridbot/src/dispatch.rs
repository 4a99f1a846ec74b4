//! Per-bot fill queues behind an account's fill router.
//!
//! The router hands every fill to each bot on the account trading the
//! fill's symbol; each bot drains its own queue in order. A bot busy in a
//! long tick only delays its own fills.
//!
//! ```text
//! fill stream -> router -> queue(bot A) -> A.on_fill
//!                       -> queue(bot B) -> B.on_fill
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use gridbot_core::{BotId, FillEvent};
use gridbot_engine::{BotEngine, FillOutcome, FillSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct BotQueue {
    engine: Arc<BotEngine>,
    tx: mpsc::UnboundedSender<FillEvent>,
}

pub struct FillDispatcher {
    account: String,
    queues: HashMap<BotId, BotQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl FillDispatcher {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            queues: HashMap::new(),
            workers: Vec::new(),
        }
    }

    /// Queue `fill` for every engine on this account trading its symbol.
    /// Returns the number of queues it was handed to.
    ///
    /// Queues of bots missing from `engines` are closed; their workers
    /// finish what is already queued and exit.
    pub fn dispatch(&mut self, engines: Vec<Arc<BotEngine>>, fill: &FillEvent) -> usize {
        let on_account: Vec<_> = engines
            .into_iter()
            .filter(|e| e.account() == self.account)
            .collect();
        self.queues
            .retain(|id, _| on_account.iter().any(|e| e.bot_id() == *id));
        self.workers.retain(|w| !w.is_finished());

        let mut queued = 0;
        for engine in on_account.into_iter().filter(|e| e.symbol() == fill.symbol) {
            let tx = self.queue_for(engine);
            if tx.send(fill.clone()).is_ok() {
                queued += 1;
            }
        }
        if queued == 0 {
            debug!(
                account = %self.account,
                trade_id = %fill.venue_trade_id,
                "Fill has no bot on its symbol"
            );
        }
        queued
    }

    /// Close every queue and wait for the workers to drain.
    pub async fn close(mut self) {
        self.queues.clear();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(account = %self.account, error = %e, "Fill worker ended abnormally");
            }
        }
    }

    fn queue_for(&mut self, engine: Arc<BotEngine>) -> mpsc::UnboundedSender<FillEvent> {
        let id = engine.bot_id();
        if let Some(queue) = self.queues.get(&id) {
            // A relaunched bot is a new engine under the same id
            if Arc::ptr_eq(&queue.engine, &engine) && !queue.tx.is_closed() {
                return queue.tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.workers.push(tokio::spawn(drain(Arc::clone(&engine), rx)));
        self.queues.insert(
            id,
            BotQueue {
                engine,
                tx: tx.clone(),
            },
        );
        tx
    }
}

async fn drain(engine: Arc<BotEngine>, mut rx: mpsc::UnboundedReceiver<FillEvent>) {
    debug!(bot_id = %engine.bot_id(), "Fill worker started");
    while let Some(fill) = rx.recv().await {
        match engine.on_fill(&fill, FillSource::Stream, false).await {
            Ok(FillOutcome::Applied { .. } | FillOutcome::Duplicate | FillOutcome::Unmatched) => {}
            Err(e) => error!(
                bot_id = %engine.bot_id(),
                trade_id = %fill.venue_trade_id,
                error = %e,
                "Failed to apply fill"
            ),
        }
    }
    debug!(bot_id = %engine.bot_id(), "Fill worker exited");
}
