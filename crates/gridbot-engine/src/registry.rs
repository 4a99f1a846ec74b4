//! Live bot engines, keyed by bot id.
//!
//! Owned by the supervisor and passed by reference to whatever issues ticks
//! and reconciliation passes.

use std::collections::HashMap;
use std::sync::Arc;

use gridbot_core::{BotId, BotStatus};
use gridbot_telemetry::Metrics;
use parking_lot::RwLock;

use crate::engine::{BotEngine, TickOutcome};
use crate::error::{EngineError, EngineResult};

#[derive(Default)]
pub struct BotRegistry {
    engines: RwLock<HashMap<BotId, Arc<BotEngine>>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, engine: Arc<BotEngine>) -> EngineResult<()> {
        let mut engines = self.engines.write();
        let id = engine.bot_id();
        if engines.contains_key(&id) {
            return Err(EngineError::AlreadyRunning(id));
        }
        engines.insert(id, engine);
        Metrics::bots_running(engines.len() as i64);
        Ok(())
    }

    pub fn get(&self, id: BotId) -> Option<Arc<BotEngine>> {
        self.engines.read().get(&id).cloned()
    }

    pub fn remove(&self, id: BotId) -> Option<Arc<BotEngine>> {
        let mut engines = self.engines.write();
        let removed = engines.remove(&id);
        Metrics::bots_running(engines.len() as i64);
        removed
    }

    pub fn all(&self) -> Vec<Arc<BotEngine>> {
        self.engines.read().values().cloned().collect()
    }

    /// Engines in `running` or `paused`.
    pub fn running(&self) -> Vec<Arc<BotEngine>> {
        self.engines
            .read()
            .values()
            .filter(|e| matches!(e.status(), BotStatus::Running | BotStatus::Paused))
            .cloned()
            .collect()
    }

    /// Registered bots trading `symbol` on `account`.
    pub fn count_on(&self, account: &str, symbol: &str) -> usize {
        self.engines
            .read()
            .values()
            .filter(|e| e.account() == account && e.symbol() == symbol)
            .count()
    }

    pub fn len(&self) -> usize {
        self.engines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.read().is_empty()
    }

    pub async fn tick(&self, id: BotId) -> EngineResult<TickOutcome> {
        let engine = self.get(id).ok_or(EngineError::BotNotFound(id))?;
        engine.tick().await
    }

    /// Stop a bot and drop it from the registry.
    pub async fn stop(&self, id: BotId, reason: &str) -> EngineResult<()> {
        let engine = self.get(id).ok_or(EngineError::BotNotFound(id))?;
        engine.stop(reason).await?;
        self.remove(id);
        Ok(())
    }
}
