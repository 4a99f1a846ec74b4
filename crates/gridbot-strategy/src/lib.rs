//! Strategy engines for the gridbot trading engine.
//!
//! Strategies are pure state machines: they see a `MarketSnapshot`, return
//! the orders they want, and change state only through `on_order_filled`.
//!
//! # Architecture
//!
//! ```text
//! BotEngine.tick()
//!   ├─ Strategy::calculate_orders(snapshot) -> Vec<DesiredOrder>
//!   │    ├─ GridStrategy: rung slots, recycle on fill, stop-loss unwind
//!   │    └─ DcaStrategy: time / drop triggers, budget, take-profit
//!   └─ OrderManager.submit(..)
//!
//! OrderManager.apply_fill() ──► Strategy::on_order_filled(fill)
//! ```

pub mod config;
pub mod dca;
pub mod error;
pub mod fill;
pub mod grid;
pub mod strategy;

pub use config::{
    DcaConfig, DcaInterval, DcaType, GridConfig, IntervalPreset, SafetyOrder, StrategyConfig,
};
pub use dca::{DcaState, DcaStrategy};
pub use error::{StrategyError, StrategyResult};
pub use fill::StrategyFill;
pub use grid::{GridLevel, GridMode, GridState, GridStrategy, LevelSlot};
pub use strategy::{StateBlob, Strategy, StrategyState, STATE_VERSION};
