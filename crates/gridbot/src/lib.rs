//! Gridbot supervisor.
//!
//! Wires configured exchange accounts, the store and the bot engines
//! together:
//! - Creates bots declared in the config file
//! - Rehydrates bots persisted as running, then starts autostart bots
//! - Drives one tick loop per bot and one fill router per account, which
//!   queues fills per bot
//! - Runs periodic reconciliation across all bots

pub mod accounts;
pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;

pub use accounts::AccountConnectors;
pub use app::Supervisor;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
