//! Bot orchestration for the gridbot trading engine.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (binary)
//!   ├─ BotRegistry ──► BotEngine (one per running bot)
//!   │                    ├─ Strategy (grid / dca)
//!   │                    ├─ CircuitBreaker
//!   │                    └─ OrderManager ──► ExchangeConnector
//!   │                                    └─► Persistence
//!   ├─ fill router: ExchangeConnector::stream_fills ──► BotEngine::on_fill
//!   └─ Reconciler: venue history ──► BotEngine::on_fill / order repair
//! ```
//!
//! Bots run independently; the only shared state is the per-account
//! connector (rate limiter, user stream) and the store.

pub mod engine;
pub mod error;
pub mod notify;
pub mod order_manager;
pub mod reconcile;
pub mod registry;
pub mod settings;

pub use engine::{BotEngine, TickOutcome};
pub use error::{EngineError, EngineResult};
pub use notify::{BotEvent, ChannelNotifier, LogNotifier, NotificationSink, NullNotifier};
pub use order_manager::{is_conflict, BotBook, FillOutcome, FillSource, OrderManager};
pub use reconcile::{ReconcileReport, Reconciler};
pub use registry::BotRegistry;
pub use settings::EngineSettings;
