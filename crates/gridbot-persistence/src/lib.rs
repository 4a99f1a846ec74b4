//! Persistence for the gridbot trading engine.
//!
//! Bots, orders and trades are stored behind the `Persistence` trait:
//! - `MemoryStore`: volatile tables, for tests and paper trading
//! - `JournalStore`: JSON Lines journal replayed into memory on open
//!
//! Trades are unique per `(bot, venue trade id)`; a duplicate insert is a
//! no-op that returns `false`.

pub mod error;
pub mod journal;
pub mod memory;
pub mod model;
pub mod store;

pub use error::{PersistenceError, PersistenceResult};
pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use model::{Bot, BotStateUpdate, OrderLookup};
pub use store::Persistence;
