//! Core domain types for the gridbot trading engine.
//!
//! This crate provides the types every other crate speaks in:
//! - `Price`, `Size`: exact decimal newtypes
//! - `OrderSide`, `OrderType`, `ClientOrderId`, `OrderPurpose`: order vocabulary
//! - `Order`, `OrderStatus`, `DesiredOrder`: order lifecycle state machine
//! - `Trade`, `FillEvent`: fill records from the venue
//! - `BotId`, `BotStatus`: bot lifecycle state machine
//! - `FifoLedger`: the single FIFO realized P&L implementation

pub mod bot;
pub mod decimal;
pub mod error;
pub mod execution;
pub mod order;
pub mod pnl;
pub mod types;

pub use bot::{BotId, BotStatus, StrategyKind};
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use execution::{DesiredOrder, FillEvent, GridSlot, Order, OrderStatus, Trade};
pub use order::{ClientOrderId, OrderPurpose, OrderSide, OrderType};
pub use pnl::{fee_to_quote, FifoLedger, FifoOutcome, Lot};
pub use types::{
    split_symbol, ActiveOrder, Balance, BoxFuture, MarketSnapshot, SymbolRules, Ticker,
};
