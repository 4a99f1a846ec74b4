//! Per-bot circuit breaker for the gridbot trading engine.
//!
//! Consulted synchronously before every submission:
//! - Order rate: submissions in the rolling minute
//! - Loss: realized losses in the rolling hour plus current unrealized loss,
//!   as a percentage of the bot's investment
//! - Price sanity: order price distance from the last market price
//!
//! A trip latches until an operator resets it.

pub mod breaker;
pub mod error;
pub mod latch;

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};
pub use error::{RiskError, RiskResult};
pub use latch::{TripLatch, TripReason};
