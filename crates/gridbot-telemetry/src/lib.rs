//! Prometheus metrics and structured logging for the gridbot engine.
//!
//! - Structured logging with tracing, pretty for development and JSON in production
//! - Prometheus counters for order flow, fills, P&L, breaker trips and reconciliation

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::Metrics;
