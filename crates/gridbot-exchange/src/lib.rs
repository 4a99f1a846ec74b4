//! Exchange connectivity for the gridbot engine.
//!
//! Provides:
//! - The `ExchangeConnector` trait every venue implements
//! - A signed REST + user-data-stream connector for Binance-style spot venues
//! - A paper venue that matches resting orders against a driven price
//! - Sliding-window rate limiting and bounded retry with backoff
//! - Per-account connector pooling so bots share one stream

pub mod binance;
pub mod connector;
pub mod error;
pub mod message;
pub mod paper;
pub mod pool;
pub mod rate_limiter;
pub mod retry;
pub mod stream;

pub use binance::{BinanceConfig, BinanceConnector, Credentials};
pub use connector::{
    CancelOutcome, ExchangeConnector, OrderRef, OrderRequest, VenueOrder, VenueOrderStatus,
};
pub use error::{ExchangeError, ExchangeResult};
pub use message::{from_venue_symbol, to_venue_symbol};
pub use paper::PaperExchange;
pub use pool::{AccountKey, ConnectorPool};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use stream::{StreamConfig, StreamEndpoint, StreamState, UserStream};
