//! Venue-neutral connector contract.

use chrono::{DateTime, Utc};
use gridbot_core::{
    Balance, BoxFuture, ClientOrderId, FillEvent, OrderSide, OrderStatus, OrderType, Price, Size,
    SymbolRules, Ticker,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ExchangeResult;

/// Order submission parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// Internal `BASE/QUOTE` symbol.
    pub symbol: String,
    /// Sent to the venue so an unknown-outcome submit can be looked up later.
    pub client_order_id: ClientOrderId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Size,
    /// Required for limit orders, ignored for market orders.
    pub price: Option<Price>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The order filled before the cancel landed; the fill path owns it.
    AlreadyFilled,
    /// The venue does not know the order.
    NotFound,
}

/// How to identify an order at the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    Venue(String),
    Client(ClientOrderId),
}

/// Venue-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Rejected,
    Expired,
}

impl VenueOrderStatus {
    /// Equivalent local status.
    pub fn to_order_status(self) -> OrderStatus {
        match self {
            Self::New => OrderStatus::Open,
            Self::PartiallyFilled => OrderStatus::PartiallyFilled,
            Self::Filled => OrderStatus::Filled,
            Self::PendingCancel => OrderStatus::Cancelling,
            Self::Canceled | Self::Expired => OrderStatus::Cancelled,
            Self::Rejected => OrderStatus::Rejected,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled | Self::PendingCancel)
    }
}

/// Order as the venue sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueOrder {
    pub venue_order_id: String,
    pub client_order_id: Option<ClientOrderId>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Price,
    pub quantity: Size,
    pub filled_quantity: Size,
    /// Volume-weighted price of the executed quantity, if any.
    pub average_price: Option<Price>,
    pub status: VenueOrderStatus,
}

/// Unified interface over a trading venue.
///
/// One instance per exchange account. Bots on the same account share it,
/// and with it the account's rate limiter and user stream.
pub trait ExchangeConnector: Send + Sync {
    /// Venue name for logs and metrics.
    fn name(&self) -> &str;

    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>>;

    fn get_balance<'a>(&'a self, asset: &'a str) -> BoxFuture<'a, ExchangeResult<Balance>>;

    /// Submit an order. Returns the venue order id.
    fn create_order(&self, request: OrderRequest) -> BoxFuture<'_, ExchangeResult<String>>;

    fn cancel_order<'a>(
        &'a self,
        symbol: &'a str,
        venue_order_id: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<CancelOutcome>>;

    fn fetch_order<'a>(
        &'a self,
        symbol: &'a str,
        order: OrderRef,
    ) -> BoxFuture<'a, ExchangeResult<VenueOrder>>;

    fn get_open_orders<'a>(&'a self, symbol: &'a str)
        -> BoxFuture<'a, ExchangeResult<Vec<VenueOrder>>>;

    /// Tick, step and minimums for `symbol`.
    fn get_symbol_rules<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<SymbolRules>>;

    fn get_min_notional<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Decimal>> {
        Box::pin(async move { Ok(self.get_symbol_rules(symbol).await?.min_notional) })
    }

    /// Account executions on `symbol` since `since`, oldest first.
    fn get_recent_trades<'a>(
        &'a self,
        symbol: &'a str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'a, ExchangeResult<Vec<FillEvent>>>;

    /// Subscribe to the account's fill stream.
    ///
    /// Survives reconnects: the connector keeps publishing into the same
    /// channel after a disconnect.
    fn stream_fills(&self) -> broadcast::Receiver<FillEvent>;

    /// Stop background tasks. Idempotent.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}
