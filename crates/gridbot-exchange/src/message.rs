//! Binance wire types: REST responses and user-data stream events.

use chrono::{DateTime, TimeZone, Utc};
use gridbot_core::{ClientOrderId, FillEvent, OrderSide, OrderType, Price, Size};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::connector::{VenueOrder, VenueOrderStatus};
use crate::error::{ExchangeError, ExchangeResult};

/// Quote assets tried in order when mapping a venue symbol back.
const KNOWN_QUOTES: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "BTC", "ETH", "BNB", "EUR", "TRY",
];

/// `"BTC/USDT"` -> `"BTCUSDT"`.
pub fn to_venue_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

/// `"BTCUSDT"` -> `"BTC/USDT"`, when the quote asset is recognised.
pub fn from_venue_symbol(venue: &str) -> String {
    KNOWN_QUOTES
        .iter()
        .find_map(|quote| {
            venue
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| format!("{base}/{quote}"))
        })
        .unwrap_or_else(|| venue.to_string())
}

pub(crate) fn parse_side(raw: &str) -> ExchangeResult<OrderSide> {
    match raw {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(ExchangeError::InvalidResponse(format!("unknown side {other}"))),
    }
}

pub(crate) fn parse_order_type(raw: &str) -> OrderType {
    if raw == "MARKET" {
        OrderType::Market
    } else {
        OrderType::Limit
    }
}

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn client_id(raw: &str) -> Option<ClientOrderId> {
    (!raw.is_empty()).then(|| ClientOrderId::from(raw))
}

// ============================================================================
// REST responses
// ============================================================================

/// Error body returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

impl ApiErrorBody {
    /// Map venue error codes onto the error taxonomy.
    pub fn into_error(self, http_status: u16) -> ExchangeError {
        match (self.code, http_status) {
            (-1003, _) | (_, 429) | (_, 418) => ExchangeError::RateLimited(self.msg),
            (-2010, _) if self.msg.to_lowercase().contains("insufficient") => {
                ExchangeError::InsufficientBalance(self.msg)
            }
            (-2011 | -2013, _) => ExchangeError::OrderNotFound(self.msg),
            (-1022 | -2014 | -2015, _) => ExchangeError::Auth(self.msg),
            (-1001 | -1007, _) => ExchangeError::Network(self.msg),
            (code, _) => ExchangeError::Rejected {
                code,
                message: self.msg,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerPriceResponse {
    pub symbol: String,
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct AccountResponse {
    pub balances: Vec<BalanceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    pub order_id: u64,
    pub client_order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    #[serde(default)]
    pub cummulative_quote_qty: Decimal,
    pub status: VenueOrderStatus,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
}

impl OrderResponse {
    pub fn into_venue_order(self) -> ExchangeResult<VenueOrder> {
        let average_price = (self.executed_qty > Decimal::ZERO)
            .then(|| Price::new(self.cummulative_quote_qty / self.executed_qty));
        Ok(VenueOrder {
            venue_order_id: self.order_id.to_string(),
            client_order_id: client_id(&self.client_order_id),
            symbol: from_venue_symbol(&self.symbol),
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type),
            price: Price::new(self.price),
            quantity: Size::new(self.orig_qty),
            filled_quantity: Size::new(self.executed_qty),
            average_price,
            status: self.status,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MyTradeResponse {
    pub symbol: String,
    pub id: u64,
    pub order_id: u64,
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub time: i64,
    pub is_buyer: bool,
}

impl MyTradeResponse {
    pub fn into_fill(self) -> FillEvent {
        FillEvent {
            symbol: from_venue_symbol(&self.symbol),
            venue_order_id: self.order_id.to_string(),
            client_order_id: None,
            venue_trade_id: self.id.to_string(),
            side: if self.is_buyer {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            price: Price::new(self.price),
            quantity: Size::new(self.qty),
            fee: self.commission,
            fee_asset: Some(self.commission_asset),
            executed_at: millis_to_utc(self.time),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<SymbolFilter>,
}

/// Filters we read; others are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price { tick_size: Decimal },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: Decimal, min_qty: Decimal },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional { min_notional: Decimal },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional { min_notional: Decimal },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    pub listen_key: String,
}

// ============================================================================
// User data stream
// ============================================================================

/// Raw `executionReport` event.
#[derive(Debug, Deserialize)]
pub struct ExecutionReportRaw {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    /// Execution type: NEW, TRADE, CANCELED, ...
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "i")]
    pub order_id: u64,
    #[serde(rename = "l")]
    pub last_qty: Decimal,
    #[serde(rename = "L")]
    pub last_price: Decimal,
    #[serde(rename = "n")]
    pub commission: Decimal,
    #[serde(rename = "N")]
    pub commission_asset: Option<String>,
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// -1 when the event is not a trade.
    #[serde(rename = "t")]
    pub trade_id: i64,
}

/// Decoded user-stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Fill(FillEvent),
    /// The listen key expired; the stream must reconnect with a new one.
    ListenKeyExpired,
    Other,
}

/// Parse one user-stream text frame.
///
/// Accepts both raw frames and the combined-stream `{"stream", "data"}`
/// envelope.
pub fn parse_user_event(text: &str) -> ExchangeResult<UserEvent> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let payload = value.get("data").unwrap_or(&value);

    match payload.get("e").and_then(|e| e.as_str()) {
        Some("executionReport") => {
            let raw: ExecutionReportRaw = serde_json::from_value(payload.clone())?;
            if raw.execution_type != "TRADE" || raw.trade_id < 0 {
                return Ok(UserEvent::Other);
            }
            Ok(UserEvent::Fill(FillEvent {
                symbol: from_venue_symbol(&raw.symbol),
                venue_order_id: raw.order_id.to_string(),
                client_order_id: client_id(&raw.client_order_id),
                venue_trade_id: raw.trade_id.to_string(),
                side: parse_side(&raw.side)?,
                price: Price::new(raw.last_price),
                quantity: Size::new(raw.last_qty),
                fee: raw.commission,
                fee_asset: raw.commission_asset,
                executed_at: millis_to_utc(raw.trade_time),
            }))
        }
        Some("listenKeyExpired") => Ok(UserEvent::ListenKeyExpired),
        _ => Ok(UserEvent::Other),
    }
}
