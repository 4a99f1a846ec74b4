//! Binance spot connector.
//!
//! REST calls are HMAC-SHA256 signed and pass through the account's shared
//! rate limiter. Reads are retried under the connector's `RetryPolicy`;
//! order submission is not, because a retried submit with an unknown first
//! outcome risks a duplicate. The order manager owns that decision.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gridbot_core::{
    split_symbol, Balance, BoxFuture, FillEvent, OrderType, Price, SymbolRules, Ticker,
};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::connector::{
    CancelOutcome, ExchangeConnector, OrderRef, OrderRequest, VenueOrder, VenueOrderStatus,
};
use crate::error::{ExchangeError, ExchangeResult};
use crate::message::{
    to_venue_symbol, AccountResponse, ApiErrorBody, ExchangeInfoResponse, ListenKeyResponse,
    MyTradeResponse, NewOrderResponse, OrderResponse, SymbolFilter, TickerPriceResponse,
};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::stream::{StreamConfig, StreamEndpoint, UserStream};

type HmacSha256 = Hmac<Sha256>;

const FILL_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Credentials
// ============================================================================

/// API key pair. The secret is zeroed on drop and never printed.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Read the key pair from the named environment variables.
    pub fn from_env(key_var: &str, secret_var: &str) -> ExchangeResult<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| ExchangeError::Auth(format!("{key_var} is not set")))?;
        let secret = std::env::var(secret_var)
            .map_err(|_| ExchangeError::Auth(format!("{secret_var} is not set")))?;
        Ok(Self::new(api_key, secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Lowercase hex HMAC-SHA256 of `payload`.
    pub fn sign(&self, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub rest_url: String,
    pub stream: StreamConfig,
    pub recv_window_ms: u64,
    /// Bounded timeout on every REST call.
    pub request_timeout: Duration,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.binance.com".to_string(),
            stream: StreamConfig::default(),
            recv_window_ms: 5000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl BinanceConfig {
    pub fn testnet() -> Self {
        Self {
            rest_url: "https://testnet.binance.vision".to_string(),
            stream: StreamConfig {
                url: "wss://testnet.binance.vision/ws".to_string(),
                ..StreamConfig::default()
            },
            ..Self::default()
        }
    }
}

// ============================================================================
// REST client
// ============================================================================

/// Signed REST transport shared by the connector and its user stream.
struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    limiter: Arc<RateLimiter>,
    recv_window_ms: u64,
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

impl RestClient {
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: String,
        with_key: bool,
    ) -> ExchangeResult<T> {
        self.limiter.acquire().await;

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!(%method, path, "Venue request");

        let mut request = self.http.request(method, &url);
        if with_key {
            request = request.header("X-MBX-APIKEY", self.credentials.api_key());
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::InvalidResponse(format!("{path}: {e}")));
        }
        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(api_error) => Err(api_error.into_error(status.as_u16())),
            Err(_) if status.as_u16() == 429 || status.as_u16() == 418 => {
                Err(ExchangeError::RateLimited(status.to_string()))
            }
            Err(_) if status.is_server_error() => {
                Err(ExchangeError::Network(format!("{status}: {body}")))
            }
            Err(_) => Err(ExchangeError::InvalidResponse(format!("{status}: {body}"))),
        }
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        self.send(Method::GET, path, encode_query(&params), false).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = encode_query(&params);
        let signature = self.credentials.sign(&query)?;
        self.send(method, path, format!("{query}&signature={signature}"), true)
            .await
    }
}

impl StreamEndpoint for RestClient {
    fn create_listen_key(&self) -> BoxFuture<'_, ExchangeResult<String>> {
        Box::pin(async move {
            let response: ListenKeyResponse = self
                .send(Method::POST, "/api/v3/userDataStream", String::new(), true)
                .await?;
            info!("Created listen key");
            Ok(response.listen_key)
        })
    }

    fn keepalive_listen_key<'a>(&'a self, listen_key: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .send(
                    Method::PUT,
                    "/api/v3/userDataStream",
                    format!("listenKey={listen_key}"),
                    true,
                )
                .await?;
            Ok(())
        })
    }
}

// ============================================================================
// Connector
// ============================================================================

pub struct BinanceConnector {
    rest: Arc<RestClient>,
    retry: RetryPolicy,
    rules: DashMap<String, SymbolRules>,
    fills: broadcast::Sender<FillEvent>,
    stream: Arc<UserStream>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl BinanceConnector {
    /// Build a connector. `limiter` is the account's shared limiter.
    pub fn new(
        config: BinanceConfig,
        credentials: Credentials,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExchangeError::ConnectionFailed(e.to_string()))?;
        let rest = Arc::new(RestClient {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            credentials,
            limiter,
            recv_window_ms: config.recv_window_ms,
        });
        let (fills, _) = broadcast::channel(FILL_CHANNEL_CAPACITY);
        let endpoint: Arc<dyn StreamEndpoint> = rest.clone();
        let stream = Arc::new(UserStream::new(config.stream, endpoint, fills.clone()));

        Ok(Self {
            rest,
            retry,
            rules: DashMap::new(),
            fills,
            stream,
            stream_task: Mutex::new(None),
        })
    }

    /// Start the user stream if it is not already running.
    fn ensure_stream(&self) {
        let mut task = self.stream_task.lock();
        if task.is_some() || self.stream.is_shutdown() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            *task = Some(self.stream.spawn());
        } else {
            warn!("No runtime available, user stream not started");
        }
    }

    fn format_decimal(value: Decimal) -> String {
        value.normalize().to_string()
    }

    async fn fetch_symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let venue_symbol = to_venue_symbol(symbol);
        let info: ExchangeInfoResponse = self
            .retry
            .run("exchange_info", || {
                self.rest
                    .public("/api/v3/exchangeInfo", vec![("symbol", venue_symbol.clone())])
            })
            .await?;
        let entry = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == venue_symbol)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("unknown symbol {symbol}")))?;

        let mut rules = SymbolRules::unrestricted(symbol);
        for filter in entry.filters {
            match filter {
                SymbolFilter::Price { tick_size } => rules.tick_size = tick_size,
                SymbolFilter::LotSize { step_size, min_qty } => {
                    rules.step_size = step_size;
                    rules.min_qty = min_qty;
                }
                SymbolFilter::Notional { min_notional }
                | SymbolFilter::MinNotional { min_notional } => rules.min_notional = min_notional,
                SymbolFilter::Other => {}
            }
        }
        Ok(rules)
    }
}

impl ExchangeConnector for BinanceConnector {
    fn name(&self) -> &str {
        "binance"
    }

    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>> {
        Box::pin(async move {
            let venue_symbol = to_venue_symbol(symbol);
            let response: TickerPriceResponse = self
                .retry
                .run("ticker", || {
                    self.rest
                        .public("/api/v3/ticker/price", vec![("symbol", venue_symbol.clone())])
                })
                .await?;
            Ok(Ticker::new(symbol, Price::new(response.price)))
        })
    }

    fn get_balance<'a>(&'a self, asset: &'a str) -> BoxFuture<'a, ExchangeResult<Balance>> {
        Box::pin(async move {
            let account: AccountResponse = self
                .retry
                .run("account", || {
                    self.rest.signed(Method::GET, "/api/v3/account", Vec::new())
                })
                .await?;
            Ok(account
                .balances
                .into_iter()
                .find(|b| b.asset == asset)
                .map(|b| Balance {
                    asset: b.asset,
                    free: b.free,
                    locked: b.locked,
                })
                .unwrap_or_else(|| Balance {
                    asset: asset.to_string(),
                    ..Balance::default()
                }))
        })
    }

    fn create_order(&self, request: OrderRequest) -> BoxFuture<'_, ExchangeResult<String>> {
        Box::pin(async move {
            split_symbol(&request.symbol)?;
            let mut params = vec![
                ("symbol", to_venue_symbol(&request.symbol)),
                ("side", request.side.as_str().to_uppercase()),
                (
                    "type",
                    match request.order_type {
                        OrderType::Limit => "LIMIT".to_string(),
                        OrderType::Market => "MARKET".to_string(),
                    },
                ),
                ("quantity", Self::format_decimal(request.quantity.inner())),
                ("newClientOrderId", request.client_order_id.to_string()),
                ("newOrderRespType", "ACK".to_string()),
            ];
            if request.order_type == OrderType::Limit {
                let price = request.price.ok_or_else(|| ExchangeError::Rejected {
                    code: 0,
                    message: "limit order without price".to_string(),
                })?;
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", Self::format_decimal(price.inner())));
            }

            let response: NewOrderResponse = self
                .rest
                .signed(Method::POST, "/api/v3/order", params)
                .await?;
            info!(
                symbol = %request.symbol,
                side = %request.side,
                venue_order_id = response.order_id,
                client_order_id = %response.client_order_id,
                "Order accepted by venue"
            );
            Ok(response.order_id.to_string())
        })
    }

    fn cancel_order<'a>(
        &'a self,
        symbol: &'a str,
        venue_order_id: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<CancelOutcome>> {
        Box::pin(async move {
            let params = vec![
                ("symbol", to_venue_symbol(symbol)),
                ("orderId", venue_order_id.to_string()),
            ];
            let result: ExchangeResult<serde_json::Value> = self
                .retry
                .run("cancel", || {
                    self.rest
                        .signed(Method::DELETE, "/api/v3/order", params.clone())
                })
                .await;

            match result {
                Ok(_) => Ok(CancelOutcome::Cancelled),
                Err(ExchangeError::OrderNotFound(_)) => {
                    // Unknown to cancel: either filled already or never existed
                    match self
                        .fetch_order(symbol, OrderRef::Venue(venue_order_id.to_string()))
                        .await
                    {
                        Ok(order) if order.status == VenueOrderStatus::Filled => {
                            Ok(CancelOutcome::AlreadyFilled)
                        }
                        Ok(order) if !order.status.is_open() => Ok(CancelOutcome::Cancelled),
                        Ok(_) => Err(ExchangeError::Rejected {
                            code: -2011,
                            message: "cancel rejected for open order".to_string(),
                        }),
                        Err(ExchangeError::OrderNotFound(_)) => Ok(CancelOutcome::NotFound),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        })
    }

    fn fetch_order<'a>(
        &'a self,
        symbol: &'a str,
        order: OrderRef,
    ) -> BoxFuture<'a, ExchangeResult<VenueOrder>> {
        Box::pin(async move {
            let mut params = vec![("symbol", to_venue_symbol(symbol))];
            match &order {
                OrderRef::Venue(id) => params.push(("orderId", id.clone())),
                OrderRef::Client(id) => params.push(("origClientOrderId", id.to_string())),
            }
            let response: OrderResponse = self
                .retry
                .run("fetch_order", || {
                    self.rest.signed(Method::GET, "/api/v3/order", params.clone())
                })
                .await?;
            response.into_venue_order()
        })
    }

    fn get_open_orders<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<Vec<VenueOrder>>> {
        Box::pin(async move {
            let params = vec![("symbol", to_venue_symbol(symbol))];
            let response: Vec<OrderResponse> = self
                .retry
                .run("open_orders", || {
                    self.rest
                        .signed(Method::GET, "/api/v3/openOrders", params.clone())
                })
                .await?;
            response
                .into_iter()
                .map(OrderResponse::into_venue_order)
                .collect()
        })
    }

    fn get_symbol_rules<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<SymbolRules>> {
        Box::pin(async move {
            if let Some(rules) = self.rules.get(symbol) {
                return Ok(rules.clone());
            }
            let rules = self.fetch_symbol_rules(symbol).await?;
            self.rules.insert(symbol.to_string(), rules.clone());
            Ok(rules)
        })
    }

    fn get_recent_trades<'a>(
        &'a self,
        symbol: &'a str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'a, ExchangeResult<Vec<FillEvent>>> {
        Box::pin(async move {
            let params = vec![
                ("symbol", to_venue_symbol(symbol)),
                ("startTime", since.timestamp_millis().to_string()),
                ("limit", limit.clamp(1, 1000).to_string()),
            ];
            let response: Vec<MyTradeResponse> = self
                .retry
                .run("my_trades", || {
                    self.rest
                        .signed(Method::GET, "/api/v3/myTrades", params.clone())
                })
                .await?;
            Ok(response.into_iter().map(MyTradeResponse::into_fill).collect())
        })
    }

    fn stream_fills(&self) -> broadcast::Receiver<FillEvent> {
        self.ensure_stream();
        self.fills.subscribe()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stream.shutdown();
            let task = self.stream_task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(error = %e, "User stream task ended abnormally");
                }
            }
            info!("Binance connector shut down");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_venue_example() {
        let credentials = Credentials::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            credentials.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let credentials = Credentials::new("key", "super-secret");
        let printed = format!("{credentials:?}");
        assert!(printed.contains("key"));
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_encode_query_preserves_order() {
        let query = encode_query(&[
            ("symbol", "BTCUSDT".to_string()),
            ("limit", "100".to_string()),
        ]);
        assert_eq!(query, "symbol=BTCUSDT&limit=100");
    }

    #[test]
    fn test_decimal_formatting() {
        use rust_decimal_macros::dec;
        assert_eq!(BinanceConnector::format_decimal(dec!(0.00100000)), "0.001");
        assert_eq!(BinanceConnector::format_decimal(dec!(43000.00)), "43000");
    }
}
