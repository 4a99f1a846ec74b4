//! Simulated venue for paper trading and tests.
//!
//! Resting limit orders match whenever the price moves through them. Fees
//! are charged in the quote asset on both sides. The price can be driven
//! manually with `set_price` or sourced from a live connector's ticker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gridbot_core::{
    split_symbol, Balance, BoxFuture, ClientOrderId, FillEvent, OrderSide, OrderType, Price, Size,
    SymbolRules, Ticker,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connector::{
    CancelOutcome, ExchangeConnector, OrderRef, OrderRequest, VenueOrder, VenueOrderStatus,
};
use crate::error::{ExchangeError, ExchangeResult};

const DEFAULT_FEE_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

#[derive(Debug, Clone)]
struct PaperOrder {
    order: VenueOrder,
    /// Balance still reserved for the unfilled remainder.
    locked: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, Price>,
    balances: HashMap<String, Balance>,
    orders: BTreeMap<u64, PaperOrder>,
    client_index: HashMap<ClientOrderId, u64>,
    trades: Vec<FillEvent>,
    rules: HashMap<String, SymbolRules>,
    next_order_id: u64,
    next_trade_id: u64,
}

impl PaperState {
    fn balance_mut(&mut self, asset: &str) -> &mut Balance {
        self.balances
            .entry(asset.to_string())
            .or_insert_with(|| Balance {
                asset: asset.to_string(),
                ..Balance::default()
            })
    }

    fn free(&self, asset: &str) -> Decimal {
        self.balances.get(asset).map(|b| b.free).unwrap_or_default()
    }

    fn lookup(&self, order: &OrderRef) -> Option<u64> {
        match order {
            OrderRef::Venue(id) => id.parse().ok().filter(|id| self.orders.contains_key(id)),
            OrderRef::Client(id) => self.client_index.get(id).copied(),
        }
    }

    /// Execute `quantity` of order `id` at `price` and settle balances.
    fn execute(&mut self, id: u64, quantity: Size, price: Price, fee_rate: Decimal) -> Option<FillEvent> {
        let paper = self.orders.get(&id)?.clone();
        let (base, quote) = split_symbol(&paper.order.symbol).ok()?;
        let (base, quote) = (base.to_string(), quote.to_string());
        let notional = quantity.notional(price);
        let fee = notional * fee_rate;

        let released = match paper.order.side {
            OrderSide::Buy => {
                let reserved = match paper.order.order_type {
                    OrderType::Limit => quantity.notional(paper.order.price),
                    OrderType::Market => Decimal::ZERO,
                };
                let quote_balance = self.balance_mut(&quote);
                quote_balance.locked -= reserved;
                // Limit buys pay from the reservation, market buys from free
                quote_balance.free += reserved - notional - fee;
                self.balance_mut(&base).free += quantity.inner();
                reserved
            }
            OrderSide::Sell => {
                let base_balance = self.balance_mut(&base);
                base_balance.locked -= quantity.inner();
                self.balance_mut(&quote).free += notional - fee;
                quantity.inner()
            }
        };

        self.next_trade_id += 1;
        let fill = FillEvent {
            symbol: paper.order.symbol.clone(),
            venue_order_id: id.to_string(),
            client_order_id: paper.order.client_order_id.clone(),
            venue_trade_id: self.next_trade_id.to_string(),
            side: paper.order.side,
            price,
            quantity,
            fee,
            fee_asset: Some(quote),
            executed_at: Utc::now(),
        };

        if let Some(entry) = self.orders.get_mut(&id) {
            entry.locked -= released.min(entry.locked);
            let prior = entry
                .order
                .average_price
                .map(|p| entry.order.filled_quantity.notional(p))
                .unwrap_or(Decimal::ZERO);
            let total = entry.order.filled_quantity + quantity;
            entry.order.average_price = Some(Price::new((prior + notional) / total.inner()));
            entry.order.filled_quantity = total;
            entry.order.status = if entry.order.filled_quantity >= entry.order.quantity {
                VenueOrderStatus::Filled
            } else {
                VenueOrderStatus::PartiallyFilled
            };
        }
        self.trades.push(fill.clone());
        Some(fill)
    }

    /// Fill every resting order the price has crossed.
    fn match_resting(&mut self, symbol: &str, price: Price, fee_rate: Decimal) -> Vec<FillEvent> {
        let crossed: Vec<(u64, Size, Price)> = self
            .orders
            .iter()
            .filter(|(_, p)| {
                let o = &p.order;
                o.symbol == symbol
                    && o.status.is_open()
                    && o.order_type == OrderType::Limit
                    && match o.side {
                        OrderSide::Buy => price <= o.price,
                        OrderSide::Sell => price >= o.price,
                    }
            })
            .map(|(id, p)| {
                let o = &p.order;
                (*id, o.quantity.saturating_sub(o.filled_quantity), o.price)
            })
            .collect();

        crossed
            .into_iter()
            .filter_map(|(id, remaining, limit)| self.execute(id, remaining, limit, fee_rate))
            .collect()
    }
}

/// In-process venue.
pub struct PaperExchange {
    fee_rate: Decimal,
    state: Mutex<PaperState>,
    fills: broadcast::Sender<FillEvent>,
    publish_fills: AtomicBool,
    injected_errors: Mutex<VecDeque<ExchangeError>>,
    submit_delay: Mutex<Option<Duration>>,
    create_calls: AtomicU64,
    price_source: Option<Arc<dyn ExchangeConnector>>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        let (fills, _) = broadcast::channel(1024);
        Self {
            fee_rate: DEFAULT_FEE_RATE,
            state: Mutex::new(PaperState {
                next_order_id: 1000,
                ..PaperState::default()
            }),
            fills,
            publish_fills: AtomicBool::new(true),
            injected_errors: Mutex::new(VecDeque::new()),
            submit_delay: Mutex::new(None),
            create_calls: AtomicU64::new(0),
            price_source: None,
        }
    }

    #[must_use]
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Take prices from a live venue's public ticker.
    #[must_use]
    pub fn with_price_source(mut self, source: Arc<dyn ExchangeConnector>) -> Self {
        self.price_source = Some(source);
        self
    }

    pub fn set_rules(&self, rules: SymbolRules) {
        self.state.lock().rules.insert(rules.symbol.clone(), rules);
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        self.state.lock().balance_mut(asset).free += amount;
    }

    pub fn balance(&self, asset: &str) -> Balance {
        self.state
            .lock()
            .balances
            .get(asset)
            .cloned()
            .unwrap_or_else(|| Balance {
                asset: asset.to_string(),
                ..Balance::default()
            })
    }

    /// Move the price and match resting orders. Returns the executions.
    pub fn set_price(&self, symbol: &str, price: Price) -> Vec<FillEvent> {
        let fills = {
            let mut state = self.state.lock();
            state.prices.insert(symbol.to_string(), price);
            state.match_resting(symbol, price, self.fee_rate)
        };
        self.publish(&fills);
        fills
    }

    /// Fill part of a resting order at its limit price.
    pub fn fill_partially(&self, venue_order_id: &str, quantity: Size) -> ExchangeResult<FillEvent> {
        let fill = {
            let mut state = self.state.lock();
            let id = state
                .lookup(&OrderRef::Venue(venue_order_id.to_string()))
                .ok_or_else(|| ExchangeError::OrderNotFound(venue_order_id.to_string()))?;
            let order = &state.orders[&id].order;
            if !order.status.is_open() {
                return Err(ExchangeError::Rejected {
                    code: -2011,
                    message: format!("order {venue_order_id} is {:?}", order.status),
                });
            }
            let quantity = quantity.min(order.quantity.saturating_sub(order.filled_quantity));
            let price = order.price;
            state
                .execute(id, quantity, price, self.fee_rate)
                .ok_or_else(|| ExchangeError::InvalidResponse("unsettleable order".to_string()))?
        };
        self.publish(std::slice::from_ref(&fill));
        Ok(fill)
    }

    /// Fail the next `create_order` call with `error`.
    pub fn fail_next_create(&self, error: ExchangeError) {
        self.injected_errors.lock().push_back(error);
    }

    /// Delay every `create_order` call, to exercise submit timeouts.
    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        *self.submit_delay.lock() = delay;
    }

    /// Stop publishing fills on the stream, to simulate missed events.
    pub fn set_publish_fills(&self, publish: bool) {
        self.publish_fills.store(publish, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.state
            .lock()
            .orders
            .values()
            .filter(|p| p.order.symbol == symbol && p.order.status.is_open())
            .count()
    }

    /// Drop an order from the venue's books as if it never existed.
    pub fn forget_order(&self, venue_order_id: &str) {
        let mut state = self.state.lock();
        if let Ok(id) = venue_order_id.parse::<u64>() {
            if let Some(paper) = state.orders.remove(&id) {
                if let Some(client_id) = paper.order.client_order_id {
                    state.client_index.remove(&client_id);
                }
            }
        }
    }

    fn publish(&self, fills: &[FillEvent]) {
        if !self.publish_fills.load(Ordering::SeqCst) {
            return;
        }
        for fill in fills {
            // No receivers is fine
            let _ = self.fills.send(fill.clone());
        }
    }

    fn place(&self, request: OrderRequest) -> ExchangeResult<(String, Vec<FillEvent>)> {
        let (base, quote) = split_symbol(&request.symbol)?;
        let (base, quote) = (base.to_string(), quote.to_string());
        if !request.quantity.is_positive() {
            return Err(ExchangeError::Rejected {
                code: -1013,
                message: "quantity must be positive".to_string(),
            });
        }

        let mut state = self.state.lock();
        if state.client_index.contains_key(&request.client_order_id) {
            return Err(ExchangeError::Rejected {
                code: -2010,
                message: "Duplicate order sent.".to_string(),
            });
        }
        let market = state.prices.get(&request.symbol).copied();
        let price = match request.order_type {
            OrderType::Limit => request.price.ok_or_else(|| ExchangeError::Rejected {
                code: -1102,
                message: "price required for limit order".to_string(),
            })?,
            OrderType::Market => market.ok_or_else(|| {
                ExchangeError::InvalidResponse(format!("no price for {}", request.symbol))
            })?,
        };

        let locked = match (request.side, request.order_type) {
            (OrderSide::Buy, OrderType::Limit) => {
                let cost = request.quantity.notional(price);
                if state.free(&quote) < cost {
                    return Err(ExchangeError::InsufficientBalance(format!(
                        "{quote}: need {cost}, free {}",
                        state.free(&quote)
                    )));
                }
                let balance = state.balance_mut(&quote);
                balance.free -= cost;
                balance.locked += cost;
                cost
            }
            (OrderSide::Buy, OrderType::Market) => {
                let cost = request.quantity.notional(price) * (Decimal::ONE + self.fee_rate);
                if state.free(&quote) < cost {
                    return Err(ExchangeError::InsufficientBalance(format!(
                        "{quote}: need {cost}, free {}",
                        state.free(&quote)
                    )));
                }
                Decimal::ZERO
            }
            (OrderSide::Sell, _) => {
                let qty = request.quantity.inner();
                if state.free(&base) < qty {
                    return Err(ExchangeError::InsufficientBalance(format!(
                        "{base}: need {qty}, free {}",
                        state.free(&base)
                    )));
                }
                let balance = state.balance_mut(&base);
                balance.free -= qty;
                balance.locked += qty;
                qty
            }
        };

        state.next_order_id += 1;
        let id = state.next_order_id;
        state
            .client_index
            .insert(request.client_order_id.clone(), id);
        state.orders.insert(
            id,
            PaperOrder {
                order: VenueOrder {
                    venue_order_id: id.to_string(),
                    client_order_id: Some(request.client_order_id.clone()),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    order_type: request.order_type,
                    price,
                    quantity: request.quantity,
                    filled_quantity: Size::ZERO,
                    average_price: None,
                    status: VenueOrderStatus::New,
                },
                locked,
            },
        );
        debug!(
            venue_order_id = id,
            symbol = %request.symbol,
            side = %request.side,
            %price,
            quantity = %request.quantity,
            "Paper order accepted"
        );

        let fills = match (request.order_type, market) {
            (OrderType::Market, _) => state
                .execute(id, request.quantity, price, self.fee_rate)
                .into_iter()
                .collect(),
            (OrderType::Limit, Some(market)) => state.match_resting(&request.symbol, market, self.fee_rate),
            (OrderType::Limit, None) => Vec::new(),
        };
        Ok((id.to_string(), fills))
    }
}

impl ExchangeConnector for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>> {
        Box::pin(async move {
            if let Some(source) = &self.price_source {
                let ticker = source.get_ticker(symbol).await?;
                self.set_price(symbol, ticker.last);
                return Ok(ticker);
            }
            let price = self.state.lock().prices.get(symbol).copied();
            price
                .map(|p| Ticker::new(symbol, p))
                .ok_or_else(|| ExchangeError::InvalidResponse(format!("no price for {symbol}")))
        })
    }

    fn get_balance<'a>(&'a self, asset: &'a str) -> BoxFuture<'a, ExchangeResult<Balance>> {
        Box::pin(async move { Ok(self.balance(asset)) })
    }

    fn create_order(&self, request: OrderRequest) -> BoxFuture<'_, ExchangeResult<String>> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.submit_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let injected = self.injected_errors.lock().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            let (id, fills) = self.place(request)?;
            self.publish(&fills);
            Ok(id)
        })
    }

    fn cancel_order<'a>(
        &'a self,
        _symbol: &'a str,
        venue_order_id: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<CancelOutcome>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let Some(id) = state.lookup(&OrderRef::Venue(venue_order_id.to_string())) else {
                return Ok(CancelOutcome::NotFound);
            };
            let paper = state.orders[&id].clone();
            match paper.order.status {
                VenueOrderStatus::Filled => return Ok(CancelOutcome::AlreadyFilled),
                status if !status.is_open() => return Ok(CancelOutcome::Cancelled),
                _ => {}
            }

            let (base, quote) = split_symbol(&paper.order.symbol)?;
            let asset = match paper.order.side {
                OrderSide::Buy => quote.to_string(),
                OrderSide::Sell => base.to_string(),
            };
            let balance = state.balance_mut(&asset);
            balance.locked -= paper.locked;
            balance.free += paper.locked;
            if let Some(entry) = state.orders.get_mut(&id) {
                entry.locked = Decimal::ZERO;
                entry.order.status = VenueOrderStatus::Canceled;
            }
            info!(venue_order_id, "Paper order cancelled");
            Ok(CancelOutcome::Cancelled)
        })
    }

    fn fetch_order<'a>(
        &'a self,
        _symbol: &'a str,
        order: OrderRef,
    ) -> BoxFuture<'a, ExchangeResult<VenueOrder>> {
        Box::pin(async move {
            let state = self.state.lock();
            state
                .lookup(&order)
                .map(|id| state.orders[&id].order.clone())
                .ok_or_else(|| ExchangeError::OrderNotFound(format!("{order:?}")))
        })
    }

    fn get_open_orders<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<Vec<VenueOrder>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .orders
                .values()
                .filter(|p| p.order.symbol == symbol && p.order.status.is_open())
                .map(|p| p.order.clone())
                .collect())
        })
    }

    fn get_symbol_rules<'a>(
        &'a self,
        symbol: &'a str,
    ) -> BoxFuture<'a, ExchangeResult<SymbolRules>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .rules
                .get(symbol)
                .cloned()
                .unwrap_or_else(|| SymbolRules::unrestricted(symbol)))
        })
    }

    fn get_recent_trades<'a>(
        &'a self,
        symbol: &'a str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'a, ExchangeResult<Vec<FillEvent>>> {
        Box::pin(async move {
            let state = self.state.lock();
            let matching: Vec<FillEvent> = state
                .trades
                .iter()
                .filter(|t| t.symbol == symbol && t.executed_at >= since)
                .cloned()
                .collect();
            let skip = matching.len().saturating_sub(limit as usize);
            Ok(matching.into_iter().skip(skip).collect())
        })
    }

    fn stream_fills(&self) -> broadcast::Receiver<FillEvent> {
        self.fills.subscribe()
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
