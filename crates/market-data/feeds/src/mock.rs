//! In-memory exchange with scripted faults
//!
//! Orders placed through [`MockExchange`] are kept by client order id, so a
//! repeated client id is rejected the way the real matching engine dedups it.
//! Faults are queued per operation and consumed one call at a time; with an
//! empty queue the call succeeds against the in-memory book.

use crate::error::{CODE_NO_SUCH_ORDER, ExchangeError, ExchangeResult};
use crate::rest::ExchangeRest;
use crate::types::{
    Balance, CancelReplaceRequest, OcoAck, OcoRequest, OrderAck, OrderLookup, OrderRequest, RemoteOrder,
};
use async_trait::async_trait;
use common::Clock;
use common::model::{BookSample, Candle, SymbolFilters, Ticker24h};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Operations of [`ExchangeRest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `ping`
    Ping,
    /// `server_time` and `sync_time`
    ServerTime,
    /// `exchange_info`
    ExchangeInfo,
    /// `ticker_24h`
    Ticker24h,
    /// `klines`
    Klines,
    /// `book_ticker`
    BookTicker,
    /// `new_order`
    NewOrder,
    /// `get_order`
    GetOrder,
    /// `cancel_order`
    CancelOrder,
    /// `cancel_replace`
    CancelReplace,
    /// `new_oco`
    NewOco,
    /// `open_orders`
    OpenOrders,
    /// `balances`
    Balances,
}

/// Scripted outcome for the next call of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// The call times out and has no effect
    Timeout,
    /// The call takes effect on the exchange but the response is lost
    TimeoutAfterEffect,
    /// The exchange rejects the call
    Reject {
        /// Exchange error code
        code: i64,
        /// Exchange message
        msg: String,
    },
    /// The exchange answers 5xx
    ServerError,
    /// A lookup finds nothing, regardless of the book
    NotFound,
    /// A mutation is acknowledged but its orders come back REJECTED
    AckRejected,
}

impl MockFault {
    fn to_error(&self) -> ExchangeError {
        match self {
            Self::Timeout | Self::TimeoutAfterEffect => ExchangeError::Timeout { timeout_ms: 0 },
            Self::Reject { code, msg } => ExchangeError::Api {
                status: 400,
                code: *code,
                msg: msg.clone(),
            },
            Self::ServerError | Self::AckRejected => ExchangeError::Api {
                status: 503,
                code: -1001,
                msg: "Internal error".to_string(),
            },
            Self::NotFound => ExchangeError::Api {
                status: 400,
                code: CODE_NO_SUCH_ORDER,
                msg: "Order does not exist.".to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    orders: BTreeMap<String, RemoteOrder>,
    next_order_id: i64,
    next_list_id: i64,
    faults: FxHashMap<MockOp, VecDeque<MockFault>>,
    calls: FxHashMap<MockOp, u32>,
    submitted: Vec<OrderRequest>,
    oco_requests: Vec<OcoRequest>,
    filters: Vec<SymbolFilters>,
    tickers: Vec<Ticker24h>,
    klines: FxHashMap<(String, String), Vec<Candle>>,
    books: FxHashMap<String, BookSample>,
    balances: Vec<Balance>,
    server_offset_ms: i64,
    last_success_ms: Option<i64>,
    ack_rejected: bool,
}

/// Scriptable in-memory [`ExchangeRest`]
pub struct MockExchange {
    state: Mutex<MockState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MockExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExchange")
            .field("orders", &self.state.lock().orders.len())
            .finish_non_exhaustive()
    }
}

impl MockExchange {
    /// Empty exchange driven by `clock`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_order_id: 1_000,
                next_list_id: 1,
                ..MockState::default()
            }),
            clock,
        }
    }

    /// Queue a fault for the next call of `op`
    pub fn push_fault(&self, op: MockOp, fault: MockFault) {
        self.state.lock().faults.entry(op).or_default().push_back(fault);
    }

    /// Number of calls made to `op`
    #[must_use]
    pub fn calls(&self, op: MockOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every order request that reached the exchange, including rejected ones
    #[must_use]
    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.state.lock().submitted.clone()
    }

    /// Every OCO request that reached the exchange
    #[must_use]
    pub fn oco_requests(&self) -> Vec<OcoRequest> {
        self.state.lock().oco_requests.clone()
    }

    /// Orders currently known to the exchange
    #[must_use]
    pub fn orders(&self) -> Vec<RemoteOrder> {
        self.state.lock().orders.values().cloned().collect()
    }

    /// Place an order directly on the book, bypassing the call path
    pub fn insert_order(&self, order: RemoteOrder) {
        self.state.lock().orders.insert(order.client_order_id.clone(), order);
    }

    /// Change the remote status of an order
    pub fn set_order_status(&self, client_order_id: &str, status: &str) {
        if let Some(o) = self.state.lock().orders.get_mut(client_order_id) {
            o.status = status.to_string();
        }
    }

    /// Fill `executed_qty` of an order; the full quantity marks it FILLED
    pub fn fill_order(&self, client_order_id: &str, executed_qty: &str) {
        if let Some(o) = self.state.lock().orders.get_mut(client_order_id) {
            o.status = if o.orig_qty == executed_qty { "FILLED" } else { "PARTIALLY_FILLED" }.to_string();
            o.executed_qty = executed_qty.to_string();
        }
    }

    /// Filters returned by `exchange_info`
    pub fn set_filters(&self, filters: Vec<SymbolFilters>) {
        self.state.lock().filters = filters;
    }

    /// Rows returned by `ticker_24h`
    pub fn set_tickers(&self, tickers: Vec<Ticker24h>) {
        self.state.lock().tickers = tickers;
    }

    /// Bars returned by `klines` for one symbol and interval
    pub fn set_klines(&self, symbol: &str, interval: &str, candles: Vec<Candle>) {
        self.state
            .lock()
            .klines
            .insert((symbol.to_string(), interval.to_string()), candles);
    }

    /// Sample returned by `book_ticker`
    pub fn set_book(&self, symbol: &str, sample: BookSample) {
        self.state.lock().books.insert(symbol.to_string(), sample);
    }

    /// Balances returned by `balances`
    pub fn set_balances(&self, balances: Vec<Balance>) {
        self.state.lock().balances = balances;
    }

    /// Exchange clock minus local clock
    pub fn set_server_offset_ms(&self, offset_ms: i64) {
        self.state.lock().server_offset_ms = offset_ms;
    }

    /// Count the call and take the next scripted fault
    fn enter(&self, op: MockOp) -> Option<MockFault> {
        let mut s = self.state.lock();
        *s.calls.entry(op).or_insert(0) += 1;
        s.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn succeed<T>(&self, value: T) -> ExchangeResult<T> {
        self.state.lock().last_success_ms = Some(self.clock.now_ms());
        Ok(value)
    }

    /// Gate for read-only calls
    fn read(&self, op: MockOp) -> ExchangeResult<()> {
        match self.enter(op) {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn place(&self, req: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut s = self.state.lock();
        s.submitted.push(req.clone());
        if s.orders.contains_key(&req.client_order_id) {
            return Err(ExchangeError::Api {
                status: 400,
                code: -2010,
                msg: "Duplicate order sent.".to_string(),
            });
        }
        s.next_order_id += 1;
        let order = RemoteOrder {
            symbol: req.symbol.clone(),
            order_id: s.next_order_id.to_string(),
            client_order_id: req.client_order_id.clone(),
            side: req.side,
            status: new_status(s.ack_rejected).to_string(),
            price: req.price.clone().unwrap_or_else(|| "0".to_string()),
            orig_qty: req.quantity.clone(),
            executed_qty: "0".to_string(),
            order_list_id: -1,
            time_ms: self.clock.now_ms(),
        };
        let ack = ack_of(&order);
        s.orders.insert(order.client_order_id.clone(), order);
        Ok(ack)
    }

    fn cancel(&self, client_order_id: &str) -> ExchangeResult<OrderAck> {
        let mut s = self.state.lock();
        match s.orders.get_mut(client_order_id) {
            Some(o) if o.is_open() => {
                o.status = "CANCELED".to_string();
                Ok(ack_of(o))
            }
            _ => Err(ExchangeError::Api {
                status: 400,
                code: crate::error::CODE_CANCEL_UNKNOWN_ORDER,
                msg: "Unknown order sent.".to_string(),
            }),
        }
    }

    fn place_oco(&self, req: &OcoRequest) -> ExchangeResult<OcoAck> {
        let mut s = self.state.lock();
        s.oco_requests.push(req.clone());
        if s.orders.contains_key(&req.take_profit_client_order_id) {
            return Err(ExchangeError::Api {
                status: 400,
                code: -2010,
                msg: "Duplicate order sent.".to_string(),
            });
        }
        s.next_list_id += 1;
        let list_id = s.next_list_id;
        let now = self.clock.now_ms();
        let mut acks = Vec::with_capacity(2);
        for (cid, price) in [
            (&req.take_profit_client_order_id, &req.take_profit_price),
            (&req.stop_client_order_id, &req.stop_limit_price),
        ] {
            s.next_order_id += 1;
            let order = RemoteOrder {
                symbol: req.symbol.clone(),
                order_id: s.next_order_id.to_string(),
                client_order_id: cid.clone(),
                side: req.side,
                status: new_status(s.ack_rejected).to_string(),
                price: price.clone(),
                orig_qty: req.quantity.clone(),
                executed_qty: "0".to_string(),
                order_list_id: list_id,
                time_ms: now,
            };
            acks.push(ack_of(&order));
            s.orders.insert(cid.clone(), order);
        }
        Ok(OcoAck {
            order_list_id: list_id.to_string(),
            list_client_order_id: req.list_client_order_id.clone(),
            orders: acks,
        })
    }

    /// Run a mutation under the scripted fault, if any
    fn mutate<T>(&self, op: MockOp, effect: impl FnOnce() -> ExchangeResult<T>) -> ExchangeResult<T> {
        match self.enter(op) {
            None => effect().and_then(|v| self.succeed(v)),
            Some(MockFault::AckRejected) => {
                self.state.lock().ack_rejected = true;
                let result = effect();
                self.state.lock().ack_rejected = false;
                result.and_then(|v| self.succeed(v))
            }
            Some(MockFault::TimeoutAfterEffect) => {
                let _ = effect();
                Err(MockFault::TimeoutAfterEffect.to_error())
            }
            Some(fault) => Err(fault.to_error()),
        }
    }
}

fn new_status(rejected: bool) -> &'static str {
    if rejected { "REJECTED" } else { "NEW" }
}

fn ack_of(o: &RemoteOrder) -> OrderAck {
    OrderAck {
        symbol: o.symbol.clone(),
        order_id: o.order_id.clone(),
        client_order_id: o.client_order_id.clone(),
        status: o.status.clone(),
        executed_qty: o.executed_qty.clone(),
    }
}

#[async_trait]
impl ExchangeRest for MockExchange {
    async fn ping(&self) -> ExchangeResult<()> {
        self.read(MockOp::Ping)?;
        self.succeed(())
    }

    async fn server_time(&self) -> ExchangeResult<i64> {
        self.read(MockOp::ServerTime)?;
        let t = self.clock.now_ms() + self.state.lock().server_offset_ms;
        self.succeed(t)
    }

    async fn sync_time(&self) -> ExchangeResult<i64> {
        self.read(MockOp::ServerTime)?;
        let offset = self.state.lock().server_offset_ms;
        self.succeed(offset)
    }

    async fn exchange_info(&self) -> ExchangeResult<Vec<SymbolFilters>> {
        self.read(MockOp::ExchangeInfo)?;
        let f = self.state.lock().filters.clone();
        self.succeed(f)
    }

    async fn ticker_24h(&self) -> ExchangeResult<Vec<Ticker24h>> {
        self.read(MockOp::Ticker24h)?;
        let t = self.state.lock().tickers.clone();
        self.succeed(t)
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Candle>> {
        self.read(MockOp::Klines)?;
        let all = self
            .state
            .lock()
            .klines
            .get(&(symbol.to_string(), interval.to_string()))
            .cloned()
            .unwrap_or_default();
        let keep = usize::try_from(limit).unwrap_or(usize::MAX).min(all.len());
        self.succeed(all[all.len() - keep..].to_vec())
    }

    async fn book_ticker(&self, symbol: &str) -> ExchangeResult<BookSample> {
        self.read(MockOp::BookTicker)?;
        let book = self.state.lock().books.get(symbol).cloned();
        match book {
            Some(b) => self.succeed(b),
            None => Err(ExchangeError::Api {
                status: 400,
                code: -1121,
                msg: "Invalid symbol.".to_string(),
            }),
        }
    }

    async fn new_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck> {
        self.mutate(MockOp::NewOrder, || self.place(req))
    }

    async fn get_order(&self, _symbol: &str, client_order_id: &str) -> ExchangeResult<OrderLookup> {
        match self.enter(MockOp::GetOrder) {
            Some(MockFault::NotFound) => return self.succeed(OrderLookup::NotFound),
            Some(fault) => return Err(fault.to_error()),
            None => {}
        }
        let found = self.state.lock().orders.get(client_order_id).cloned();
        self.succeed(found.map_or(OrderLookup::NotFound, OrderLookup::Found))
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> ExchangeResult<OrderAck> {
        self.mutate(MockOp::CancelOrder, || self.cancel(client_order_id))
    }

    async fn cancel_replace(&self, req: &CancelReplaceRequest) -> ExchangeResult<OrderAck> {
        self.mutate(MockOp::CancelReplace, || {
            self.cancel(&req.cancel_client_order_id)?;
            self.place(&req.new_order)
        })
    }

    async fn new_oco(&self, req: &OcoRequest) -> ExchangeResult<OcoAck> {
        self.mutate(MockOp::NewOco, || self.place_oco(req))
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<RemoteOrder>> {
        self.read(MockOp::OpenOrders)?;
        let open: Vec<RemoteOrder> = self
            .state
            .lock()
            .orders
            .values()
            .filter(|o| o.is_open() && symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect();
        self.succeed(open)
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        self.read(MockOp::Balances)?;
        let b = self.state.lock().balances.clone();
        self.succeed(b)
    }

    fn last_success_ms(&self) -> Option<i64> {
        self.state.lock().last_success_ms
    }
}
