//! Exchange REST contract
//!
//! The agent talks to the exchange only through [`ExchangeRest`]. The live
//! implementation is [`crate::BinanceRest`]; tests script the in-memory `MockExchange`.

use crate::error::ExchangeResult;
use crate::types::{
    Balance, CancelReplaceRequest, OcoAck, OcoRequest, OrderAck, OrderLookup, OrderRequest, RemoteOrder,
};
use async_trait::async_trait;
use common::model::{BookSample, Candle, SymbolFilters, Ticker24h};

/// Spot exchange REST operations used by the agent
#[async_trait]
pub trait ExchangeRest: Send + Sync {
    /// Connectivity check
    async fn ping(&self) -> ExchangeResult<()>;

    /// Exchange clock in ms
    async fn server_time(&self) -> ExchangeResult<i64>;

    /// Measure and adopt the local-to-exchange clock offset; returns the offset
    async fn sync_time(&self) -> ExchangeResult<i64>;

    /// Filters for every listed symbol
    async fn exchange_info(&self) -> ExchangeResult<Vec<SymbolFilters>>;

    /// 24h statistics for every symbol
    async fn ticker_24h(&self) -> ExchangeResult<Vec<Ticker24h>>;

    /// Most recent closed and open bars, oldest first
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Candle>>;

    /// Current best bid/ask
    async fn book_ticker(&self, symbol: &str) -> ExchangeResult<BookSample>;

    /// Place an order
    async fn new_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Look an order up by client id
    async fn get_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<OrderLookup>;

    /// Cancel an order by client id
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<OrderAck>;

    /// Atomically cancel and replace
    async fn cancel_replace(&self, req: &CancelReplaceRequest) -> ExchangeResult<OrderAck>;

    /// Place an OCO list
    async fn new_oco(&self, req: &OcoRequest) -> ExchangeResult<OcoAck>;

    /// Open orders, optionally for one symbol
    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<RemoteOrder>>;

    /// Non-zero balances
    async fn balances(&self) -> ExchangeResult<Vec<Balance>>;

    /// Local time of the last successful call, if any
    fn last_success_ms(&self) -> Option<i64>;
}
