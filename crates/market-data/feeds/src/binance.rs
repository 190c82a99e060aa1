//! Binance spot REST client
//!
//! - Signed endpoints carry `timestamp` (local clock plus the measured
//!   exchange offset), `recvWindow` and an HMAC-SHA256 signature
//! - Every call reserves request weight from the shared [`RateLimiter`] and
//!   adopts the usage headers of the response
//! - A `-1021` rejection resynchronises the clock offset; reads and cancels are
//!   retried once, order placement surfaces the error so the caller can look up

use crate::error::{ExchangeError, ExchangeResult};
use crate::ratelimit::RateLimiter;
use crate::rest::ExchangeRest;
use crate::signing::{encode_query, signed_query};
use crate::types::{
    Balance, CancelReplaceRequest, OcoAck, OcoRequest, OrderAck, OrderLookup, OrderRequest, RemoteOrder,
    WireAccount, WireBookTicker, WireCancelReplace, WireExchangeInfo, WireOco, WireOrder, WireServerTime,
    WireTicker, kline_from_row,
};
use async_trait::async_trait;
use common::Clock;
use common::config::ExchangeConfig;
use common::model::{BookSample, Candle, Side, SymbolFilters, Ticker24h};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "X-MBX-APIKEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    Public,
    Signed,
}

/// Shape of a single REST call
#[derive(Debug, Clone)]
struct Call {
    method: Method,
    path: &'static str,
    security: Security,
    weight: u32,
    places_order: bool,
    idempotent: bool,
}

impl Call {
    fn public(path: &'static str, weight: u32) -> Self {
        Self {
            method: Method::GET,
            path,
            security: Security::Public,
            weight,
            places_order: false,
            idempotent: true,
        }
    }

    fn signed_read(path: &'static str, weight: u32) -> Self {
        Self {
            method: Method::GET,
            path,
            security: Security::Signed,
            weight,
            places_order: false,
            idempotent: true,
        }
    }

    fn mutation(method: Method, path: &'static str, places_order: bool) -> Self {
        Self {
            method,
            path,
            security: Security::Signed,
            weight: 1,
            places_order,
            idempotent: false,
        }
    }

    /// Safe to repeat after a clock resync
    fn retry_safe(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Live spot REST client
pub struct BinanceRest {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    timeout_ms: u64,
    offset_ms: AtomicI64,
    last_success_ms: AtomicI64,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BinanceRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRest")
            .field("base_url", &self.base_url)
            .field("offset_ms", &self.offset_ms.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BinanceRest {
    /// Build a client from the exchange section of the agent config
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cfg: &ExchangeConfig, clock: Arc<dyn Clock>) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.rest_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            recv_window_ms: u64::try_from(cfg.time_sync_recv_window_ms).unwrap_or(5_000),
            timeout_ms: cfg.request_timeout_ms,
            offset_ms: AtomicI64::new(0),
            last_success_ms: AtomicI64::new(0),
            limiter: Arc::new(RateLimiter::new(cfg.weight_limit_1m, cfg.order_limit_10s)),
            clock,
        })
    }

    /// Shared limiter, e.g. for metrics
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Current exchange-minus-local clock offset
    #[must_use]
    pub fn clock_offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    async fn reserve(&self, call: &Call) {
        loop {
            let now = self.clock.now_ms();
            let delay = if call.places_order {
                self.limiter.wait_order(now, call.weight)
            } else {
                self.limiter.wait(now, call.weight)
            };
            if delay.is_zero() {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn execute(&self, call: &Call, params: &BTreeMap<String, String>) -> ExchangeResult<Value> {
        self.reserve(call).await;

        let query = match call.security {
            Security::Public => encode_query(params),
            Security::Signed => {
                let mut signed = params.clone();
                let ts = self.clock.now_ms() + self.clock_offset_ms();
                signed_query(&self.api_secret, &mut signed, ts, self.recv_window_ms)?
            }
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, call.path)
        } else {
            format!("{}{}?{}", self.base_url, call.path, query)
        };

        let mut req = self.http.request(call.method.clone(), &url);
        if call.security == Security::Signed || !self.api_key.is_empty() {
            req = req.header(API_KEY_HEADER, &self.api_key);
        }
        let response = req.send().await.map_err(|e| match ExchangeError::from(e) {
            ExchangeError::Timeout { .. } => ExchangeError::Timeout {
                timeout_ms: self.timeout_ms,
            },
            other => other,
        })?;

        let now = self.clock.now_ms();
        self.limiter.update_from_headers(now, response.headers());
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let err = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(api) => ExchangeError::Api {
                    status: status.as_u16(),
                    code: api.code,
                    msg: api.msg,
                },
                Err(_) => ExchangeError::Api {
                    status: status.as_u16(),
                    code: 0,
                    msg: body.chars().take(256).collect(),
                },
            };
            debug!(path = call.path, status = status.as_u16(), error = %err, "exchange call failed");
            return Err(err);
        }

        self.last_success_ms.store(now, Ordering::Relaxed);
        Ok(serde_json::from_str(&body)?)
    }

    async fn call(&self, call: Call, params: BTreeMap<String, String>) -> ExchangeResult<Value> {
        match self.execute(&call, &params).await {
            Err(e) if call.security == Security::Signed && e.is_timestamp_outside_window() => {
                warn!(path = call.path, "timestamp outside recvWindow, resynchronising clock");
                self.sync_time().await?;
                if call.idempotent {
                    self.execute(&call, &params).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, call: Call, params: BTreeMap<String, String>) -> ExchangeResult<T> {
        let value = self.call(call, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn params<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

fn oco_params(req: &OcoRequest) -> BTreeMap<String, String> {
    let mut p = params([
        ("symbol", req.symbol.as_str()),
        ("side", req.side.as_str()),
        ("quantity", req.quantity.as_str()),
        ("listClientOrderId", req.list_client_order_id.as_str()),
    ]);
    // For a SELL list the take-profit sits above the market, the stop below
    let (tp_leg, stop_leg) = match req.side {
        Side::Sell => ("above", "below"),
        Side::Buy => ("below", "above"),
    };
    let mut leg = |k: String, v: &str| {
        p.insert(k, v.to_string());
    };
    leg(format!("{tp_leg}Type"), "LIMIT_MAKER");
    leg(format!("{tp_leg}Price"), &req.take_profit_price);
    leg(format!("{tp_leg}ClientOrderId"), &req.take_profit_client_order_id);
    leg(format!("{stop_leg}Type"), "STOP_LOSS_LIMIT");
    leg(format!("{stop_leg}StopPrice"), &req.stop_price);
    leg(format!("{stop_leg}Price"), &req.stop_limit_price);
    leg(format!("{stop_leg}TimeInForce"), "GTC");
    leg(format!("{stop_leg}ClientOrderId"), &req.stop_client_order_id);
    p
}

#[async_trait]
impl ExchangeRest for BinanceRest {
    async fn ping(&self) -> ExchangeResult<()> {
        self.call(Call::public("/api/v3/ping", 1), BTreeMap::new()).await?;
        Ok(())
    }

    async fn server_time(&self) -> ExchangeResult<i64> {
        let t: WireServerTime = self.call_as(Call::public("/api/v3/time", 1), BTreeMap::new()).await?;
        Ok(t.server_time)
    }

    async fn sync_time(&self) -> ExchangeResult<i64> {
        let sent = self.clock.now_ms();
        let server = self.server_time().await?;
        let received = self.clock.now_ms();
        let offset = server - (sent + received) / 2;
        self.offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, rtt_ms = received - sent, "exchange clock synchronised");
        Ok(offset)
    }

    async fn exchange_info(&self) -> ExchangeResult<Vec<SymbolFilters>> {
        let info: WireExchangeInfo = self
            .call_as(Call::public("/api/v3/exchangeInfo", 20), BTreeMap::new())
            .await?;
        let mut out = Vec::with_capacity(info.symbols.len());
        for sym in info.symbols {
            match sym.into_filters() {
                Ok(f) => out.push(f),
                Err(e) => debug!(error = %e, "skipping symbol without usable filters"),
            }
        }
        Ok(out)
    }

    async fn ticker_24h(&self) -> ExchangeResult<Vec<Ticker24h>> {
        let rows: Vec<WireTicker> = self
            .call_as(Call::public("/api/v3/ticker/24hr", 80), BTreeMap::new())
            .await?;
        Ok(rows.into_iter().map(Ticker24h::from).collect())
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> ExchangeResult<Vec<Candle>> {
        let limit = limit.to_string();
        let rows: Vec<Value> = self
            .call_as(
                Call::public("/api/v3/klines", 2),
                params([("symbol", symbol), ("interval", interval), ("limit", limit.as_str())]),
            )
            .await?;
        rows.iter()
            .map(|r| kline_from_row(r).map_err(ExchangeError::Decode))
            .collect()
    }

    async fn book_ticker(&self, symbol: &str) -> ExchangeResult<BookSample> {
        let wire: WireBookTicker = self
            .call_as(Call::public("/api/v3/ticker/bookTicker", 2), params([("symbol", symbol)]))
            .await?;
        let local = self.clock.now_ms();
        Ok(wire.into_sample(local + self.clock_offset_ms(), local))
    }

    async fn new_order(&self, req: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut p: BTreeMap<String, String> = req.params().into_iter().collect();
        p.insert("newOrderRespType".to_string(), "RESULT".to_string());
        let wire: WireOrder = self
            .call_as(Call::mutation(Method::POST, "/api/v3/order", true), p)
            .await?;
        Ok(wire.into_ack())
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<OrderLookup> {
        let result: ExchangeResult<WireOrder> = self
            .call_as(
                Call::signed_read("/api/v3/order", 4),
                params([("symbol", symbol), ("origClientOrderId", client_order_id)]),
            )
            .await;
        match result {
            Ok(wire) => Ok(OrderLookup::Found(wire.into_remote().map_err(ExchangeError::Decode)?)),
            Err(e) if e.is_unknown_order() => Ok(OrderLookup::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<OrderAck> {
        let wire: WireOrder = self
            .call_as(
                Call::mutation(Method::DELETE, "/api/v3/order", false).retry_safe(),
                params([("symbol", symbol), ("origClientOrderId", client_order_id)]),
            )
            .await?;
        Ok(wire.into_ack())
    }

    async fn cancel_replace(&self, req: &CancelReplaceRequest) -> ExchangeResult<OrderAck> {
        let mut p: BTreeMap<String, String> = req.new_order.params().into_iter().collect();
        p.insert("cancelReplaceMode".to_string(), "STOP_ON_FAILURE".to_string());
        p.insert("cancelOrigClientOrderId".to_string(), req.cancel_client_order_id.clone());
        let wire: WireCancelReplace = self
            .call_as(Call::mutation(Method::POST, "/api/v3/order/cancelReplace", true), p)
            .await?;
        Ok(wire.new_order_response.into_ack())
    }

    async fn new_oco(&self, req: &OcoRequest) -> ExchangeResult<OcoAck> {
        let wire: WireOco = self
            .call_as(Call::mutation(Method::POST, "/api/v3/orderList/oco", true), oco_params(req))
            .await?;
        Ok(wire.into_ack())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<RemoteOrder>> {
        let (weight, p) = match symbol {
            Some(s) => (6, params([("symbol", s)])),
            None => (80, BTreeMap::new()),
        };
        let rows: Vec<WireOrder> = self.call_as(Call::signed_read("/api/v3/openOrders", weight), p).await?;
        rows.into_iter()
            .map(|w| w.into_remote().map_err(ExchangeError::Decode))
            .collect()
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        let account: WireAccount = self
            .call_as(
                Call::signed_read("/api/v3/account", 20),
                params([("omitZeroBalances", "true")]),
            )
            .await?;
        Ok(account.balances)
    }

    fn last_success_ms(&self) -> Option<i64> {
        match self.last_success_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}
