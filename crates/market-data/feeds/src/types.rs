//! Exchange request and response types
//!
//! Prices and quantities stay decimal strings end to end; nothing here
//! parses them into floats.

use common::model::{BookSample, Candle, Side, SymbolFilters, Ticker24h, TrailingDeltaFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exchange order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Resting or crossing limit order
    Limit,
    /// Post-only limit order
    LimitMaker,
    /// Market order
    Market,
}

impl OrderType {
    /// Wire value
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::LimitMaker => "LIMIT_MAKER",
            Self::Market => "MARKET",
        }
    }
}

/// New order request; `client_order_id` is the exchange dedup key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Symbol
    pub symbol: String,
    /// Side
    pub side: Side,
    /// Order type
    pub order_type: OrderType,
    /// `GTC`, `IOC` or `FOK`; absent for market and post-only orders
    pub time_in_force: Option<String>,
    /// Limit price
    pub price: Option<String>,
    /// Base quantity
    pub quantity: String,
    /// Deterministic client order id
    pub client_order_id: String,
}

impl OrderRequest {
    /// Query parameters in exchange naming
    #[must_use]
    pub fn params(&self) -> Vec<(String, String)> {
        let mut p = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), self.side.as_str().to_string()),
            ("type".to_string(), self.order_type.as_str().to_string()),
            ("quantity".to_string(), self.quantity.clone()),
            ("newClientOrderId".to_string(), self.client_order_id.clone()),
        ];
        if let Some(tif) = &self.time_in_force {
            p.push(("timeInForce".to_string(), tif.clone()));
        }
        if let Some(price) = &self.price {
            p.push(("price".to_string(), price.clone()));
        }
        p
    }
}

/// Cancel an open order and place a replacement in one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReplaceRequest {
    /// Client id of the order being cancelled
    pub cancel_client_order_id: String,
    /// Replacement order
    pub new_order: OrderRequest,
}

/// OCO protection: take-profit limit above, stop-loss limit below (for a SELL)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcoRequest {
    /// Symbol
    pub symbol: String,
    /// Exit side
    pub side: Side,
    /// Base quantity
    pub quantity: String,
    /// Take-profit limit price
    pub take_profit_price: String,
    /// Stop trigger
    pub stop_price: String,
    /// Stop limit price
    pub stop_limit_price: String,
    /// Client id of the whole list
    pub list_client_order_id: String,
    /// Client id of the take-profit leg
    pub take_profit_client_order_id: String,
    /// Client id of the stop leg
    pub stop_client_order_id: String,
}

/// Exchange acknowledgement of a single order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Symbol
    pub symbol: String,
    /// Remote order id
    pub order_id: String,
    /// Echoed client id
    pub client_order_id: String,
    /// Remote status, e.g. `NEW`, `FILLED`, `REJECTED`, `EXPIRED`
    pub status: String,
    /// Filled quantity
    pub executed_qty: String,
}

impl OrderAck {
    /// Accepted but rejected or expired by the matching engine
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self.status.as_str(), "REJECTED" | "EXPIRED" | "EXPIRED_IN_MATCH")
    }
}

/// Acknowledgement of an OCO list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcoAck {
    /// Remote list id
    pub order_list_id: String,
    /// Echoed list client id
    pub list_client_order_id: String,
    /// Legs
    pub orders: Vec<OrderAck>,
}

/// Remote view of an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrder {
    /// Symbol
    pub symbol: String,
    /// Remote order id
    pub order_id: String,
    /// Client id
    pub client_order_id: String,
    /// Side
    pub side: Side,
    /// Remote status
    pub status: String,
    /// Limit price
    pub price: String,
    /// Original quantity
    pub orig_qty: String,
    /// Filled quantity
    pub executed_qty: String,
    /// OCO list id, `-1` when standalone
    pub order_list_id: i64,
    /// Creation time
    pub time_ms: i64,
}

impl RemoteOrder {
    /// Still resting on the book
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED")
    }
}

/// Result of probing an order by client id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLookup {
    /// The exchange knows the order
    Found(RemoteOrder),
    /// The exchange reports no such order
    NotFound,
}

/// Asset balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Asset
    pub asset: String,
    /// Free amount
    pub free: String,
    /// Locked in open orders
    pub locked: String,
}

// Wire shapes

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireOrder {
    pub symbol: String,
    pub order_id: i64,
    #[serde(default)]
    pub order_list_id: Option<i64>,
    pub client_order_id: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub orig_qty: Option<String>,
    #[serde(default)]
    pub executed_qty: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub transact_time: Option<i64>,
}

impl WireOrder {
    pub(crate) fn into_ack(self) -> OrderAck {
        OrderAck {
            symbol: self.symbol,
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            status: self.status.unwrap_or_else(|| "NEW".to_string()),
            executed_qty: self.executed_qty.unwrap_or_else(|| "0".to_string()),
        }
    }

    pub(crate) fn into_remote(self) -> Result<RemoteOrder, String> {
        let side = self
            .side
            .as_deref()
            .unwrap_or_default()
            .parse::<Side>()
            .map_err(|e| e.to_string())?;
        Ok(RemoteOrder {
            symbol: self.symbol,
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            side,
            status: self.status.unwrap_or_default(),
            price: self.price.unwrap_or_else(|| "0".to_string()),
            orig_qty: self.orig_qty.unwrap_or_else(|| "0".to_string()),
            executed_qty: self.executed_qty.unwrap_or_else(|| "0".to_string()),
            order_list_id: self.order_list_id.unwrap_or(-1),
            time_ms: self.time.or(self.transact_time).unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireCancelReplace {
    pub new_order_response: WireOrder,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireOco {
    pub order_list_id: i64,
    pub list_client_order_id: String,
    #[serde(default)]
    pub order_reports: Vec<WireOrder>,
}

impl WireOco {
    pub(crate) fn into_ack(self) -> OcoAck {
        OcoAck {
            order_list_id: self.order_list_id.to_string(),
            list_client_order_id: self.list_client_order_id,
            orders: self.order_reports.into_iter().map(WireOrder::into_ack).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireTicker {
    pub symbol: String,
    pub last_price: String,
    pub price_change_percent: String,
    pub quote_volume: String,
    pub count: u64,
    pub close_time: i64,
}

impl From<WireTicker> for Ticker24h {
    fn from(t: WireTicker) -> Self {
        Self {
            symbol: t.symbol,
            last_price: t.last_price,
            quote_volume: t.quote_volume,
            trade_count: t.count,
            price_change_percent: t.price_change_percent,
            close_time_ms: t.close_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBookTicker {
    pub bid_price: String,
    pub bid_qty: String,
    pub ask_price: String,
    pub ask_qty: String,
}

impl WireBookTicker {
    pub(crate) fn into_sample(self, exchange_ts_ms: i64, local_ts_ms: i64) -> BookSample {
        BookSample {
            exchange_ts_ms,
            local_ts_ms,
            bid_price: self.bid_price,
            bid_qty: self.bid_qty,
            ask_price: self.ask_price,
            ask_qty: self.ask_qty,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAccount {
    pub balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireServerTime {
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireExchangeInfo {
    pub symbols: Vec<WireSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireSymbol {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub oco_allowed: bool,
    #[serde(default)]
    pub filters: Vec<Value>,
}

fn filter_str(f: &Value, key: &str) -> Option<String> {
    f.get(key).and_then(Value::as_str).map(str::to_string)
}

fn filter_int(f: &Value, key: &str) -> Option<i64> {
    f.get(key).and_then(Value::as_i64)
}

impl WireSymbol {
    /// Project the exchange filter list onto [`SymbolFilters`]
    pub(crate) fn into_filters(self) -> Result<SymbolFilters, String> {
        let mut out = SymbolFilters {
            symbol: self.symbol,
            status: self.status,
            base_asset: self.base_asset,
            quote_asset: self.quote_asset,
            tick_size: String::new(),
            min_price: "0".to_string(),
            max_price: "0".to_string(),
            step_size: String::new(),
            min_qty: "0".to_string(),
            max_qty: "0".to_string(),
            min_notional: "0".to_string(),
            max_notional: None,
            max_num_orders: 200,
            max_num_algo_orders: 5,
            trailing_delta: None,
            oco_allowed: self.oco_allowed,
        };
        for f in &self.filters {
            match f.get("filterType").and_then(Value::as_str).unwrap_or_default() {
                "PRICE_FILTER" => {
                    out.tick_size = filter_str(f, "tickSize").unwrap_or_default();
                    out.min_price = filter_str(f, "minPrice").unwrap_or_else(|| "0".into());
                    out.max_price = filter_str(f, "maxPrice").unwrap_or_else(|| "0".into());
                }
                "LOT_SIZE" => {
                    out.step_size = filter_str(f, "stepSize").unwrap_or_default();
                    out.min_qty = filter_str(f, "minQty").unwrap_or_else(|| "0".into());
                    out.max_qty = filter_str(f, "maxQty").unwrap_or_else(|| "0".into());
                }
                "NOTIONAL" => {
                    out.min_notional = filter_str(f, "minNotional").unwrap_or_else(|| "0".into());
                    out.max_notional = filter_str(f, "maxNotional");
                }
                "MIN_NOTIONAL" => {
                    out.min_notional = filter_str(f, "minNotional").unwrap_or_else(|| "0".into());
                }
                "MAX_NUM_ORDERS" => {
                    out.max_num_orders = filter_int(f, "maxNumOrders").and_then(|v| u32::try_from(v).ok()).unwrap_or(200);
                }
                "MAX_NUM_ALGO_ORDERS" => {
                    out.max_num_algo_orders = filter_int(f, "maxNumAlgoOrders")
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(5);
                }
                "TRAILING_DELTA" => {
                    let min = filter_int(f, "minTrailingBelowDelta").or_else(|| filter_int(f, "minTrailingAboveDelta"));
                    let max = filter_int(f, "maxTrailingBelowDelta").or_else(|| filter_int(f, "maxTrailingAboveDelta"));
                    if let (Some(min_bips), Some(max_bips)) = (min, max) {
                        out.trailing_delta = Some(TrailingDeltaFilter {
                            min_bips,
                            max_bips,
                            step_bips: 1,
                        });
                    }
                }
                _ => {}
            }
        }
        if out.tick_size.is_empty() || out.step_size.is_empty() {
            return Err(format!("{}: missing PRICE_FILTER or LOT_SIZE", out.symbol));
        }
        Ok(out)
    }
}

/// Parse one kline row `[openTime, open, high, low, close, volume, ...]`
pub(crate) fn kline_from_row(row: &Value) -> Result<Candle, String> {
    let arr = row.as_array().ok_or("kline is not an array")?;
    let text = |i: usize| -> Result<String, String> {
        arr.get(i)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("kline field {i} missing"))
    };
    Ok(Candle {
        open_time_ms: arr.first().and_then(Value::as_i64).ok_or("kline open time missing")?,
        open: text(1)?,
        high: text(2)?,
        low: text(3)?,
        close: text(4)?,
        volume: text(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_info_projection() {
        let wire: WireSymbol = serde_json::from_value(json!({
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "baseAsset": "BTC",
            "quoteAsset": "USDT",
            "ocoAllowed": true,
            "filters": [
                {"filterType": "PRICE_FILTER", "minPrice": "0.01000000", "maxPrice": "1000000.00000000", "tickSize": "0.01000000"},
                {"filterType": "LOT_SIZE", "minQty": "0.00001000", "maxQty": "9000.00000000", "stepSize": "0.00001000"},
                {"filterType": "NOTIONAL", "minNotional": "5.00000000", "maxNotional": "9000000.00000000"},
                {"filterType": "TRAILING_DELTA", "minTrailingAboveDelta": 10, "maxTrailingAboveDelta": 2000,
                 "minTrailingBelowDelta": 10, "maxTrailingBelowDelta": 2000},
                {"filterType": "MAX_NUM_ORDERS", "maxNumOrders": 200}
            ]
        }))
        .unwrap();
        let f = wire.into_filters().unwrap();
        assert_eq!(f.tick_size, "0.01000000");
        assert_eq!(f.step_size, "0.00001000");
        assert_eq!(f.min_notional, "5.00000000");
        assert_eq!(f.trailing_delta.unwrap().max_bips, 2_000);
        assert!(f.oco_allowed);
    }

    #[test]
    fn test_missing_lot_size_rejected() {
        let wire: WireSymbol = serde_json::from_value(json!({
            "symbol": "X", "status": "TRADING", "baseAsset": "X", "quoteAsset": "USDT",
            "filters": [{"filterType": "PRICE_FILTER", "tickSize": "0.1"}]
        }))
        .unwrap();
        assert!(wire.into_filters().is_err());
    }

    #[test]
    fn test_kline_row() {
        let c = kline_from_row(&json!([1_700_000_000_000_i64, "1.0", "2.0", "0.5", "1.5", "10", 0, "0"])).unwrap();
        assert_eq!(c.open_time_ms, 1_700_000_000_000);
        assert_eq!(c.close, "1.5");
        assert!(kline_from_row(&json!([1, "1.0"])).is_err());
    }
}
