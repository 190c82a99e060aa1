//! Market inputs and exchange filters

use crate::canonical::canonical_hash;
use crate::closed_set;
use crate::decimal::{is_decimal_string, parse_decimal, parse_step};
use crate::error::{CommonError, CommonResult};
use serde::{Deserialize, Serialize};

/// One OHLCV bar; prices and volume as decimal strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub open_time_ms: i64,
    /// Open
    pub open: String,
    /// High
    pub high: String,
    /// Low
    pub low: String,
    /// Close
    pub close: String,
    /// Base-asset volume
    pub volume: String,
}

impl Candle {
    /// Check decimal grammar and `low <= open, close <= high`
    pub fn validate(&self) -> CommonResult<()> {
        let o = parse_decimal(&self.open)?;
        let h = parse_decimal(&self.high)?;
        let l = parse_decimal(&self.low)?;
        let c = parse_decimal(&self.close)?;
        parse_decimal(&self.volume)?;
        if !(l <= o && o <= h && l <= c && c <= h) {
            return Err(CommonError::schema(
                "candles",
                format!("bar at {} violates low <= open/close <= high", self.open_time_ms),
            ));
        }
        Ok(())
    }

    /// Close as f64, for indicators only
    #[must_use]
    pub fn close_f64(&self) -> f64 {
        self.close.parse().unwrap_or(0.0)
    }

    /// High as f64, for indicators only
    #[must_use]
    pub fn high_f64(&self) -> f64 {
        self.high.parse().unwrap_or(0.0)
    }

    /// Low as f64, for indicators only
    #[must_use]
    pub fn low_f64(&self) -> f64 {
        self.low.parse().unwrap_or(0.0)
    }

    /// Volume as f64, for indicators only
    #[must_use]
    pub fn volume_f64(&self) -> f64 {
        self.volume.parse().unwrap_or(0.0)
    }
}

/// Best bid/ask observation from the book-ticker stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSample {
    /// Exchange event time
    pub exchange_ts_ms: i64,
    /// Local receive time
    pub local_ts_ms: i64,
    /// Best bid price
    pub bid_price: String,
    /// Best bid size
    pub bid_qty: String,
    /// Best ask price
    pub ask_price: String,
    /// Best ask size
    pub ask_qty: String,
}

/// 24h rolling statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker24h {
    /// Symbol
    pub symbol: String,
    /// Last trade price
    pub last_price: String,
    /// Quote-asset volume
    pub quote_volume: String,
    /// Trade count
    pub trade_count: u64,
    /// Price change percent as reported, e.g. `"-1.25"`
    pub price_change_percent: String,
    /// Close time of the window
    pub close_time_ms: i64,
}

impl Ticker24h {
    /// Price change in integer bps, rounded half to even
    #[must_use]
    pub fn price_change_bps(&self) -> i64 {
        let pct: f64 = self.price_change_percent.parse().unwrap_or(0.0);
        let bps = (pct * 100.0).round_ties_even();
        if bps.is_finite() { bps as i64 } else { 0 }
    }
}

closed_set! {
    /// How strictly the exchange enforces its filters
    pub enum QuantizationPolicy: "quantization_policy" {
        Enforced => "ENFORCED",
        KnownNonEnforced => "KNOWN_NON_ENFORCED",
        Unknown => "UNKNOWN",
    }
}

/// Trailing-delta filter in bips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingDeltaFilter {
    /// Minimum accepted delta
    pub min_bips: i64,
    /// Maximum accepted delta
    pub max_bips: i64,
    /// Delta granularity above the minimum
    pub step_bips: i64,
}

/// Symbol filters as reported by exchange info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFilters {
    /// Symbol
    pub symbol: String,
    /// Trading status, e.g. `TRADING`
    pub status: String,
    /// Base asset
    pub base_asset: String,
    /// Quote asset
    pub quote_asset: String,
    /// PRICE_FILTER tickSize
    pub tick_size: String,
    /// PRICE_FILTER minPrice
    pub min_price: String,
    /// PRICE_FILTER maxPrice
    pub max_price: String,
    /// LOT_SIZE stepSize
    pub step_size: String,
    /// LOT_SIZE minQty
    pub min_qty: String,
    /// LOT_SIZE maxQty
    pub max_qty: String,
    /// NOTIONAL / MIN_NOTIONAL minNotional
    pub min_notional: String,
    /// NOTIONAL maxNotional
    pub max_notional: Option<String>,
    /// MAX_NUM_ORDERS
    pub max_num_orders: u32,
    /// MAX_NUM_ALGO_ORDERS
    pub max_num_algo_orders: u32,
    /// TRAILING_DELTA bounds
    pub trailing_delta: Option<TrailingDeltaFilter>,
    /// OCO orders allowed
    pub oco_allowed: bool,
}

impl SymbolFilters {
    /// Check every decimal field
    pub fn validate(&self) -> CommonResult<()> {
        parse_step(&self.tick_size)?;
        parse_step(&self.step_size)?;
        for v in [&self.min_price, &self.max_price, &self.min_qty, &self.max_qty, &self.min_notional] {
            parse_decimal(v)?;
        }
        if let Some(v) = &self.max_notional {
            parse_decimal(v)?;
        }
        Ok(())
    }

    /// Project into decision constraints
    pub fn to_constraints(&self) -> CommonResult<DecisionConstraints> {
        self.validate()?;
        Ok(DecisionConstraints {
            tick_size: self.tick_size.clone(),
            step_size: self.step_size.clone(),
            min_price: self.min_price.clone(),
            max_price: self.max_price.clone(),
            min_qty: self.min_qty.clone(),
            max_qty: self.max_qty.clone(),
            min_notional: self.min_notional.clone(),
            max_notional: self.max_notional.clone(),
            price_precision: crate::decimal::decimal_places(&self.tick_size),
            qty_precision: crate::decimal::decimal_places(&self.step_size),
            max_num_orders: self.max_num_orders,
            max_num_algo_orders: self.max_num_algo_orders,
            trailing_delta: self.trailing_delta,
            quantization: QuantizationPolicy::Enforced,
        })
    }

    /// Canonical hash of the filters
    pub fn filters_hash(&self) -> CommonResult<String> {
        canonical_hash(self)
    }
}

/// Exchange constraints a decision must respect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionConstraints {
    /// Price increment
    pub tick_size: String,
    /// Quantity increment
    pub step_size: String,
    /// Lowest accepted price
    pub min_price: String,
    /// Highest accepted price; `"0"` disables
    pub max_price: String,
    /// Smallest quantity
    pub min_qty: String,
    /// Largest quantity
    pub max_qty: String,
    /// Smallest price times quantity
    pub min_notional: String,
    /// Largest price times quantity
    pub max_notional: Option<String>,
    /// Fractional digits of the tick
    pub price_precision: u32,
    /// Fractional digits of the step
    pub qty_precision: u32,
    /// Open order cap per symbol
    pub max_num_orders: u32,
    /// Open algo order cap per symbol
    pub max_num_algo_orders: u32,
    /// Trailing delta bounds, when the exchange publishes them
    pub trailing_delta: Option<TrailingDeltaFilter>,
    /// Enforcement policy
    pub quantization: QuantizationPolicy,
}

impl DecisionConstraints {
    /// Check every decimal field
    pub fn validate(&self) -> CommonResult<()> {
        parse_step(&self.tick_size)?;
        parse_step(&self.step_size)?;
        for (field, v) in [
            ("constraints.min_price", &self.min_price),
            ("constraints.max_price", &self.max_price),
            ("constraints.min_qty", &self.min_qty),
            ("constraints.max_qty", &self.max_qty),
            ("constraints.min_notional", &self.min_notional),
        ] {
            if !is_decimal_string(v) {
                return Err(CommonError::schema(field, format!("not a decimal string: {v:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    //! Exchange filters shared by crate tests

    use super::*;

    /// BTCUSDT with tick 0.01, step 0.001 and min notional 10.00
    #[must_use]
    pub fn btc_filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "BTCUSDT".into(),
            status: "TRADING".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            tick_size: "0.01".into(),
            min_price: "0.01".into(),
            max_price: "1000000.00".into(),
            step_size: "0.001".into(),
            min_qty: "0.001".into(),
            max_qty: "9000.000".into(),
            min_notional: "10.00".into(),
            max_notional: None,
            max_num_orders: 200,
            max_num_algo_orders: 5,
            trailing_delta: Some(TrailingDeltaFilter {
                min_bips: 10,
                max_bips: 2_000,
                step_bips: 1,
            }),
            oco_allowed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::btc_filters;
    use super::*;

    #[test]
    fn test_constraints_keep_written_precision() {
        let mut f = btc_filters();
        f.tick_size = "0.10".into();
        let c = f.to_constraints().unwrap();
        assert_eq!(c.price_precision, 2);
        assert_eq!(c.qty_precision, 3);
        assert_eq!(c.tick_size, "0.10");
    }

    #[test]
    fn test_filters_with_zero_tick_rejected() {
        let mut f = btc_filters();
        f.tick_size = "0.00".into();
        assert!(f.to_constraints().is_err());
    }

    #[test]
    fn test_candle_ordering_checked() {
        let c = Candle {
            open_time_ms: 1,
            open: "10".into(),
            high: "9".into(),
            low: "8".into(),
            close: "9".into(),
            volume: "1".into(),
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_price_change_bps() {
        let t = Ticker24h {
            symbol: "BTCUSDT".into(),
            last_price: "100".into(),
            quote_volume: "1".into(),
            trade_count: 1,
            price_change_percent: "-1.25".into(),
            close_time_ms: 0,
        };
        assert_eq!(t.price_change_bps(), -125);
    }
}
