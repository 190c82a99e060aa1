//! Per-symbol snapshot assembly
//!
//! Turns the raw inputs of one symbol (24h ticker, recent book-ticker samples,
//! four candle timeframes, filters, cost estimates, health flags) into a sealed
//! and validated [`Snapshot`]. Identical inputs produce an identical
//! `snapshot_hash`.

use crate::error::{EngineError, EngineResult};
use crate::indicators::{atr_bps, log_returns_bps, percentile, round_even, wilder_adx};
use common::canonical::canonical_hash;
use common::decimal::{format_plain, parse_decimal};
use common::model::snapshot::SNAPSHOT_CANDLES;
use common::model::{
    BookSample, Candle, ConfigReference, CostInputs, HealthFlags, Micro, Prices, Regime,
    RegimeLabel, ReturnsSeries, Snapshot, SnapshotBudgets, SnapshotMeta, SourceHashes, Stats24h,
    SymbolFilters, Ticker24h, Volatility,
};
use common::{AgentConfig, CommonError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::debug;

/// Candles requested per timeframe
pub const KLINE_LIMIT: u32 = 100;

/// Micro-structure window
pub const MICRO_WINDOW_MS: i64 = 60_000;

/// Sub-window for delta spread and imbalance
pub const MICRO_SUBWINDOW_MS: i64 = 10_000;

const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;

/// Regime weights for 1h, 15m, 5m, 1m ADX
const ADX_WEIGHTS: [f64; 4] = [0.4, 0.3, 0.2, 0.1];

const TREND_LABEL_MIN_X10000: i64 = 7_000;
const RANGE_LABEL_MIN_X10000: i64 = 6_000;

/// Candle history for one symbol, each series ascending by open time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandleSeries {
    /// 1m bars
    #[serde(rename = "1m")]
    pub m1: Vec<Candle>,
    /// 5m bars
    #[serde(rename = "5m")]
    pub m5: Vec<Candle>,
    /// 15m bars
    #[serde(rename = "15m")]
    pub m15: Vec<Candle>,
    /// 1h bars
    #[serde(rename = "1h")]
    pub h1: Vec<Candle>,
}

/// Everything the builder reads for one symbol
#[derive(Debug, Clone)]
pub struct SnapshotInputs<'a> {
    /// 24h ticker
    pub ticker: &'a Ticker24h,
    /// Recent book samples, any order
    pub book: &'a [BookSample],
    /// Candle history
    pub candles: &'a CandleSeries,
    /// Exchange filters
    pub filters: &'a SymbolFilters,
    /// Fees and slippage estimates
    pub costs: CostInputs,
    /// Health flags
    pub health: HealthFlags,
    /// Book samples dropped as out of order
    pub ooo_drops: u64,
}

/// Builds snapshots under one configuration generation
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    config_hash: String,
    thresholds_hash: String,
    cycle_config_version: u64,
    window_points: usize,
    rest_stale_ms_pause: i64,
    time_sync_recv_window_ms: i64,
}

impl SnapshotBuilder {
    /// Builder bound to `config` at generation `cycle_config_version`
    pub fn new(config: &AgentConfig, cycle_config_version: u64) -> EngineResult<Self> {
        Ok(Self {
            config_hash: config.rank_hash()?,
            thresholds_hash: config.thresholds_hash()?,
            cycle_config_version,
            window_points: config.topk.window_points,
            rest_stale_ms_pause: config.health.rest_stale_ms_pause,
            time_sync_recv_window_ms: config.exchange.time_sync_recv_window_ms,
        })
    }

    /// Time budgets the built snapshot is validated against
    #[must_use]
    pub const fn budgets(&self, now_ms: i64) -> SnapshotBudgets {
        SnapshotBudgets {
            now_ms,
            rest_stale_ms_pause: self.rest_stale_ms_pause,
            time_sync_recv_window_ms: self.time_sync_recv_window_ms,
        }
    }

    /// Assemble, seal and validate one snapshot
    pub fn build(&self, inputs: &SnapshotInputs<'_>, now_ms: i64) -> EngineResult<Snapshot> {
        let symbol = inputs.filters.symbol.clone();
        if inputs.ticker.symbol != symbol {
            return Err(CommonError::schema(
                "ticker.symbol",
                format!("{} does not match {symbol}", inputs.ticker.symbol),
            )
            .into());
        }

        let latest = inputs
            .book
            .iter()
            .max_by_key(|s| s.exchange_ts_ms)
            .ok_or_else(|| EngineError::NoBook { symbol: symbol.clone() })?;
        let micro = micro_structure(inputs.book, latest, inputs.ooo_drops)?;
        let prices = prices(latest, &inputs.ticker.last_price)?;

        let c = inputs.candles;
        let volatility = Volatility {
            atr14_5m_bps: atr_bps(&c.m5, ATR_PERIOD).ok_or(EngineError::InsufficientData {
                what: "5m candles for ATR",
                need: ATR_PERIOD + 1,
                got: c.m5.len(),
            })?,
            atr14_15m_bps: atr_bps(&c.m15, ATR_PERIOD).ok_or(EngineError::InsufficientData {
                what: "15m candles for ATR",
                need: ATR_PERIOD + 1,
                got: c.m15.len(),
            })?,
        };
        let regime = regime(c)?;

        let closes: Vec<f64> = c.m5.iter().map(Candle::close_f64).collect();
        let (returns_bps, missing_count) = log_returns_bps(&closes, self.window_points).ok_or(
            EngineError::InsufficientData {
                what: "5m closes for returns",
                need: self.window_points + 1,
                got: closes.len(),
            },
        )?;

        if c.m5.len() < SNAPSHOT_CANDLES {
            return Err(EngineError::InsufficientData {
                what: "5m candles",
                need: SNAPSHOT_CANDLES,
                got: c.m5.len(),
            });
        }
        let candles_5m = c.m5[c.m5.len() - SNAPSHOT_CANDLES..].to_vec();

        let window = micro_window(inputs.book, latest.exchange_ts_ms, MICRO_WINDOW_MS);
        let source_hashes = SourceHashes {
            candles: canonical_hash(c)?,
            book: canonical_hash(&window)?,
            ticker: canonical_hash(inputs.ticker)?,
        };

        let mut snapshot = Snapshot {
            symbol,
            regime,
            micro_60s: micro,
            volatility,
            prices,
            candles_5m,
            cost_inputs: inputs.costs.clone().with_default_slippage(),
            stats_24h: Stats24h {
                quote_volume: inputs.ticker.quote_volume.clone(),
                trade_count: inputs.ticker.trade_count,
                price_change_bps: inputs.ticker.price_change_bps(),
            },
            health: inputs.health.clone(),
            returns: ReturnsSeries {
                window_points: self.window_points,
                returns_bps,
                missing_count,
            },
            config_ref: ConfigReference {
                config_hash: self.config_hash.clone(),
                thresholds_hash: self.thresholds_hash.clone(),
                filters_hash: inputs.filters.filters_hash()?,
                cycle_config_version: self.cycle_config_version,
            },
            meta: SnapshotMeta {
                snapshot_id: String::new(),
                created_ts_ms: now_ms,
                exchange_time_ms: latest.exchange_ts_ms,
                local_received_ms: inputs.book.iter().map(|s| s.local_ts_ms).max().unwrap_or(latest.local_ts_ms),
                source_hashes,
                snapshot_hash: String::new(),
            },
        };
        snapshot.seal()?;
        snapshot.validate(&self.budgets(now_ms))?;
        debug!(
            symbol = %snapshot.symbol,
            snapshot_id = %snapshot.meta.snapshot_id,
            regime = %snapshot.regime.label,
            "snapshot built"
        );
        Ok(snapshot)
    }
}

fn micro_window(book: &[BookSample], to_ms: i64, window_ms: i64) -> Vec<BookSample> {
    let mut window: Vec<BookSample> = book
        .iter()
        .filter(|s| s.exchange_ts_ms > to_ms - window_ms && s.exchange_ts_ms <= to_ms)
        .cloned()
        .collect();
    window.sort_by_key(|s| s.exchange_ts_ms);
    window
}

/// `round_half_even(num * 10000 / den)`; `None` for a non-positive denominator
fn ratio_bps(num: Decimal, den: Decimal) -> Option<i64> {
    if den <= Decimal::ZERO {
        return None;
    }
    num.checked_mul(Decimal::from(10_000))?
        .checked_div(den)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_i64()
}

fn spread_bps(sample: &BookSample) -> EngineResult<Option<i64>> {
    let bid = parse_decimal(&sample.bid_price)?;
    let ask = parse_decimal(&sample.ask_price)?;
    let mid = (bid + ask) / Decimal::TWO;
    Ok(ratio_bps(ask - bid, mid).map(|bps| bps.max(0)))
}

fn imbalance_x10000(sample: &BookSample) -> EngineResult<Option<i64>> {
    let bid = parse_decimal(&sample.bid_qty)?;
    let ask = parse_decimal(&sample.ask_qty)?;
    Ok(ratio_bps(bid, bid + ask).map(|v| v.clamp(0, 10_000)))
}

fn spreads_of(samples: &[BookSample]) -> EngineResult<Vec<i64>> {
    let mut out = Vec::with_capacity(samples.len());
    for s in samples {
        if let Some(bps) = spread_bps(s)? {
            out.push(bps);
        }
    }
    Ok(out)
}

fn micro_structure(book: &[BookSample], latest: &BookSample, ooo_drops: u64) -> EngineResult<Micro> {
    let to = latest.exchange_ts_ms;
    let window = micro_window(book, to, MICRO_WINDOW_MS);
    let spreads = spreads_of(&window)?;

    let recent: Vec<BookSample> = window
        .iter()
        .filter(|s| s.exchange_ts_ms > to - MICRO_SUBWINDOW_MS)
        .cloned()
        .collect();
    let previous: Vec<BookSample> = window
        .iter()
        .filter(|s| {
            s.exchange_ts_ms > to - 2 * MICRO_SUBWINDOW_MS && s.exchange_ts_ms <= to - MICRO_SUBWINDOW_MS
        })
        .cloned()
        .collect();
    let recent_p90 = percentile(&spreads_of(&recent)?, 90);
    let previous_p90 = percentile(&spreads_of(&previous)?, 90);
    let delta = match (recent_p90, previous_p90) {
        (Some(r), Some(p)) => r - p,
        _ => 0,
    };

    let mut imbalances = Vec::with_capacity(recent.len());
    for s in &recent {
        if let Some(v) = imbalance_x10000(s)? {
            imbalances.push(v);
        }
    }

    Ok(Micro {
        spread_bps_p50_60s: percentile(&spreads, 50).unwrap_or(0),
        spread_bps_p90_60s: percentile(&spreads, 90).unwrap_or(0),
        spread_current_bps: spread_bps(latest)?.unwrap_or(0),
        delta_spread_bps_p90_10s: delta,
        bid_ask_imbalance_p50_10s_x10000: percentile(&imbalances, 50).unwrap_or(5_000),
        ooo_drops,
    })
}

fn prices(latest: &BookSample, last: &str) -> EngineResult<Prices> {
    let bid = parse_decimal(&latest.bid_price)?;
    let ask = parse_decimal(&latest.ask_price)?;
    parse_decimal(last)?;
    Ok(Prices {
        best_bid: latest.bid_price.clone(),
        best_ask: latest.ask_price.clone(),
        mid: format_plain((bid + ask) / Decimal::TWO),
        last: last.to_string(),
    })
}

fn regime(c: &CandleSeries) -> EngineResult<Regime> {
    let mut aggregate = 0.0;
    for ((series, what), weight) in [
        (&c.h1, "1h candles for ADX"),
        (&c.m15, "15m candles for ADX"),
        (&c.m5, "5m candles for ADX"),
        (&c.m1, "1m candles for ADX"),
    ]
    .into_iter()
    .zip(ADX_WEIGHTS)
    {
        let adx = wilder_adx(series, ADX_PERIOD).ok_or(EngineError::InsufficientData {
            what,
            need: 2 * ADX_PERIOD,
            got: series.len(),
        })?;
        aggregate += weight * adx / 100.0;
    }
    let trend = round_even(aggregate * 10_000.0).clamp(0, 10_000);
    let range = 10_000 - trend;
    let label = if trend >= TREND_LABEL_MIN_X10000 {
        RegimeLabel::Trend
    } else if range >= RANGE_LABEL_MIN_X10000 {
        RegimeLabel::Range
    } else {
        RegimeLabel::Unclear
    };
    Ok(Regime {
        label,
        trend_score_x10000: trend,
        range_score_x10000: range,
    })
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    //! Synthetic market inputs that build into a valid snapshot

    use super::*;

    /// Build time used by the fixtures
    pub const NOW: i64 = 1_700_000_000_000;

    /// `n` bars stepping `step_ms` apart, ending just before [`NOW`]
    ///
    /// Each bar rises `drift` from the previous close and spans 1.0.
    #[must_use]
    pub fn bars(n: usize, step_ms: i64, start: f64, drift: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let open = start + drift * i as f64;
                let close = open + drift;
                Candle {
                    open_time_ms: NOW - (n - i) as i64 * step_ms,
                    open: format!("{open:.2}"),
                    high: format!("{:.2}", open.max(close) + 0.5),
                    low: format!("{:.2}", open.min(close) - 0.5),
                    close: format!("{close:.2}"),
                    volume: "10.00".into(),
                }
            })
            .collect()
    }

    /// Rising history on every timeframe
    #[must_use]
    pub fn trending_series() -> CandleSeries {
        CandleSeries {
            m1: bars(60, 60_000, 100.0, 0.2),
            m5: bars(60, 300_000, 100.0, 0.2),
            m15: bars(60, 900_000, 100.0, 0.2),
            h1: bars(60, 3_600_000, 100.0, 0.2),
        }
    }

    /// Book sample at `ts` with the given top of book
    #[must_use]
    pub fn sample(ts: i64, bid: &str, ask: &str, bid_qty: &str, ask_qty: &str) -> BookSample {
        BookSample {
            exchange_ts_ms: ts,
            local_ts_ms: ts + 5,
            bid_price: bid.into(),
            bid_qty: bid_qty.into(),
            ask_price: ask.into(),
            ask_qty: ask_qty.into(),
        }
    }

    /// Ticker matching the fixture symbol
    #[must_use]
    pub fn ticker(symbol: &str) -> Ticker24h {
        Ticker24h {
            symbol: symbol.into(),
            last_price: "112.01".into(),
            quote_volume: "50000000.00".into(),
            trade_count: 200_000,
            price_change_percent: "1.50".into(),
            close_time_ms: NOW - 1_000,
        }
    }

    /// All-healthy flags
    #[must_use]
    pub fn healthy() -> HealthFlags {
        HealthFlags {
            filters_ok: true,
            ws_ok: true,
            symbol_status: "TRADING".into(),
            quarantine_until_ms: 0,
            recent_rejects: 0,
        }
    }

    /// Fees only; slippage left at zero for the builder to default
    #[must_use]
    pub fn fees() -> CostInputs {
        CostInputs {
            maker_fee_bps: 2,
            taker_fee_bps: 4,
            slippage_entry_maker_bps: 0,
            slippage_entry_taker_bps: 0,
            slippage_exit_taker_bps: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use common::model::market::fixtures::btc_filters;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    #[fixture]
    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(&AgentConfig::default(), 1).unwrap()
    }

    fn steady_book() -> Vec<BookSample> {
        (0..30)
            .map(|i| sample(NOW - 59_000 + i * 2_000, "112.00", "112.02", "6", "4"))
            .collect()
    }

    fn build(builder: &SnapshotBuilder, book: &[BookSample], series: &CandleSeries) -> EngineResult<Snapshot> {
        let filters = btc_filters();
        let ticker = ticker("BTCUSDT");
        builder.build(
            &SnapshotInputs {
                ticker: &ticker,
                book,
                candles: series,
                filters: &filters,
                costs: fees(),
                health: healthy(),
                ooo_drops: 3,
            },
            NOW,
        )
    }

    #[rstest]
    fn test_builds_valid_trend_snapshot(builder: SnapshotBuilder) {
        let s = build(&builder, &steady_book(), &trending_series()).unwrap();
        assert_eq!(s.regime.label, RegimeLabel::Trend);
        assert_eq!(s.regime.trend_score_x10000 + s.regime.range_score_x10000, 10_000);
        assert_eq!(s.micro_60s.spread_current_bps, 2);
        assert_eq!(s.micro_60s.spread_bps_p90_60s, 2);
        assert_eq!(s.micro_60s.delta_spread_bps_p90_10s, 0);
        assert_eq!(s.micro_60s.bid_ask_imbalance_p50_10s_x10000, 6_000);
        assert_eq!(s.micro_60s.ooo_drops, 3);
        assert_eq!(s.prices.mid, "112.01");
        assert_eq!(s.candles_5m.len(), SNAPSHOT_CANDLES);
        assert_eq!(s.returns.returns_bps.len(), 36);
        assert_eq!(s.cost_inputs.slippage_entry_taker_bps, 3);
        assert!(s.volatility.atr14_5m_bps > 0);
    }

    #[rstest]
    fn test_same_inputs_same_hash(builder: SnapshotBuilder) {
        let a = build(&builder, &steady_book(), &trending_series()).unwrap();
        let mut shuffled = steady_book();
        shuffled.reverse();
        let b = build(&builder, &shuffled, &trending_series()).unwrap();
        assert_eq!(a.meta.snapshot_hash, b.meta.snapshot_hash);
        assert_eq!(a.meta.snapshot_id, b.meta.snapshot_id);
    }

    #[rstest]
    fn test_widening_spread_shows_in_delta(builder: SnapshotBuilder) {
        let mut book: Vec<BookSample> = (0..10)
            .map(|i| sample(NOW - 19_000 + i * 1_000, "112.00", "112.02", "1", "1"))
            .collect();
        book.extend((0..10).map(|i| sample(NOW - 9_000 + i * 1_000, "112.00", "112.10", "1", "1")));
        let s = build(&builder, &book, &trending_series()).unwrap();
        // 0.10 / 112.05 and 0.02 / 112.01 in bps
        assert_eq!(s.micro_60s.delta_spread_bps_p90_10s, 9 - 2);
        assert_eq!(s.micro_60s.bid_ask_imbalance_p50_10s_x10000, 5_000);
    }

    #[rstest]
    fn test_short_history_is_insufficient(builder: SnapshotBuilder) {
        let mut series = trending_series();
        series.h1.truncate(20);
        let err = build(&builder, &steady_book(), &series).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData { need: 28, got: 20, .. }));
    }

    #[rstest]
    fn test_empty_book_rejected(builder: SnapshotBuilder) {
        let err = build(&builder, &[], &trending_series()).unwrap_err();
        assert!(matches!(err, EngineError::NoBook { .. }));
    }

    #[rstest]
    fn test_stale_book_fails_validation(builder: SnapshotBuilder) {
        let book = vec![sample(NOW - 400_000, "112.00", "112.02", "1", "1")];
        let err = build(&builder, &book, &trending_series()).unwrap_err();
        assert!(err.to_string().contains("exchange_time_ms"), "{err}");
    }

    #[test]
    fn test_flat_market_is_range() {
        let flat = CandleSeries {
            m1: bars(60, 60_000, 100.0, 0.0),
            m5: bars(60, 300_000, 100.0, 0.0),
            m15: bars(60, 900_000, 100.0, 0.0),
            h1: bars(60, 3_600_000, 100.0, 0.0),
        };
        let r = regime(&flat).unwrap();
        assert_eq!(r.label, RegimeLabel::Range);
        assert_eq!(r.trend_score_x10000, 0);
    }
}
