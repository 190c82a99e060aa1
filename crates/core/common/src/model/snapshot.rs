//! Per-symbol, per-cycle market snapshot
//!
//! A snapshot is immutable once built. Its identity is the canonical hash of
//! the hash-payload projection; decisions refer to it only by that hash.

use crate::canonical::{canonical_hash, is_sha256_hex};
use crate::closed_set;
use crate::decimal::parse_decimal;
use crate::error::{CommonError, CommonResult};
use crate::model::market::Candle;
use serde::{Deserialize, Serialize};

/// Candles carried by every snapshot
pub const SNAPSHOT_CANDLES: usize = 40;

closed_set! {
    /// Coarse market regime
    pub enum RegimeLabel: "regime" {
        Trend => "TREND",
        Range => "RANGE",
        Unclear => "UNCLEAR",
    }
}

/// Regime label with its two scores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Regime {
    /// Label
    pub label: RegimeLabel,
    /// Trend strength in [0, 10000]
    pub trend_score_x10000: i64,
    /// `10000 - trend_score_x10000`
    pub range_score_x10000: i64,
}

/// 60s micro-structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Micro {
    /// Median spread over 60s
    pub spread_bps_p50_60s: i64,
    /// p90 spread over 60s
    pub spread_bps_p90_60s: i64,
    /// Spread of the latest sample
    pub spread_current_bps: i64,
    /// p90 of the last 10s minus p90 of the 10s before
    pub delta_spread_bps_p90_10s: i64,
    /// Median bid share of top-of-book size over 10s
    pub bid_ask_imbalance_p50_10s_x10000: i64,
    /// Out-of-order book events discarded
    pub ooo_drops: u64,
}

/// ATR in bps of last close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volatility {
    /// ATR-14 on 5m bars
    pub atr14_5m_bps: i64,
    /// ATR-14 on 15m bars
    pub atr14_15m_bps: i64,
}

/// Top-of-book and last trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prices {
    /// Best bid
    pub best_bid: String,
    /// Best ask
    pub best_ask: String,
    /// Midpoint
    pub mid: String,
    /// Last trade
    pub last: String,
}

/// Fees and slippage estimates in bps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostInputs {
    /// Maker fee
    pub maker_fee_bps: i64,
    /// Taker fee
    pub taker_fee_bps: i64,
    /// Expected slippage entering as maker
    pub slippage_entry_maker_bps: i64,
    /// Expected slippage entering as taker
    pub slippage_entry_taker_bps: i64,
    /// Expected slippage exiting as taker
    pub slippage_exit_taker_bps: i64,
}

impl CostInputs {
    /// Applied when every slippage estimate arrives as zero
    pub const DEFAULT_SLIPPAGE: (i64, i64, i64) = (1, 3, 2);

    /// Fill default slippage iff all three estimates are zero
    #[must_use]
    pub fn with_default_slippage(mut self) -> Self {
        if self.slippage_entry_maker_bps == 0
            && self.slippage_entry_taker_bps == 0
            && self.slippage_exit_taker_bps == 0
        {
            let (maker, taker, exit) = Self::DEFAULT_SLIPPAGE;
            self.slippage_entry_maker_bps = maker;
            self.slippage_entry_taker_bps = taker;
            self.slippage_exit_taker_bps = exit;
        }
        self
    }

    /// Fees and slippage both ways
    #[must_use]
    pub const fn round_trip_bps(&self) -> i64 {
        self.maker_fee_bps + self.taker_fee_bps + self.slippage_entry_maker_bps + self.slippage_exit_taker_bps
    }

    /// Every component non-negative
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.maker_fee_bps >= 0
            && self.taker_fee_bps >= 0
            && self.slippage_entry_maker_bps >= 0
            && self.slippage_entry_taker_bps >= 0
            && self.slippage_exit_taker_bps >= 0
    }
}

/// 24h statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats24h {
    /// Quote-asset volume
    pub quote_volume: String,
    /// Trade count
    pub trade_count: u64,
    /// Price change in bps
    pub price_change_bps: i64,
}

/// Per-symbol health flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthFlags {
    /// Filters parsed and valid
    pub filters_ok: bool,
    /// Book-ticker stream is fresh
    pub ws_ok: bool,
    /// Exchange status, e.g. `TRADING`
    pub symbol_status: String,
    /// Quarantined until this time; `<= 0` when not quarantined
    pub quarantine_until_ms: i64,
    /// Rejects over the last hour
    pub recent_rejects: u32,
}

/// Log-returns of 5m closes in bps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnsSeries {
    /// Declared length
    pub window_points: usize,
    /// Returns, oldest first
    pub returns_bps: Vec<i32>,
    /// Points filled with 0 because a close was non-positive
    pub missing_count: usize,
}

/// Configuration the snapshot was built under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReference {
    /// Hash of the rank projection
    pub config_hash: String,
    /// Hash of the thresholds projection
    pub thresholds_hash: String,
    /// Hash of the symbol filters
    pub filters_hash: String,
    /// Monotone config generation within the run
    pub cycle_config_version: u64,
}

/// Hashes of the raw inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHashes {
    /// Candles
    pub candles: String,
    /// Book samples
    pub book: String,
    /// 24h ticker
    pub ticker: String,
}

/// Identity and timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// `snap_` + first 32 hex of the hash
    pub snapshot_id: String,
    /// Build time
    pub created_ts_ms: i64,
    /// Latest exchange event time seen
    pub exchange_time_ms: i64,
    /// Latest local receive time seen
    pub local_received_ms: i64,
    /// Raw input hashes
    pub source_hashes: SourceHashes,
    /// Canonical hash of [`Snapshot::hash_payload`]
    pub snapshot_hash: String,
}

/// Observable market state for one symbol in one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Symbol
    pub symbol: String,
    /// Regime
    pub regime: Regime,
    /// Micro-structure
    pub micro_60s: Micro,
    /// Volatility
    pub volatility: Volatility,
    /// Prices
    pub prices: Prices,
    /// Exactly 40 five-minute candles, ascending
    pub candles_5m: Vec<Candle>,
    /// Cost inputs
    pub cost_inputs: CostInputs,
    /// 24h statistics
    pub stats_24h: Stats24h,
    /// Health flags
    pub health: HealthFlags,
    /// Returns series
    pub returns: ReturnsSeries,
    /// Configuration reference
    pub config_ref: ConfigReference,
    /// Identity and timing
    pub meta: SnapshotMeta,
}

#[derive(Serialize)]
struct HashPayload<'a> {
    symbol: &'a str,
    symbol_status: &'a str,
    config_hash: &'a str,
    thresholds_hash: &'a str,
    filters_hash: &'a str,
    regime: &'a Regime,
    micro_60s: &'a Micro,
    volatility: &'a Volatility,
    prices: &'a Prices,
    cost_inputs: &'a CostInputs,
    returns: &'a ReturnsSeries,
}

/// Time window a snapshot's timestamps must fall in
#[derive(Debug, Clone, Copy)]
pub struct SnapshotBudgets {
    /// Validation time
    pub now_ms: i64,
    /// Oldest acceptable age
    pub rest_stale_ms_pause: i64,
    /// Furthest acceptable future skew
    pub time_sync_recv_window_ms: i64,
}

impl Snapshot {
    /// Projection that defines the snapshot's identity
    ///
    /// # Errors
    ///
    /// Returns an error if the projection cannot be serialized.
    pub fn hash_payload(&self) -> CommonResult<serde_json::Value> {
        let payload = HashPayload {
            symbol: &self.symbol,
            symbol_status: &self.health.symbol_status,
            config_hash: &self.config_ref.config_hash,
            thresholds_hash: &self.config_ref.thresholds_hash,
            filters_hash: &self.config_ref.filters_hash,
            regime: &self.regime,
            micro_60s: &self.micro_60s,
            volatility: &self.volatility,
            prices: &self.prices,
            cost_inputs: &self.cost_inputs,
            returns: &self.returns,
        };
        Ok(serde_json::to_value(payload)?)
    }

    /// Canonical hash of the payload projection
    pub fn compute_hash(&self) -> CommonResult<String> {
        canonical_hash(&self.hash_payload()?)
    }

    /// Set `snapshot_hash` and `snapshot_id` from the current content
    pub fn seal(&mut self) -> CommonResult<()> {
        let hash = self.compute_hash()?;
        self.meta.snapshot_id = snapshot_id_for(&hash);
        self.meta.snapshot_hash = hash;
        Ok(())
    }

    /// Enforce every snapshot invariant
    pub fn validate(&self, budgets: &SnapshotBudgets) -> CommonResult<()> {
        if self.symbol.is_empty() {
            return Err(CommonError::schema("symbol", "empty"));
        }

        let r = &self.regime;
        if !(0..=10_000).contains(&r.trend_score_x10000) || !(0..=10_000).contains(&r.range_score_x10000) {
            return Err(CommonError::schema("regime", "scores must be in [0, 10000]"));
        }

        let m = &self.micro_60s;
        if !(0..=10_000).contains(&m.bid_ask_imbalance_p50_10s_x10000) {
            return Err(CommonError::schema("micro_60s.bid_ask_imbalance_p50_10s_x10000", "out of [0, 10000]"));
        }
        if m.spread_bps_p50_60s < 0 || m.spread_bps_p90_60s < 0 || m.spread_current_bps < 0 {
            return Err(CommonError::schema("micro_60s", "spreads must be non-negative"));
        }

        if self.volatility.atr14_5m_bps <= 0 || self.volatility.atr14_15m_bps <= 0 {
            return Err(CommonError::schema("volatility", "ATR must be positive"));
        }

        let bid = parse_decimal(&self.prices.best_bid)?;
        let ask = parse_decimal(&self.prices.best_ask)?;
        parse_decimal(&self.prices.mid)?;
        parse_decimal(&self.prices.last)?;
        if bid > ask {
            return Err(CommonError::schema("prices", "best_bid above best_ask"));
        }

        if self.candles_5m.len() != SNAPSHOT_CANDLES {
            return Err(CommonError::schema(
                "candles_5m",
                format!("expected {SNAPSHOT_CANDLES} candles, got {}", self.candles_5m.len()),
            ));
        }
        for pair in self.candles_5m.windows(2) {
            if pair[1].open_time_ms <= pair[0].open_time_ms {
                return Err(CommonError::schema("candles_5m", "open times not strictly ascending"));
            }
        }
        for candle in &self.candles_5m {
            candle.validate()?;
        }

        if !self.cost_inputs.is_valid() {
            return Err(CommonError::schema("cost_inputs", "negative component"));
        }
        parse_decimal(&self.stats_24h.quote_volume)?;

        if self.returns.returns_bps.len() != self.returns.window_points {
            return Err(CommonError::schema(
                "returns",
                format!(
                    "expected {} points, got {}",
                    self.returns.window_points,
                    self.returns.returns_bps.len()
                ),
            ));
        }

        for (field, hash) in [
            ("config_ref.config_hash", &self.config_ref.config_hash),
            ("config_ref.thresholds_hash", &self.config_ref.thresholds_hash),
            ("config_ref.filters_hash", &self.config_ref.filters_hash),
            ("meta.source_hashes.candles", &self.meta.source_hashes.candles),
            ("meta.source_hashes.book", &self.meta.source_hashes.book),
            ("meta.source_hashes.ticker", &self.meta.source_hashes.ticker),
            ("meta.snapshot_hash", &self.meta.snapshot_hash),
        ] {
            if !is_sha256_hex(hash) {
                return Err(CommonError::schema(field, "not a 64-char lowercase hex digest"));
            }
        }
        let expected = self.compute_hash()?;
        if expected != self.meta.snapshot_hash {
            return Err(CommonError::schema("meta.snapshot_hash", "does not match payload"));
        }
        if self.meta.snapshot_id != snapshot_id_for(&expected) {
            return Err(CommonError::schema("meta.snapshot_id", "does not match hash"));
        }

        let oldest = budgets.now_ms - budgets.rest_stale_ms_pause;
        let newest = budgets.now_ms + budgets.time_sync_recv_window_ms;
        for (field, ts) in [
            ("meta.created_ts_ms", self.meta.created_ts_ms),
            ("meta.exchange_time_ms", self.meta.exchange_time_ms),
            ("meta.local_received_ms", self.meta.local_received_ms),
        ] {
            if ts <= 0 || ts < oldest || ts > newest {
                return Err(CommonError::schema(
                    field,
                    format!("{ts} outside [{oldest}, {newest}]"),
                ));
            }
        }
        Ok(())
    }

    /// Best bid, parsed
    pub fn best_bid(&self) -> CommonResult<rust_decimal::Decimal> {
        Ok(parse_decimal(&self.prices.best_bid)?)
    }
}

/// `snap_` + first 32 hex chars of the snapshot hash
#[must_use]
pub fn snapshot_id_for(hash: &str) -> String {
    format!("snap_{}", &hash[..hash.len().min(32)])
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    //! Deterministic snapshot used across crate tests

    use super::*;
    use crate::canonical::sha256_hex;

    /// Fixture build time
    pub const T0: i64 = 1_700_000_000_000;

    /// 40 gently rising 5m candles ending near 104
    #[must_use]
    pub fn rising_candles() -> Vec<Candle> {
        (0..SNAPSHOT_CANDLES)
            .map(|i| {
                let close = 100.0 + 0.1 * i as f64;
                Candle {
                    open_time_ms: T0 - (SNAPSHOT_CANDLES - i) as i64 * 300_000,
                    open: format!("{:.2}", close - 0.05),
                    high: format!("{:.2}", close + 0.5),
                    low: format!("{:.2}", close - 0.5),
                    close: format!("{close:.2}"),
                    volume: "10.0".to_string(),
                }
            })
            .collect()
    }

    /// TREND snapshot for BTCUSDT, best bid 104.00, ATR 200 bps, sealed
    #[must_use]
    pub fn trend_snapshot() -> Snapshot {
        let h = sha256_hex(b"fixture");
        let mut s = Snapshot {
            symbol: "BTCUSDT".into(),
            regime: Regime {
                label: RegimeLabel::Trend,
                trend_score_x10000: 8_000,
                range_score_x10000: 2_000,
            },
            micro_60s: Micro {
                spread_bps_p50_60s: 2,
                spread_bps_p90_60s: 3,
                spread_current_bps: 2,
                delta_spread_bps_p90_10s: 0,
                bid_ask_imbalance_p50_10s_x10000: 6_000,
                ooo_drops: 0,
            },
            volatility: Volatility {
                atr14_5m_bps: 200,
                atr14_15m_bps: 260,
            },
            prices: Prices {
                best_bid: "104.00".into(),
                best_ask: "104.02".into(),
                mid: "104.01".into(),
                last: "104.01".into(),
            },
            candles_5m: rising_candles(),
            cost_inputs: CostInputs {
                maker_fee_bps: 2,
                taker_fee_bps: 4,
                slippage_entry_maker_bps: 1,
                slippage_entry_taker_bps: 3,
                slippage_exit_taker_bps: 2,
            },
            stats_24h: Stats24h {
                quote_volume: "50000000".into(),
                trade_count: 200_000,
                price_change_bps: 150,
            },
            health: HealthFlags {
                filters_ok: true,
                ws_ok: true,
                symbol_status: "TRADING".into(),
                quarantine_until_ms: 0,
                recent_rejects: 0,
            },
            returns: ReturnsSeries {
                window_points: 36,
                returns_bps: (0..36).map(|i| if i % 2 == 0 { 10 } else { -4 }).collect(),
                missing_count: 0,
            },
            config_ref: ConfigReference {
                config_hash: h.clone(),
                thresholds_hash: h.clone(),
                filters_hash: h.clone(),
                cycle_config_version: 1,
            },
            meta: SnapshotMeta {
                snapshot_id: String::new(),
                created_ts_ms: T0,
                exchange_time_ms: T0 - 50,
                local_received_ms: T0 - 40,
                source_hashes: SourceHashes {
                    candles: h.clone(),
                    book: h.clone(),
                    ticker: h,
                },
                snapshot_hash: String::new(),
            },
        };
        // Fixture content is fully valid; sealing cannot fail on it.
        let _ = s.seal();
        s
    }
}
