//! Universe scan, rank top-N, deep scan and correlation-aware top-K
//!
//! Every stage is a pure function of snapshots and configuration. Orders are
//! deterministic: score descending, then symbol ascending.

use crate::indicators::{pearson, round_even};
use common::config::{DeepConfig, RankConfig, TopKConfig, UniverseConfig};
use common::decimal::parse_decimal;
use common::model::{ReturnsSeries, Snapshot};
use common::ReasonCode;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Eligibility of one symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UniverseVerdict {
    /// Symbol
    pub symbol: String,
    /// Passed every gate
    pub eligible: bool,
    /// `UNIVERSE_ELIGIBLE` or every failed gate
    pub reasons: Vec<ReasonCode>,
    /// 24h quote volume
    pub quote_volume: String,
    /// 24h trades
    pub trade_count: u64,
    /// 24h change
    pub price_change_bps: i64,
}

/// Check every universe gate for each snapshot
#[must_use]
pub fn universe_scan(cfg: &UniverseConfig, snapshots: &[Snapshot]) -> Vec<UniverseVerdict> {
    snapshots
        .iter()
        .map(|s| {
            let mut reasons = Vec::new();
            if s.health.symbol_status != "TRADING" {
                reasons.push(ReasonCode::UniverseSymbolNotTrading);
            }
            if !s.health.filters_ok {
                reasons.push(ReasonCode::UniverseFiltersNotOk);
            }
            if !s.health.ws_ok {
                reasons.push(ReasonCode::UniverseWsNotOk);
            }
            if s.health.quarantine_until_ms > 0 {
                reasons.push(ReasonCode::UniverseQuarantined);
            }
            let volume_ok = parse_decimal(&s.stats_24h.quote_volume)
                .is_ok_and(|v| v >= cfg.min_quote_volume_24h);
            if !volume_ok {
                reasons.push(ReasonCode::UniverseLowVolume);
            }
            if s.stats_24h.trade_count < cfg.min_trade_count_24h {
                reasons.push(ReasonCode::UniverseLowTrades);
            }
            if s.stats_24h.price_change_bps < cfg.min_price_change_bps {
                reasons.push(ReasonCode::UniverseLowPriceChange);
            }
            let eligible = reasons.is_empty();
            if eligible {
                reasons.push(ReasonCode::UniverseEligible);
            }
            UniverseVerdict {
                symbol: s.symbol.clone(),
                eligible,
                reasons,
                quote_volume: s.stats_24h.quote_volume.clone(),
                trade_count: s.stats_24h.trade_count,
                price_change_bps: s.stats_24h.price_change_bps,
            }
        })
        .collect()
}

/// One symbol's rank score with its normalized components
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedSymbol {
    /// 1-based position
    pub rank: usize,
    /// Symbol
    pub symbol: String,
    /// Weighted score
    pub score_x10000: i64,
    /// Volume over the max volume
    pub liquidity_x10000: i64,
    /// Price change over the max price change
    pub momentum_x10000: i64,
    /// One minus spread over the max spread
    pub spread_x10000: i64,
    /// Inside the top N
    pub selected: bool,
    /// `RANK_SELECTED` or `RANK_TRUNCATED`
    pub reason: ReasonCode,
}

fn by_score_then_symbol(a: (i64, &str), b: (i64, &str)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

fn unit(x: f64) -> f64 {
    if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.0 }
}

/// Score eligible snapshots and mark the top N
///
/// Returns every input ranked; entries past N carry `RANK_TRUNCATED`.
#[must_use]
pub fn rank_top_n(cfg: &RankConfig, eligible: &[&Snapshot]) -> Vec<RankedSymbol> {
    // unparseable volume ranks as no liquidity
    let volume = |s: &Snapshot| parse_decimal(&s.stats_24h.quote_volume).unwrap_or(Decimal::ZERO);
    let max_volume = eligible.iter().map(|s| volume(s)).max().unwrap_or(Decimal::ZERO);
    let max_change = eligible
        .iter()
        .map(|s| s.stats_24h.price_change_bps)
        .max()
        .unwrap_or(0);
    let max_spread = eligible
        .iter()
        .map(|s| s.micro_60s.spread_current_bps)
        .max()
        .unwrap_or(0);

    let mut ranked: Vec<RankedSymbol> = eligible
        .iter()
        .map(|s| {
            let liquidity = if max_volume > Decimal::ZERO {
                unit((volume(s) / max_volume).to_f64().unwrap_or(0.0))
            } else {
                0.0
            };
            let momentum = if max_change > 0 {
                unit(s.stats_24h.price_change_bps as f64 / max_change as f64)
            } else {
                0.0
            };
            let spread = if max_spread > 0 {
                unit(1.0 - s.micro_60s.spread_current_bps as f64 / max_spread as f64)
            } else {
                1.0
            };
            let score = cfg.weight_liquidity * liquidity + cfg.weight_momentum * momentum + cfg.weight_spread * spread;
            RankedSymbol {
                rank: 0,
                symbol: s.symbol.clone(),
                score_x10000: round_even(score * 10_000.0).clamp(0, 10_000),
                liquidity_x10000: round_even(liquidity * 10_000.0),
                momentum_x10000: round_even(momentum * 10_000.0),
                spread_x10000: round_even(spread * 10_000.0),
                selected: false,
                reason: ReasonCode::RankTruncated,
            }
        })
        .collect();
    ranked.sort_by(|a, b| by_score_then_symbol((a.score_x10000, a.symbol.as_str()), (b.score_x10000, b.symbol.as_str())));
    for (i, r) in ranked.iter_mut().enumerate() {
        r.rank = i + 1;
        if i < cfg.top_n {
            r.selected = true;
            r.reason = ReasonCode::RankSelected;
        }
    }
    ranked
}

/// Deep-scan outcome for one symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepScore {
    /// 1-based position among all scanned
    pub rank: usize,
    /// Symbol
    pub symbol: String,
    /// Passed every filter
    pub passed: bool,
    /// `DEEP_PASSED` or every failed filter
    pub reasons: Vec<ReasonCode>,
    /// ATR minus round-trip costs and spread
    pub edge_bps: i64,
    /// Weighted score
    pub score_x10000: i64,
}

/// ATR-14 (5m) minus spread, fees and slippage both ways
#[must_use]
pub fn deep_edge_bps(s: &Snapshot) -> i64 {
    let c = &s.cost_inputs;
    s.volatility.atr14_5m_bps
        - (s.micro_60s.spread_current_bps
            + c.maker_fee_bps
            + c.taker_fee_bps
            + c.slippage_entry_maker_bps
            + c.slippage_exit_taker_bps)
}

/// Filter and score the ranked symbols
#[must_use]
pub fn deep_scan(cfg: &DeepConfig, snapshots: &[&Snapshot]) -> Vec<DeepScore> {
    let mut scored: Vec<DeepScore> = snapshots
        .iter()
        .map(|s| {
            let m = &s.micro_60s;
            let edge = deep_edge_bps(s);
            let mut reasons = Vec::new();
            if m.spread_current_bps > cfg.deep_max_spread_bps {
                reasons.push(ReasonCode::DeepSpreadTooWide);
            }
            if m.bid_ask_imbalance_p50_10s_x10000 < cfg.deep_min_imbalance_x10000 {
                reasons.push(ReasonCode::DeepImbalanceLow);
            }
            if edge < cfg.deep_min_edge_bps {
                reasons.push(ReasonCode::DeepEdgeTooLow);
            }
            let passed = reasons.is_empty();
            if passed {
                reasons.push(ReasonCode::DeepPassed);
            }

            let atr = s.volatility.atr14_5m_bps as f64;
            let edge_n = if atr > 0.0 { unit(edge as f64 / atr) } else { 0.0 };
            let regime_n = s.regime.trend_score_x10000.max(s.regime.range_score_x10000) as f64 / 10_000.0;
            let spread_n = if cfg.deep_max_spread_bps > 0 {
                unit(1.0 - m.spread_current_bps as f64 / cfg.deep_max_spread_bps as f64)
            } else {
                0.0
            };
            let micro_n = 0.5 * spread_n + 0.5 * unit(m.bid_ask_imbalance_p50_10s_x10000 as f64 / 10_000.0);
            let normal = cfg.normal_atr_bps.max(1) as f64;
            let vol_n = unit(1.0 - (atr - normal).abs() / normal);
            let score = cfg.weight_edge * edge_n
                + cfg.weight_regime * regime_n
                + cfg.weight_micro * micro_n
                + cfg.weight_volatility * vol_n;

            DeepScore {
                rank: 0,
                symbol: s.symbol.clone(),
                passed,
                reasons,
                edge_bps: edge,
                score_x10000: round_even(score * 10_000.0).clamp(0, 10_000),
            }
        })
        .collect();
    scored.sort_by(|a, b| by_score_then_symbol((a.score_x10000, a.symbol.as_str()), (b.score_x10000, b.symbol.as_str())));
    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    scored
}

/// A deep-scan survivor offered to top-K
#[derive(Debug, Clone, Copy)]
pub struct TopKCandidate<'a> {
    /// Symbol
    pub symbol: &'a str,
    /// Deep-scan score
    pub score_x10000: i64,
    /// 5m returns
    pub returns: &'a ReturnsSeries,
}

/// The watchlist chosen in an earlier cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviousTopK {
    /// Members
    pub symbols: Vec<String>,
    /// Cycles since it was chosen
    pub age_cycles: u64,
}

/// Candidate whose correlation with an admitted member reached the limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairOverLimit {
    /// Rejected candidate
    pub candidate: String,
    /// Admitted member it collided with
    pub member: String,
    /// |Pearson| x 10000
    pub corr_x10000: i64,
    /// Always `REJECT`
    pub action: &'static str,
}

/// One top-K decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopKEntry {
    /// Symbol
    pub symbol: String,
    /// Deep-scan score
    pub score_x10000: i64,
    /// Admitted to the watchlist
    pub selected: bool,
    /// Why
    pub reasons: Vec<ReasonCode>,
}

/// Result of the top-K walk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopKOutcome {
    /// Every candidate in walk order
    pub entries: Vec<TopKEntry>,
    /// Correlation rejections
    pub pairs_over_limit: Vec<PairOverLimit>,
}

impl TopKOutcome {
    /// Admitted symbols in walk order
    #[must_use]
    pub fn selected(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.symbol.clone())
            .collect()
    }
}

/// |Pearson| x 10000 over the last `window` returns; 0 when either series is unusable
///
/// A series is unusable with more than 10% missing points or fewer than
/// `window` points.
#[must_use]
pub fn correlation_x10000(a: &ReturnsSeries, b: &ReturnsSeries, window: usize) -> i64 {
    let usable = |r: &ReturnsSeries| {
        window > 0 && r.returns_bps.len() >= window && r.missing_count * 10 <= r.returns_bps.len()
    };
    if !usable(a) || !usable(b) {
        return 0;
    }
    let tail = |r: &ReturnsSeries| -> Vec<f64> {
        r.returns_bps[r.returns_bps.len() - window..]
            .iter()
            .map(|v| f64::from(*v))
            .collect()
    };
    pearson(&tail(a), &tail(b)).map_or(0, |r| round_even(r.abs() * 10_000.0))
}

/// Walk candidates by score and admit those not too correlated with earlier admits
pub fn select_top_k(cfg: &TopKConfig, candidates: &[TopKCandidate<'_>], previous: Option<&PreviousTopK>) -> TopKOutcome {
    let guard: FxHashSet<&str> = match previous {
        Some(p) if p.age_cycles < cfg.churn_guard_min_cycles && cfg.churn_guard_min_score_delta_x10000 > 0 => {
            p.symbols.iter().map(String::as_str).collect()
        }
        _ => FxHashSet::default(),
    };
    let boost = |c: &TopKCandidate<'_>| {
        if guard.contains(c.symbol) {
            c.score_x10000 + cfg.churn_guard_min_score_delta_x10000
        } else {
            c.score_x10000
        }
    };

    let mut order: Vec<&TopKCandidate<'_>> = candidates.iter().collect();
    order.sort_by(|a, b| by_score_then_symbol((boost(a), a.symbol), (boost(b), b.symbol)));

    let mut outcome = TopKOutcome::default();
    let mut admitted: Vec<&TopKCandidate<'_>> = Vec::with_capacity(cfg.k);
    for c in order {
        if admitted.len() >= cfg.k {
            outcome.entries.push(TopKEntry {
                symbol: c.symbol.to_string(),
                score_x10000: c.score_x10000,
                selected: false,
                reasons: vec![ReasonCode::TopkCapacityReached],
            });
            continue;
        }
        let collisions: Vec<PairOverLimit> = admitted
            .iter()
            .filter_map(|m| {
                let corr = correlation_x10000(c.returns, m.returns, cfg.corr_window_points);
                (corr >= cfg.corr_max_x10000).then(|| PairOverLimit {
                    candidate: c.symbol.to_string(),
                    member: m.symbol.to_string(),
                    corr_x10000: corr,
                    action: "REJECT",
                })
            })
            .collect();
        if collisions.is_empty() {
            let mut reasons = vec![ReasonCode::TopkSelected];
            if guard.contains(c.symbol) {
                reasons.push(ReasonCode::TopkChurnGuardKept);
            }
            outcome.entries.push(TopKEntry {
                symbol: c.symbol.to_string(),
                score_x10000: c.score_x10000,
                selected: true,
                reasons,
            });
            admitted.push(c);
        } else {
            debug!(symbol = c.symbol, collisions = collisions.len(), "top-k correlation reject");
            outcome.entries.push(TopKEntry {
                symbol: c.symbol.to_string(),
                score_x10000: c.score_x10000,
                selected: false,
                reasons: vec![ReasonCode::TopkCorrLimit],
            });
            outcome.pairs_over_limit.extend(collisions);
        }
    }
    outcome
}
