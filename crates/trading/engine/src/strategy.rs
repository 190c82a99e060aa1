//! Regime-aware pullback entries with ATR-scaled exits
//!
//! One proposal per watchlist snapshot. A symbol either yields a sealed ENTRY
//! [`Decision`] or a [`Proposal::NoTrade`] carrying the precise reasons. Only
//! BUY entries are proposed; spot positions are closed by their protective
//! exits.

use crate::error::EngineResult;
use crate::indicators::{ema, round_even, to_bps};
use common::config::StrategyConfig;
use common::decimal::{format_with_places, parse_decimal, parse_step, quantize_down_dec};
use common::ids::{IntentVariant, client_order_id};
use common::model::intent::order_intent_id;
use common::model::{
    Candle, Decision, DecisionConstraints, DecisionIntent, EntryKind, EntryPlan, ExitPlan,
    FallbackKind, FallbackPlan, ProtectionMode, RegimeLabel, Side, Snapshot, TimeInForce,
    TrailingMode, TrailingPlan,
};
use common::{MODE_LIVE, ReasonCode, Stage};
use rust_decimal::Decimal;
use tracing::debug;

/// Outcome of proposing for one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// Sealed ENTRY decision
    Entry(Box<Decision>),
    /// No entry, with every reason that applied
    NoTrade {
        /// Symbol
        symbol: String,
        /// Why
        reasons: Vec<ReasonCode>,
    },
}

impl Proposal {
    fn no_trade(snapshot: &Snapshot, reasons: Vec<ReasonCode>) -> Self {
        debug!(symbol = %snapshot.symbol, ?reasons, "no entry proposed");
        Self::NoTrade {
            symbol: snapshot.symbol.clone(),
            reasons,
        }
    }

    /// The decision, if any
    #[must_use]
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Entry(d) => Some(d),
            Self::NoTrade { .. } => None,
        }
    }
}

/// ATR multiples for one regime
#[derive(Debug, Clone, Copy)]
struct ExitMultiples {
    sl: f64,
    tp: f64,
    trailing: f64,
}

/// Distances in bps derived from ATR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDistances {
    /// Stop-loss distance
    pub sl_bps: i64,
    /// Take-profit distance
    pub tp_bps: i64,
    /// Trailing distance
    pub trailing_bps: i64,
}

/// TP minus SL minus fees, slippage both ways, current spread and widening
#[must_use]
pub fn expected_edge_bps(snapshot: &Snapshot, exits: &ExitDistances) -> i64 {
    let c = &snapshot.cost_inputs;
    let m = &snapshot.micro_60s;
    exits.tp_bps
        - exits.sl_bps
        - (c.maker_fee_bps
            + c.taker_fee_bps
            + c.slippage_entry_maker_bps
            + c.slippage_exit_taker_bps
            + m.spread_current_bps
            + m.delta_spread_bps_p90_10s.max(0))
}

fn conviction_x10000(cfg: &StrategyConfig, snapshot: &Snapshot) -> Option<i64> {
    let r = &snapshot.regime;
    match r.label {
        RegimeLabel::Trend if r.trend_score_x10000 >= cfg.trend_threshold_x10000 => Some(r.trend_score_x10000),
        RegimeLabel::Range if r.range_score_x10000 >= cfg.range_threshold_x10000 => {
            Some(round_even(r.range_score_x10000 as f64 * 0.7))
        }
        _ => None,
    }
}

/// Distance of `price` from the EMA of 5m closes, in bps
///
/// Positive when price sits above the EMA.
fn pullback_bps(candles: &[Candle], period: usize, price: f64) -> Option<i64> {
    let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
    let e = ema(&closes, period)?;
    Some(to_bps(price - e, e))
}

/// Latest 5m volume over the mean of the `lookback - 1` before it
fn volume_ratio(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback < 2 || candles.len() < lookback {
        return None;
    }
    let tail = &candles[candles.len() - lookback..];
    let (prior, current) = tail.split_at(lookback - 1);
    let mean = prior.iter().map(Candle::volume_f64).sum::<f64>() / prior.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    Some(current[0].volume_f64() / mean)
}

fn scale_bps(price: Decimal, bps: i64) -> Decimal {
    price * (Decimal::from(10_000 + bps)) / Decimal::from(10_000)
}

/// Propose at most one BUY entry for `snapshot`
pub fn propose_entry(
    cfg: &StrategyConfig,
    snapshot: &Snapshot,
    constraints: &DecisionConstraints,
    cycle_id: &str,
    now_ms: i64,
) -> EngineResult<Proposal> {
    if !snapshot.cost_inputs.is_valid() || snapshot.volatility.atr14_5m_bps <= 0 {
        return Ok(Proposal::no_trade(snapshot, vec![ReasonCode::StratInputInvalid]));
    }
    let Some(conviction) = conviction_x10000(cfg, snapshot) else {
        return Ok(Proposal::no_trade(snapshot, vec![ReasonCode::StratRegimeWeak]));
    };
    let is_trend = snapshot.regime.label == RegimeLabel::Trend;

    let tick = parse_step(&constraints.tick_size)?;
    let step = parse_step(&constraints.step_size)?;
    let best_bid = parse_decimal(&snapshot.prices.best_bid)?;
    let limit = quantize_down_dec(best_bid, tick)?;
    let limit_f64 = snapshot.prices.best_bid.parse::<f64>().unwrap_or(0.0);

    let m = &snapshot.micro_60s;
    let mut reasons = Vec::new();
    match pullback_bps(&snapshot.candles_5m, cfg.ema_period, limit_f64) {
        // Trend entries buy above a rising mean, range entries below it
        Some(p) => {
            let distance = if is_trend { p } else { -p };
            if !(cfg.pullback_min_bps..=cfg.pullback_max_bps).contains(&distance) {
                reasons.push(ReasonCode::StratPullbackOutOfBand);
            }
        }
        None => reasons.push(ReasonCode::StratInputInvalid),
    }
    if m.spread_current_bps > cfg.max_spread_entry_bps {
        reasons.push(ReasonCode::StratSpreadTooWide);
    }
    if m.delta_spread_bps_p90_10s > cfg.max_delta_spread_bps_10s {
        reasons.push(ReasonCode::StratSpreadWidening);
    }
    if m.bid_ask_imbalance_p50_10s_x10000 < cfg.min_imbalance_buy_x10000 {
        reasons.push(ReasonCode::StratImbalanceLow);
    }
    if volume_ratio(&snapshot.candles_5m, cfg.volume_lookback).is_none_or(|r| r < cfg.min_volume_ratio) {
        reasons.push(ReasonCode::StratVolumeLow);
    }
    if !reasons.is_empty() {
        return Ok(Proposal::no_trade(snapshot, reasons));
    }

    let mult = if is_trend {
        ExitMultiples {
            sl: cfg.trend_sl_atr_mult,
            tp: cfg.trend_tp_atr_mult,
            trailing: cfg.trend_trailing_atr_mult,
        }
    } else {
        ExitMultiples {
            sl: cfg.range_sl_atr_mult,
            tp: cfg.range_tp_atr_mult,
            trailing: cfg.range_trailing_atr_mult,
        }
    };
    let atr = snapshot.volatility.atr14_5m_bps as f64;
    let exits = ExitDistances {
        sl_bps: round_even(mult.sl * atr),
        tp_bps: round_even(mult.tp * atr),
        trailing_bps: round_even(mult.trailing * atr),
    };
    if !(exits.tp_bps > exits.sl_bps && exits.sl_bps > 0) || exits.sl_bps >= 10_000 {
        return Ok(Proposal::no_trade(snapshot, vec![ReasonCode::StratExitInvalid]));
    }

    let edge = expected_edge_bps(snapshot, &exits);
    let min_edge = if is_trend { cfg.min_edge_bps } else { cfg.min_edge_bps * 3 / 2 };
    if edge < min_edge {
        return Ok(Proposal::no_trade(snapshot, vec![ReasonCode::StratEdgeBelowMin]));
    }

    let sl_price = quantize_down_dec(scale_bps(limit, -exits.sl_bps), tick)?;
    let tp_price = quantize_down_dec(scale_bps(limit, exits.tp_bps), tick)?;
    if !(tp_price > limit && limit > sl_price && sl_price > Decimal::ZERO) {
        return Ok(Proposal::no_trade(snapshot, vec![ReasonCode::StratExitInvalid]));
    }

    // Risk budget over the stop distance gives the notional
    let notional = cfg.risk_per_trade_usdt * Decimal::from(10_000) / Decimal::from(exits.sl_bps);
    let max_qty = parse_decimal(&constraints.max_qty)?;
    let mut qty = quantize_down_dec(notional / limit, step)?;
    if max_qty > Decimal::ZERO && qty > max_qty {
        qty = quantize_down_dec(max_qty, step)?;
    }
    let min_qty = parse_decimal(&constraints.min_qty)?;
    let min_notional = parse_decimal(&constraints.min_notional)?;
    if qty.is_zero() || qty < min_qty || qty * limit < min_notional {
        return Ok(Proposal::no_trade(snapshot, vec![ReasonCode::StratSizeTooSmall]));
    }

    let mut reasons = vec![if is_trend {
        ReasonCode::StratEntryPullbackTrend
    } else {
        ReasonCode::StratEntryPullbackRange
    }];

    let ttl_ms = cfg.maker_ttl_ms;
    let fallback = if m.spread_current_bps <= cfg.fallback_max_spread_bps
        && snapshot.cost_inputs.slippage_entry_taker_bps <= cfg.fallback_max_slippage_bps
        && edge >= cfg.fallback_min_edge_bps
    {
        reasons.push(ReasonCode::StratFallbackEnabled);
        FallbackPlan {
            enabled: true,
            kind: FallbackKind::CancelAndReplace,
            max_slippage_bps: cfg.fallback_max_slippage_bps,
            deadline_ms: ttl_ms * (cfg.max_reprices + 1),
        }
    } else {
        FallbackPlan::disabled()
    };

    let pp = constraints.price_precision;
    let trailing = if is_trend
        && snapshot.regime.trend_score_x10000 >= cfg.trailing_min_trend_score_x10000
        && m.spread_current_bps <= cfg.trailing_max_spread_bps
    {
        reasons.push(ReasonCode::StratTrailingArmed);
        let trigger = quantize_down_dec(scale_bps(limit, cfg.trailing_enable_profit_bps), tick)?;
        let (mode, delta_bips) = match constraints.trailing_delta.filter(|_| cfg.trailing_native) {
            Some(f) => {
                let step = f.step_bips.max(1);
                let clamped = exits.trailing_bps.clamp(f.min_bips, f.max_bips);
                (TrailingMode::Native, (clamped / step * step).max(1))
            }
            None => (TrailingMode::Virtual, exits.trailing_bps.max(1)),
        };
        TrailingPlan {
            mode,
            trigger_price: format_with_places(trigger, pp),
            delta_bips,
        }
    } else {
        TrailingPlan::off()
    };

    let limit_str = format_with_places(limit, pp);
    let mut decision = Decision {
        mode: MODE_LIVE.to_string(),
        ts_ms: now_ms,
        symbol: snapshot.symbol.clone(),
        side: Side::Buy,
        intent: DecisionIntent::Entry,
        entry: Some(EntryPlan {
            kind: EntryKind::MakerFirst,
            desired_price: limit_str.clone(),
            limit_price: limit_str,
            qty: format_with_places(qty, constraints.qty_precision),
            time_in_force: TimeInForce::Gtc,
            ttl_ms,
            reprice_ms: cfg.maker_reprice_ms,
            max_reprices: cfg.max_reprices,
            client_order_id: String::new(),
            fallback,
        }),
        exit: Some(ExitPlan {
            tp_price: format_with_places(tp_price, pp),
            sl_price: format_with_places(sl_price, pp),
            protection: ProtectionMode::Oco,
            trailing,
            tp_client_order_id: String::new(),
            sl_client_order_id: String::new(),
        }),
        edge_score_x10000: conviction.clamp(0, 10_000),
        expected_edge_bps: edge,
        reasons,
        snapshot_id: snapshot.meta.snapshot_id.clone(),
        snapshot_hash: snapshot.meta.snapshot_hash.clone(),
        decision_id: String::new(),
        cycle_id: cycle_id.to_string(),
        stage: Stage::StrategyPropose,
        constraints: constraints.clone(),
        aigate: None,
        risk: None,
    };
    assign_client_ids(&mut decision)?;
    decision.seal()?;
    decision.validate()?;
    debug!(
        symbol = %decision.symbol,
        decision_id = %decision.decision_id,
        edge_bps = edge,
        "entry proposed"
    );
    Ok(Proposal::Entry(Box::new(decision)))
}

/// Derive the entry, TP and SL client ids from the decision's intent id
///
/// The intent id ignores client ids, so this is stable under re-derivation
/// and must run again whenever price or quantity change.
pub fn assign_client_ids(decision: &mut Decision) -> EngineResult<()> {
    let intent_id = order_intent_id(decision)?;
    if let Some(entry) = decision.entry.as_mut() {
        entry.client_order_id = client_order_id(&intent_id);
    }
    if let Some(exit) = decision.exit.as_mut() {
        exit.tp_client_order_id = client_order_id(&IntentVariant::TakeProfit.intent_id(&intent_id));
        exit.sl_client_order_id = client_order_id(&IntentVariant::StopLoss.intent_id(&intent_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ids::CLIENT_ORDER_ID_LEN;
    use common::model::market::fixtures::btc_filters;
    use common::model::snapshot::fixtures::{T0, trend_snapshot};
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    /// Fixture closes sit about 1% above their EMA; widen the band to admit them
    #[fixture]
    fn cfg() -> StrategyConfig {
        StrategyConfig {
            pullback_max_bps: 150,
            ..StrategyConfig::default()
        }
    }

    #[fixture]
    fn constraints() -> DecisionConstraints {
        btc_filters().to_constraints().unwrap()
    }

    fn entry(p: Proposal) -> Decision {
        match p {
            Proposal::Entry(d) => *d,
            Proposal::NoTrade { reasons, .. } => panic!("expected an entry, got {reasons:?}"),
        }
    }

    fn reasons(p: Proposal) -> Vec<ReasonCode> {
        match p {
            Proposal::NoTrade { reasons, .. } => reasons,
            Proposal::Entry(d) => panic!("expected no trade, got {}", d.decision_id),
        }
    }

    #[rstest]
    fn test_decision_id_is_deterministic(cfg: StrategyConfig, constraints: DecisionConstraints) {
        let snapshot = trend_snapshot();
        let a = entry(propose_entry(&cfg, &snapshot, &constraints, "cyc_test", T0).unwrap());
        let b = entry(propose_entry(&cfg, &snapshot, &constraints, "cyc_test", T0).unwrap());
        assert_eq!(a.decision_id, b.decision_id);
        assert!(a.decision_id.starts_with("dec_"));

        let e = a.entry.as_ref().unwrap();
        assert_eq!(e.client_order_id.len(), CLIENT_ORDER_ID_LEN);
        assert_eq!(e.client_order_id, client_order_id(&order_intent_id(&a).unwrap()));
        let x = a.exit.as_ref().unwrap();
        assert_ne!(x.tp_client_order_id, x.sl_client_order_id);
        assert_eq!(x.tp_client_order_id.len(), CLIENT_ORDER_ID_LEN);
    }

    #[rstest]
    fn test_trend_entry_prices_and_size(cfg: StrategyConfig, constraints: DecisionConstraints) {
        let d = entry(propose_entry(&cfg, &trend_snapshot(), &constraints, "cyc_test", T0).unwrap());
        let e = d.entry.as_ref().unwrap();
        let x = d.exit.as_ref().unwrap();
        assert_eq!(e.limit_price, "104.00");
        // SL 200 bps, TP 400 bps below and above 104.00
        assert_eq!(x.sl_price, "101.92");
        assert_eq!(x.tp_price, "108.16");
        // 10 USDT over 200 bps is 500 USDT of notional
        assert_eq!(e.qty, "4.807");
        // 400 - 200 - (2 + 4 + 1 + 2 + 2 + 0)
        assert_eq!(d.expected_edge_bps, 189);
        assert_eq!(d.edge_score_x10000, 8_000);
        assert_eq!(e.kind, EntryKind::MakerFirst);
        assert_eq!(e.fallback.deadline_ms, 45_000);
        assert_eq!(x.trailing.mode, TrailingMode::Virtual);
        assert_eq!(x.trailing.trigger_price, "104.52");
        assert_eq!(x.trailing.delta_bips, 160);
        assert_eq!(
            d.reasons,
            vec![
                ReasonCode::StratEntryPullbackTrend,
                ReasonCode::StratFallbackEnabled,
                ReasonCode::StratTrailingArmed,
            ]
        );
    }

    #[rstest]
    fn test_native_trailing_respects_filter(constraints: DecisionConstraints) {
        let cfg = StrategyConfig {
            pullback_max_bps: 150,
            trailing_native: true,
            ..StrategyConfig::default()
        };
        let d = entry(propose_entry(&cfg, &trend_snapshot(), &constraints, "cyc_test", T0).unwrap());
        let t = &d.exit.as_ref().unwrap().trailing;
        assert_eq!(t.mode, TrailingMode::Native);
        assert_eq!(t.delta_bips, 160);
    }

    #[rstest]
    fn test_unclear_regime_is_weak(cfg: StrategyConfig, constraints: DecisionConstraints) {
        let mut s = trend_snapshot();
        s.regime.label = RegimeLabel::Unclear;
        assert_eq!(
            reasons(propose_entry(&cfg, &s, &constraints, "cyc_test", T0).unwrap()),
            vec![ReasonCode::StratRegimeWeak]
        );
    }

    #[rstest]
    fn test_gates_report_every_failure(cfg: StrategyConfig, constraints: DecisionConstraints) {
        let mut s = trend_snapshot();
        s.micro_60s.spread_current_bps = 25;
        s.micro_60s.delta_spread_bps_p90_10s = 9;
        s.micro_60s.bid_ask_imbalance_p50_10s_x10000 = 1_000;
        assert_eq!(
            reasons(propose_entry(&cfg, &s, &constraints, "cyc_test", T0).unwrap()),
            vec![
                ReasonCode::StratSpreadTooWide,
                ReasonCode::StratSpreadWidening,
                ReasonCode::StratImbalanceLow,
            ]
        );
    }

    #[rstest]
    fn test_default_band_rejects_extended_price(constraints: DecisionConstraints) {
        let p = propose_entry(&StrategyConfig::default(), &trend_snapshot(), &constraints, "cyc_test", T0).unwrap();
        assert_eq!(reasons(p), vec![ReasonCode::StratPullbackOutOfBand]);
    }

    #[rstest]
    fn test_thin_volume_rejected(cfg: StrategyConfig, constraints: DecisionConstraints) {
        let mut s = trend_snapshot();
        if let Some(last) = s.candles_5m.last_mut() {
            last.volume = "2.0".into();
        }
        assert_eq!(
            reasons(propose_entry(&cfg, &s, &constraints, "cyc_test", T0).unwrap()),
            vec![ReasonCode::StratVolumeLow]
        );
    }

    #[rstest]
    fn test_low_atr_edge_below_min(cfg: StrategyConfig, constraints: DecisionConstraints) {
        let mut s = trend_snapshot();
        s.volatility.atr14_5m_bps = 25;
        // 50 - 25 - 11
        assert_eq!(
            reasons(propose_entry(&cfg, &s, &constraints, "cyc_test", T0).unwrap()),
            vec![ReasonCode::StratEdgeBelowMin]
        );
    }

    #[rstest]
    fn test_tiny_budget_is_too_small(constraints: DecisionConstraints) {
        let cfg = StrategyConfig {
            pullback_max_bps: 150,
            risk_per_trade_usdt: Decimal::new(1, 1),
            ..StrategyConfig::default()
        };
        assert_eq!(
            reasons(propose_entry(&cfg, &trend_snapshot(), &constraints, "cyc_test", T0).unwrap()),
            vec![ReasonCode::StratSizeTooSmall]
        );
    }
}
