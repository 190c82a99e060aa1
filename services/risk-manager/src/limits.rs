//! Adaptive minimum-edge threshold
//!
//! The base `min_edge_bps` is scaled up when the book looks worse than
//! usual. Each trigger raises the multiplier to at least its floor:
//! - wide spread against the 60s median: 1.2x
//! - ATR above the normal level: 1.3x
//! - thin bid side: 1.4x
//!
//! The result is clamped to the configured ceiling.

use common::config::RiskConfig;
use common::model::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

/// Neutral multiplier
pub const UNIT_X10000: i64 = 10_000;
/// Floor when the current spread is wide
pub const SPREAD_MULTIPLIER_X10000: i64 = 12_000;
/// Floor when volatility is elevated
pub const VOLATILITY_MULTIPLIER_X10000: i64 = 13_000;
/// Floor when liquidity is thin
pub const LIQUIDITY_MULTIPLIER_X10000: i64 = 14_000;

/// Outcome of the adaptive scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeThreshold {
    /// Unscaled minimum
    pub base_bps: i64,
    /// Applied multiplier
    pub multiplier_x10000: i64,
    /// Minimum the entry must clear
    pub adjusted_bps: i64,
}

/// `value * factor / 10000`, rounded half to even
#[must_use]
pub fn scale_x10000(value: i64, factor_x10000: i64) -> i64 {
    let n = i128::from(value) * i128::from(factor_x10000);
    let d = i128::from(UNIT_X10000);
    let q = n.div_euclid(d);
    let r = n.rem_euclid(d);
    let rounded = match (2 * r).cmp(&d) {
        std::cmp::Ordering::Less => q,
        std::cmp::Ordering::Greater => q + 1,
        std::cmp::Ordering::Equal => q + (q & 1),
    };
    i64::try_from(rounded).unwrap_or(if rounded > 0 { i64::MAX } else { i64::MIN })
}

/// Scale the configured minimum edge by current market conditions
#[must_use]
pub fn adaptive_min_edge(cfg: &RiskConfig, snapshot: &Snapshot) -> EdgeThreshold {
    let micro = &snapshot.micro_60s;
    let mut m = UNIT_X10000;

    if micro.spread_current_bps > scale_x10000(micro.spread_bps_p50_60s, cfg.adaptive_spread_factor_x10000) {
        m = m.max(SPREAD_MULTIPLIER_X10000);
    }
    if snapshot.volatility.atr14_5m_bps > scale_x10000(cfg.normal_atr_bps, cfg.adaptive_vol_factor_x10000) {
        m = m.max(VOLATILITY_MULTIPLIER_X10000);
    }
    if micro.bid_ask_imbalance_p50_10s_x10000 < cfg.adaptive_liquidity_floor_x10000 {
        m = m.max(LIQUIDITY_MULTIPLIER_X10000);
    }
    let m = m.min(cfg.adaptive_max_multiplier_x10000);

    EdgeThreshold {
        base_bps: cfg.min_edge_bps,
        multiplier_x10000: m,
        adjusted_bps: scale_x10000(cfg.min_edge_bps, m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::snapshot::fixtures::trend_snapshot;
    use rstest::rstest;

    #[rstest]
    #[case(2, 15_000, 3)]
    #[case(5, 15_000, 8)] // 7.5 rounds to even
    #[case(7, 15_000, 10)] // 10.5 rounds to even
    #[case(80, 15_000, 120)]
    #[case(-3, 15_000, -4)] // -4.5 rounds to even
    fn test_scale_rounds_half_even(#[case] v: i64, #[case] f: i64, #[case] want: i64) {
        assert_eq!(scale_x10000(v, f), want);
    }

    #[test]
    fn test_calm_market_keeps_base() {
        let mut s = trend_snapshot();
        s.volatility.atr14_5m_bps = 100;
        let t = adaptive_min_edge(&RiskConfig::default(), &s);
        assert_eq!(t.multiplier_x10000, UNIT_X10000);
        assert_eq!(t.adjusted_bps, 20);
    }

    #[test]
    fn test_highest_trigger_wins() {
        let mut s = trend_snapshot();
        s.micro_60s.spread_current_bps = 10;
        s.micro_60s.bid_ask_imbalance_p50_10s_x10000 = 1_000;
        // ATR 200 > 120 as well
        let t = adaptive_min_edge(&RiskConfig::default(), &s);
        assert_eq!(t.multiplier_x10000, LIQUIDITY_MULTIPLIER_X10000);
        assert_eq!(t.adjusted_bps, 28);
    }

    #[test]
    fn test_multiplier_clamped_to_ceiling() {
        let mut s = trend_snapshot();
        s.micro_60s.bid_ask_imbalance_p50_10s_x10000 = 0;
        let cfg = RiskConfig {
            adaptive_max_multiplier_x10000: 11_000,
            ..RiskConfig::default()
        };
        let t = adaptive_min_edge(&cfg, &s);
        assert_eq!(t.multiplier_x10000, 11_000);
        assert_eq!(t.adjusted_bps, 22);
    }
}
