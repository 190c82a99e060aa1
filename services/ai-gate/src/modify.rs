//! Monotone modify policy
//!
//! A modification may only make the entry less aggressive, smaller and
//! better protected. Every rule is checked and all violations are reported
//! together.

use crate::error::{AiGateError, GateResult};
use common::ReasonCode;
use common::decimal::parse_decimal;
use common::model::decision::{Decision, EntryPlan, ExitPlan, Side};
use common::reason::push_unique;
use rust_decimal::Decimal;
use std::cmp::Ordering;

struct Violations(Vec<String>);

impl Violations {
    fn check(&mut self, ok: bool, rule: &str) {
        if !ok {
            self.0.push(rule.to_string());
        }
    }

    /// `modified` compared to `original` must not be `forbidden`
    fn price(&mut self, original: &str, modified: &str, forbidden: Ordering, rule: &str) {
        match (parse_decimal(original), parse_decimal(modified)) {
            (Ok(o), Ok(m)) => self.check(m.cmp(&o) != forbidden, rule),
            _ => self.0.push(format!("{rule}: unparsable price")),
        }
    }
}

/// Direction in which a BUY-side price may not move; mirrored for SELL
fn away(side: Side, buy: Ordering) -> Ordering {
    match side {
        Side::Buy => buy,
        Side::Sell => buy.reverse(),
    }
}

fn check_entry(v: &mut Violations, side: Side, o: &EntryPlan, m: &EntryPlan) {
    // the advisor may not choose ids; `apply_modify` derives them from the new intent
    v.check(m.client_order_id == o.client_order_id, "entry.client_order_id is immutable");
    v.check(
        m.kind.aggressiveness() <= o.kind.aggressiveness(),
        "entry.kind may not become more aggressive",
    );
    match (parse_decimal(&o.qty), parse_decimal(&m.qty)) {
        (Ok(oq), Ok(mq)) => v.check(mq <= oq && mq > Decimal::ZERO, "entry.qty may only decrease"),
        _ => v.0.push("entry.qty: unparsable".into()),
    }
    v.price(&o.limit_price, &m.limit_price, away(side, Ordering::Greater), "entry.limit_price may not chase");
    v.price(&o.desired_price, &m.desired_price, away(side, Ordering::Greater), "entry.desired_price may not chase");
    v.check(m.max_reprices <= o.max_reprices, "entry.max_reprices may only decrease");
    v.check(m.ttl_ms <= o.ttl_ms, "entry.ttl_ms may only decrease");
    v.check(m.reprice_ms >= o.reprice_ms, "entry.reprice_ms may only increase");

    let (of, mf) = (&o.fallback, &m.fallback);
    if mf.enabled {
        v.check(of.enabled, "fallback may not be enabled");
        if of.enabled {
            v.check(mf.max_slippage_bps <= of.max_slippage_bps, "fallback.max_slippage_bps may only decrease");
            v.check(mf.deadline_ms <= of.deadline_ms, "fallback.deadline_ms may only decrease");
            v.check(
                mf.kind.aggressiveness() <= of.kind.aggressiveness(),
                "fallback.kind may not become more aggressive",
            );
        }
    }
}

fn check_exit(v: &mut Violations, side: Side, o: &ExitPlan, m: &ExitPlan) {
    v.check(m.tp_client_order_id == o.tp_client_order_id, "exit.tp_client_order_id is immutable");
    v.check(m.sl_client_order_id == o.sl_client_order_id, "exit.sl_client_order_id is immutable");
    v.check(m.protection == o.protection, "exit.protection is immutable");
    // SL may only tighten toward the entry, TP may only come closer
    v.price(&o.sl_price, &m.sl_price, away(side, Ordering::Less), "exit.sl_price may not widen");
    v.price(&o.tp_price, &m.tp_price, away(side, Ordering::Greater), "exit.tp_price may not move away");
    v.check(
        m.trailing.mode.aggressiveness() <= o.trailing.mode.aggressiveness(),
        "exit.trailing may not become more aggressive",
    );
    v.check(m.trailing.delta_bips <= o.trailing.delta_bips, "exit.trailing.delta_bips may only decrease");
}

/// Check every monotone rule of `modified` against `original`
///
/// # Errors
///
/// Returns `ModifyInvalid` listing each violated rule.
pub fn check_modify(original: &Decision, modified: &Decision) -> GateResult<()> {
    let mut v = Violations(Vec::new());
    v.check(modified.mode == original.mode, "mode is immutable");
    v.check(modified.symbol == original.symbol, "symbol is immutable");
    v.check(modified.side == original.side, "side is immutable");
    v.check(modified.intent == original.intent, "intent is immutable");
    v.check(modified.snapshot_id == original.snapshot_id, "snapshot_id is immutable");
    v.check(modified.cycle_id == original.cycle_id, "cycle_id is immutable");
    v.check(modified.constraints == original.constraints, "constraints are immutable");

    match (&original.entry, &modified.entry) {
        (Some(o), Some(m)) => check_entry(&mut v, original.side, o, m),
        (None, None) => {}
        _ => v.0.push("entry plan may not be added or removed".into()),
    }
    match (&original.exit, &modified.exit) {
        (Some(o), Some(m)) => check_exit(&mut v, original.side, o, m),
        (None, None) => {}
        _ => v.0.push("exit plan may not be added or removed".into()),
    }

    if v.0.is_empty() {
        Ok(())
    } else {
        Err(AiGateError::ModifyInvalid(v.0.join("; ")))
    }
}

/// The decision that replaces `original` once `modified` passes the policy
///
/// Identity, scores and timestamps stay with the original; plans come from
/// the modification. A changed quantity or price is a different order
/// intent, so the entry, TP and SL client ids are derived again from the new
/// intent id: the ids the advisor echoed back belong to the original intent
/// and would let the exchange dedup the modified order against it. The
/// decision is then re-sealed.
///
/// # Errors
///
/// Returns `ModifyInvalid` if a rule fails or the result does not validate.
pub fn apply_modify(original: &Decision, modified: &Decision) -> GateResult<Decision> {
    check_modify(original, modified)?;

    let mut out = original.clone();
    out.entry.clone_from(&modified.entry);
    out.exit.clone_from(&modified.exit);
    out.aigate = None;
    out.risk = None;
    push_unique(&mut out.reasons, ReasonCode::AigateModified);

    engine::assign_client_ids(&mut out).map_err(|e| AiGateError::ModifyInvalid(e.to_string()))?;
    out.seal().map_err(|e| AiGateError::ModifyInvalid(e.to_string()))?;
    out.validate().map_err(|e| AiGateError::ModifyInvalid(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::StrategyConfig;
    use common::model::decision::{EntryKind, FallbackKind, TrailingMode};
    use common::model::market::fixtures::btc_filters;
    use common::model::snapshot::fixtures::{T0, trend_snapshot};
    use engine::{Proposal, propose_entry};
    use rstest::{fixture, rstest};

    /// BUY 4.807 @ 104.00, SL 101.92, TP 108.16, virtual trailing 160 bips
    #[fixture]
    fn original() -> Decision {
        let cfg = StrategyConfig {
            pullback_max_bps: 150,
            ..StrategyConfig::default()
        };
        let constraints = btc_filters().to_constraints().unwrap();
        match propose_entry(&cfg, &trend_snapshot(), &constraints, "cyc_gate", T0).unwrap() {
            Proposal::Entry(d) => *d,
            Proposal::NoTrade { reasons, .. } => panic!("{reasons:?}"),
        }
    }

    fn entry(d: &mut Decision) -> &mut EntryPlan {
        d.entry.as_mut().unwrap()
    }

    fn exit(d: &mut Decision) -> &mut ExitPlan {
        d.exit.as_mut().unwrap()
    }

    #[rstest]
    fn test_conservative_changes_pass(original: Decision) {
        let mut m = original.clone();
        entry(&mut m).qty = "2.000".into();
        entry(&mut m).limit_price = "103.90".into();
        entry(&mut m).desired_price = "103.90".into();
        entry(&mut m).ttl_ms = 5_000;
        entry(&mut m).reprice_ms += 1_000;
        entry(&mut m).fallback.enabled = false;
        exit(&mut m).sl_price = "102.50".into();
        exit(&mut m).tp_price = "107.00".into();
        exit(&mut m).trailing.mode = TrailingMode::Off;
        exit(&mut m).trailing.trigger_price = String::new();
        exit(&mut m).trailing.delta_bips = 0;
        assert!(check_modify(&original, &m).is_ok());
    }

    #[rstest]
    #[case::bigger(|d: &mut Decision| entry(d).qty = "5.000".into(), "entry.qty")]
    #[case::chase(|d: &mut Decision| entry(d).limit_price = "104.10".into(), "entry.limit_price")]
    #[case::taker(|d: &mut Decision| entry(d).kind = EntryKind::Taker, "entry.kind")]
    #[case::more_reprices(|d: &mut Decision| entry(d).max_reprices += 1, "entry.max_reprices")]
    #[case::longer_ttl(|d: &mut Decision| entry(d).ttl_ms += 1, "entry.ttl_ms")]
    #[case::faster_reprice(|d: &mut Decision| entry(d).reprice_ms -= 1, "entry.reprice_ms")]
    #[case::market_fallback(|d: &mut Decision| entry(d).fallback.kind = FallbackKind::MarketIfAllowed, "fallback.kind")]
    #[case::longer_deadline(|d: &mut Decision| entry(d).fallback.deadline_ms += 1, "fallback.deadline_ms")]
    #[case::wider_sl(|d: &mut Decision| exit(d).sl_price = "101.00".into(), "exit.sl_price")]
    #[case::farther_tp(|d: &mut Decision| exit(d).tp_price = "110.00".into(), "exit.tp_price")]
    #[case::native_trailing(|d: &mut Decision| exit(d).trailing.mode = TrailingMode::Native, "exit.trailing")]
    #[case::symbol(|d: &mut Decision| d.symbol = "ETHUSDT".into(), "symbol")]
    #[case::client_id(|d: &mut Decision| entry(d).client_order_id = "X_".repeat(18), "entry.client_order_id")]
    #[case::constraints(|d: &mut Decision| d.constraints.min_notional = "5.00".into(), "constraints")]
    fn test_relaxations_rejected(original: Decision, #[case] change: fn(&mut Decision), #[case] rule: &str) {
        let mut m = original.clone();
        change(&mut m);
        let err = check_modify(&original, &m).unwrap_err();
        assert!(matches!(err, AiGateError::ModifyInvalid(_)));
        assert!(err.to_string().contains(rule), "{err}");
    }

    #[rstest]
    fn test_fallback_cannot_be_enabled(mut original: Decision) {
        entry(&mut original).fallback.enabled = false;
        let mut m = original.clone();
        entry(&mut m).fallback.enabled = true;
        let err = check_modify(&original, &m).unwrap_err();
        assert!(err.to_string().contains("fallback may not be enabled"));
    }

    #[rstest]
    fn test_all_violations_reported(original: Decision) {
        let mut m = original.clone();
        entry(&mut m).qty = "9.000".into();
        exit(&mut m).sl_price = "100.00".into();
        let msg = check_modify(&original, &m).unwrap_err().to_string();
        assert!(msg.contains("entry.qty") && msg.contains("exit.sl_price"), "{msg}");
    }

    #[rstest]
    fn test_apply_reseals_with_new_client_ids(original: Decision) {
        let mut m = original.clone();
        entry(&mut m).qty = "2.000".into();
        let out = apply_modify(&original, &m).unwrap();
        assert_eq!(out.entry.as_ref().unwrap().qty, "2.000");
        assert_ne!(out.decision_id, original.decision_id);
        assert_ne!(
            out.entry.as_ref().unwrap().client_order_id,
            original.entry.as_ref().unwrap().client_order_id
        );
        assert_ne!(out.exit.as_ref().unwrap().tp_client_order_id, original.exit.as_ref().unwrap().tp_client_order_id);

        // every id is the one the modified intent derives, not the echoed one
        let mut rederived = out.clone();
        engine::assign_client_ids(&mut rederived).unwrap();
        assert_eq!(rederived.entry, out.entry);
        assert_eq!(rederived.exit, out.exit);
        assert!(out.reasons.contains(&ReasonCode::AigateModified));
        assert!(out.validate().is_ok());
    }
}
