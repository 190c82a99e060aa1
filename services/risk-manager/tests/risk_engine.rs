//! Risk gate verdicts over a proposed BTCUSDT entry

use common::config::{RiskConfig, StrategyConfig};
use common::model::decision::{Decision, DecisionIntent, RiskOutcome};
use common::model::market::fixtures::btc_filters;
use common::model::snapshot::Snapshot;
use common::model::snapshot::fixtures::{T0, trend_snapshot};
use common::{ErrorKind, ReasonCode};
use engine::{Proposal, propose_entry};
use pretty_assertions::assert_eq;
use risk_manager::{AccountState, ActivityMonitor, RiskEngine, SymbolPosition};
use rstest::{fixture, rstest};
use rust_decimal_macros::dec;
use std::sync::Arc;

const SYMBOL: &str = "BTCUSDT";

fn engine() -> RiskEngine {
    let cfg = RiskConfig::default();
    let monitor = Arc::new(ActivityMonitor::new(cfg.trades_window_ms));
    RiskEngine::new(cfg, monitor).unwrap()
}

/// 4.807 @ 104.00, edge 189 bps
#[fixture]
fn decision() -> Decision {
    let cfg = StrategyConfig {
        pullback_max_bps: 150,
        ..StrategyConfig::default()
    };
    let constraints = btc_filters().to_constraints().unwrap();
    match propose_entry(&cfg, &trend_snapshot(), &constraints, "cyc_risk", T0).unwrap() {
        Proposal::Entry(d) => *d,
        Proposal::NoTrade { reasons, .. } => panic!("fixture must propose an entry: {reasons:?}"),
    }
}

#[fixture]
fn snapshot() -> Snapshot {
    trend_snapshot()
}

fn funded() -> AccountState {
    AccountState {
        free_quote: dec!(1000),
        start_equity: dec!(1000),
        peak_equity: dec!(1000),
        ..AccountState::default()
    }
}

#[fixture]
fn account() -> AccountState {
    funded()
}

#[rstest]
fn test_healthy_entry_is_allowed(decision: Decision, snapshot: Snapshot, account: AccountState) {
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.verdict, RiskOutcome::Allow);
    assert_eq!(v.reasons, vec![ReasonCode::RiskAllow]);
    // ATR 200 bps is above 1.5x the normal 80 bps
    assert_eq!(v.limits.min_edge_multiplier_x10000, 13_000);
    assert_eq!(v.limits.adjusted_min_edge_bps, 26);
    assert_eq!(v.limits.symbol_exposure_after, "499.928");
    assert_eq!(v.limits.required_quote, "500.1279712");
    assert_eq!(v.limits.available_quote, "1000");
    assert_eq!(v.cost_inputs, snapshot.cost_inputs);
}

#[rstest]
fn test_every_applicable_reason_is_reported(decision: Decision, snapshot: Snapshot, mut account: AccountState) {
    account.positions.insert(
        SYMBOL.into(),
        SymbolPosition {
            exposure: dec!(0),
            position_open: true,
            entry_pending: true,
        },
    );
    account.open_orders = 10;
    account.ws_latency_ms = 2_500;
    account.unfilled_orders = 5;

    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.verdict, RiskOutcome::Block);
    assert_eq!(
        v.reasons,
        vec![
            ReasonCode::RiskPositionAlreadyOpen,
            ReasonCode::RiskEntryAlreadyPending,
            ReasonCode::RiskMaxOpenOrders,
            ReasonCode::WsOooEvent,
            ReasonCode::RiskUnfilledOrderCountRisk,
        ]
    );
    assert_eq!(v.limits.open_orders, 10);
}

#[rstest]
#[case::daily_loss(AccountState { realized_pnl_today: dec!(-30), unrealized_pnl: dec!(-20), peak_equity: dec!(950), ..funded() }, ReasonCode::RiskDailyLossLimit)]
#[case::drawdown(AccountState { peak_equity: dec!(1100), ..funded() }, ReasonCode::RiskDrawdownLimit)]
#[case::symbol_exposure(AccountState { positions: [(SYMBOL.to_string(), SymbolPosition { exposure: dec!(1), ..SymbolPosition::default() })].into_iter().collect(), ..funded() }, ReasonCode::RiskExposureLimit)]
#[case::total_exposure(AccountState { total_exposure: dec!(1100), ..funded() }, ReasonCode::RiskExposureLimit)]
#[case::free_balance(AccountState { free_quote: dec!(600), locked_quote: dec!(50), pending_reserve_quote: dec!(50), ..funded() }, ReasonCode::RiskInsufficientFreeBalance)]
fn test_account_limits(decision: Decision, snapshot: Snapshot, #[case] state: AccountState, #[case] want: ReasonCode) {
    let v = engine().evaluate(&decision, &snapshot, &state, T0);
    assert_eq!(v.verdict, RiskOutcome::Block);
    assert_eq!(v.reasons, vec![want]);
}

#[rstest]
#[case::quarantined(|s: &mut Snapshot| s.health.quarantine_until_ms = T0 + 1)]
#[case::halted(|s: &mut Snapshot| s.health.symbol_status = "BREAK".into())]
#[case::rejects(|s: &mut Snapshot| s.health.recent_rejects = 5)]
#[case::filters(|s: &mut Snapshot| s.health.filters_ok = false)]
fn test_unhealthy_symbol_is_quarantined(
    decision: Decision,
    mut snapshot: Snapshot,
    account: AccountState,
    #[case] spoil: fn(&mut Snapshot),
) {
    spoil(&mut snapshot);
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.reasons, vec![ReasonCode::SymbolQuarantined]);
}

#[rstest]
fn test_expired_quarantine_admits(decision: Decision, mut snapshot: Snapshot, account: AccountState) {
    snapshot.health.quarantine_until_ms = T0 - 1;
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert!(v.is_allowed());
}

#[rstest]
#[case::trades_window(|m: &ActivityMonitor| (1..=4).for_each(|i| m.record_entry(SYMBOL, T0 - i * 60_000)), ReasonCode::RiskMaxTradesWindow)]
#[case::cooldown(|m: &ActivityMonitor| m.record_exit(SYMBOL, dec!(-2), T0 - 1_000, 900_000), ReasonCode::RiskCooldownActive)]
#[case::loss_streak(|m: &ActivityMonitor| (1..=3).for_each(|i| m.record_exit(SYMBOL, dec!(-1), T0 - i * 60_000, 0)), ReasonCode::RiskSymbolLossStreak)]
#[case::churn(|m: &ActivityMonitor| (1..=6).for_each(|i| m.record_churn(SYMBOL, T0 - i * 1_000)), ReasonCode::RiskChurnLimitHit)]
#[case::cancel_replace(|m: &ActivityMonitor| (1..=20).for_each(|i| m.record_cancel_replace(SYMBOL, T0 - i * 1_000)), ReasonCode::RiskCancelReplaceLimitHit)]
#[case::rejects(|m: &ActivityMonitor| (1..=5).for_each(|i| m.record_reject(SYMBOL, T0 - i * 1_000)), ReasonCode::SymbolQuarantined)]
fn test_activity_limits(
    decision: Decision,
    snapshot: Snapshot,
    account: AccountState,
    #[case] history: fn(&ActivityMonitor),
    #[case] want: ReasonCode,
) {
    let risk = engine();
    history(risk.monitor());
    let v = risk.evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.reasons, vec![want]);
}

#[rstest]
fn test_activity_on_other_symbol_does_not_block(decision: Decision, snapshot: Snapshot, account: AccountState) {
    let risk = engine();
    risk.monitor().record_exit("ETHUSDT", dec!(-5), T0 - 1_000, 900_000);
    (1..=6).for_each(|i| risk.monitor().record_churn("ETHUSDT", T0 - i * 1_000));
    assert!(risk.evaluate(&decision, &snapshot, &account, T0).is_allowed());
}

#[rstest]
fn test_edge_below_adaptive_minimum(mut decision: Decision, mut snapshot: Snapshot, account: AccountState) {
    decision.expected_edge_bps = 25;
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.reasons, vec![ReasonCode::StratEdgeBelowMin]);

    // Calm volatility drops the minimum back to the 20 bps base
    snapshot.volatility.atr14_5m_bps = 100;
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert!(v.is_allowed());
    assert_eq!(v.limits.adjusted_min_edge_bps, 20);
}

#[rstest]
fn test_negative_costs_are_invalid_input(decision: Decision, mut snapshot: Snapshot, account: AccountState) {
    snapshot.cost_inputs.slippage_exit_taker_bps = -1;
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.reasons, vec![ReasonCode::StratInputInvalid]);
}

#[rstest]
fn test_tiny_entry_below_min_notional(mut decision: Decision, snapshot: Snapshot, account: AccountState) {
    if let Some(e) = decision.entry.as_mut() {
        e.qty = "0.050".into();
    }
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.reasons, vec![ReasonCode::ProtectionInvalidMinNotional]);
}

#[rstest]
fn test_non_entry_passes_through(mut decision: Decision, snapshot: Snapshot, mut account: AccountState) {
    decision.intent = DecisionIntent::Exit;
    account.free_quote = dec!(0);
    let v = engine().evaluate(&decision, &snapshot, &account, T0);
    assert_eq!(v.verdict, RiskOutcome::Allow);
    assert_eq!(v.reasons, vec![ReasonCode::RiskNotEntry]);
}

#[test]
fn test_multiplier_ceiling_below_unit_is_rejected() {
    let cfg = RiskConfig {
        adaptive_max_multiplier_x10000: 9_000,
        ..RiskConfig::default()
    };
    let err = RiskEngine::new(cfg, Arc::new(ActivityMonitor::new(1))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}
