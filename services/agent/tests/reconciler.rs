//! Reconciler against the mock exchange

use common::config::{AuditConfig, ReconcileConfig};
use common::model::Side;
use common::{Clock, EventType, ManualClock, ReasonCode};
use feeds::{Balance, MockExchange, MockOp, RemoteOrder};
use monitoring::Heartbeats;
use pretty_assertions::assert_eq;
use rstest::rstest;
use rust_decimal_macros::dec;
use spot_agent::reconcile::LocalOrder;
use spot_agent::{DriftAction, LocalView, Reconciler, TrackedSymbol};
use std::sync::Arc;
use storage::audit::{count_events, count_events_with_reason};
use storage::{AuditWriter, Store};

const NOW: i64 = 1_700_000_000_000;
const RUN: &str = "run_20231114_221320_000001";
const CYC: &str = "cyc_20231114_221320_000002";

struct Harness {
    store: Store,
    audit: Arc<AuditWriter>,
    exchange: Arc<MockExchange>,
    heartbeats: Arc<Heartbeats>,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Store::open(&dir.path().join("agent.db"), 2_000).await.unwrap();
        store.migrate().await.unwrap();
        let cfg = AuditConfig {
            dir: dir.path().join("audit"),
            ..AuditConfig::default()
        };
        let audit = Arc::new(AuditWriter::spawn(store.clone(), &cfg.dir, &cfg, clock.clone()).await.unwrap());
        Self {
            store,
            audit,
            exchange: Arc::new(MockExchange::new(clock.clone())),
            heartbeats: Arc::new(Heartbeats::default()),
            clock,
            _dir: dir,
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.exchange.clone(),
            self.audit.clone(),
            self.heartbeats.clone(),
            self.clock.clone(),
            ReconcileConfig::default(),
        )
    }

    fn drift_score(&self) -> i64 {
        self.heartbeats
            .signals(self.clock.now_ms(), u64::MAX, &self.audit.stats())
            .drift_score_x10000
    }

    async fn count(&self, event: EventType, reason: ReasonCode) -> i64 {
        count_events_with_reason(&self.store, event, reason, 0, i64::MAX).await.unwrap()
    }
}

fn order(cid: &str, status: &str, list: i64) -> RemoteOrder {
    RemoteOrder {
        symbol: "BTCUSDT".into(),
        order_id: cid.trim_start_matches('x').into(),
        client_order_id: cid.into(),
        side: Side::Buy,
        status: status.into(),
        price: "30000".into(),
        orig_qty: "0.01".into(),
        executed_qty: "0".into(),
        order_list_id: list,
        time_ms: NOW,
    }
}

fn local_order(cid: &str) -> LocalOrder {
    LocalOrder {
        symbol: "BTCUSDT".into(),
        client_order_id: cid.into(),
    }
}

fn usdt(free: &str) -> Balance {
    Balance {
        asset: "USDT".into(),
        free: free.into(),
        locked: "0".into(),
    }
}

fn view(orders: &[&str], balances: Vec<Balance>) -> LocalView {
    LocalView {
        quote_asset: "USDT".into(),
        open_orders: orders.iter().map(|c| local_order(c)).collect(),
        balances,
        tracked: vec![TrackedSymbol {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            min_qty: dec!(0.001),
        }],
        touched: Default::default(),
    }
}

#[tokio::test]
async fn test_agreeing_views_are_clean() {
    let h = Harness::new().await;
    h.exchange.set_balances(vec![usdt("1000")]);
    h.exchange.insert_order(order("x1", "NEW", -1));

    let report = h
        .reconciler()
        .reconcile(RUN, CYC, &view(&["x1"], vec![usdt("1000")]))
        .await
        .unwrap();
    assert!(report.diff.is_clean(), "{:?}", report.diff);
    assert_eq!(report.action, DriftAction::None);
    assert_eq!(h.count(EventType::ReconcileDiff, ReasonCode::ReconcileOk).await, 1);
    assert_eq!(count_events(&h.store, EventType::AlertRaised, 0, i64::MAX).await.unwrap(), 0);
    assert_eq!(h.exchange.calls(MockOp::GetOrder), 0);
    h.audit.shutdown().await;
}

#[rstest]
#[case::two_orders(&["gone1"], &["extra1"], 80_000, DriftAction::Degrade)]
#[case::three_missing(&["gone1", "gone2", "gone3"], &[], 120_000, DriftAction::Pause)]
#[case::one_extra(&[], &["extra1"], 40_000, DriftAction::Degrade)]
#[tokio::test]
async fn test_order_drift_raises_alert(
    #[case] missing: &[&str],
    #[case] extra: &[&str],
    #[case] score: i64,
    #[case] action: DriftAction,
) {
    let h = Harness::new().await;
    h.exchange.set_balances(vec![usdt("1000")]);
    for cid in extra {
        h.exchange.insert_order(order(cid, "NEW", -1));
    }

    let report = h
        .reconciler()
        .reconcile(RUN, CYC, &view(missing, vec![usdt("1000")]))
        .await
        .unwrap();
    assert_eq!(report.diff.orders_missing.len(), missing.len());
    assert_eq!(report.diff.orders_extra.len(), extra.len());
    assert_eq!(report.score_x10000, score);
    assert_eq!(report.action, action);
    assert_eq!(h.drift_score(), score);

    let reason = match action {
        DriftAction::Pause => ReasonCode::DriftLimitExceeded,
        _ => ReasonCode::DriftDetected,
    };
    assert_eq!(h.count(EventType::ReconcileDiff, reason).await, 1);
    assert_eq!(h.count(EventType::AlertRaised, reason).await, 1);
    assert_eq!(h.exchange.calls(MockOp::GetOrder), u32::try_from(missing.len()).unwrap());
    h.audit.shutdown().await;
}

#[tokio::test]
async fn test_fill_explains_balance_change() {
    let h = Harness::new().await;
    // the entry filled and nothing protects it yet
    h.exchange.insert_order(order("e1", "FILLED", -1));
    h.exchange.set_balances(vec![
        usdt("700"),
        Balance {
            asset: "BTC".into(),
            free: "0.01".into(),
            locked: "0".into(),
        },
    ]);

    let report = h
        .reconciler()
        .reconcile(RUN, CYC, &view(&["e1"], vec![usdt("1000")]))
        .await
        .unwrap();
    assert!(report.diff.orders_missing.is_empty());
    assert!(report.diff.balances_mismatch.is_empty());
    assert!(report.diff.positions_side_mismatch.is_empty());
    assert_eq!(report.score_x10000, 0);
    h.audit.shutdown().await;
}

#[tokio::test]
async fn test_touched_symbol_is_not_looked_up() {
    let h = Harness::new().await;
    h.exchange.set_balances(vec![usdt("1000")]);
    let mut local = view(&["moved1"], vec![usdt("1000")]);
    local.touched.insert("BTCUSDT".into());

    let report = h.reconciler().reconcile(RUN, CYC, &local).await.unwrap();
    assert!(report.diff.is_clean());
    assert_eq!(h.exchange.calls(MockOp::GetOrder), 0);
    h.audit.shutdown().await;
}

#[tokio::test]
async fn test_failed_fetch_publishes_nothing() {
    let h = Harness::new().await;
    h.heartbeats.drift_score(40_000);
    h.exchange.push_fault(MockOp::Balances, feeds::MockFault::ServerError);

    let mut reconciler = h.reconciler();
    assert!(reconciler.reconcile(RUN, CYC, &view(&[], Vec::new())).await.is_err());
    assert_eq!(h.drift_score(), 40_000);
    assert!(reconciler.due(NOW), "a failed pass does not reset the interval");
    assert_eq!(count_events(&h.store, EventType::ReconcileDiff, 0, i64::MAX).await.unwrap(), 0);
    h.audit.shutdown().await;
}

#[tokio::test]
async fn test_interval_gates_next_pass() {
    let h = Harness::new().await;
    h.exchange.set_balances(vec![usdt("1000")]);
    let mut reconciler = h.reconciler();
    assert!(reconciler.due(NOW));

    reconciler.reconcile(RUN, CYC, &view(&[], vec![usdt("1000")])).await.unwrap();
    assert!(!reconciler.due(NOW + 29_999));
    assert!(reconciler.due(NOW + 30_000));
    h.audit.shutdown().await;
}
