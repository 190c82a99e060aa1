//! Executor, entry manager and startup recovery against the scripted exchange

use common::config::{AuditConfig, ExecutorConfig, StrategyConfig};
use common::model::decision::Decision;
use common::model::market::fixtures::btc_filters;
use common::model::snapshot::fixtures::{T0, trend_snapshot};
use common::model::{DecisionConstraints, IntentState, OrderIntent};
use common::ManualClock;
use engine::{Proposal, propose_entry};
use feeds::{ExchangeRest, MockExchange, MockFault, MockOp};
use oms::order::cancel_intent;
use oms::{
    EntryAction, EntryManager, Executor, IntentJournal, IntentPayload, IntentScope, OmsError, ResolverPool,
    StartupRecovery, entry_intent,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use storage::{AuditWriter, IntentLedger, RedactionPolicy, Store};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SCOPE: IntentScope<'static> = IntentScope {
    run_id: "run_test",
    cycle_id: "cyc_test",
};

struct Harness {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    exchange: Arc<MockExchange>,
    executor: Arc<Executor>,
}

async fn harness(cfg: ExecutorConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("agent.db"), 2_000).await.unwrap();
    store.migrate().await.unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let audit_cfg = AuditConfig {
        dir: dir.path().join("audit"),
        ..AuditConfig::default()
    };
    let audit = AuditWriter::spawn(store.clone(), &audit_cfg.dir, &audit_cfg, clock.clone())
        .await
        .unwrap();
    let journal = IntentJournal::new(
        IntentLedger::new(store),
        Arc::new(audit),
        RedactionPolicy::default(),
        clock.clone(),
    );
    let exchange = Arc::new(MockExchange::new(clock.clone()));
    let executor = Arc::new(Executor::new(exchange.clone(), journal, cfg));
    Harness {
        _dir: dir,
        clock,
        exchange,
        executor,
    }
}

fn constraints() -> DecisionConstraints {
    btc_filters().to_constraints().unwrap()
}

fn decision() -> Decision {
    let cfg = StrategyConfig {
        pullback_max_bps: 150,
        ..StrategyConfig::default()
    };
    match propose_entry(&cfg, &trend_snapshot(), &constraints(), "cyc_test", T0).unwrap() {
        Proposal::Entry(d) => *d,
        Proposal::NoTrade { reasons, .. } => panic!("no entry: {reasons:?}"),
    }
}

fn intent() -> OrderIntent {
    entry_intent(SCOPE, &decision(), T0).unwrap()
}

#[tokio::test]
async fn test_submit_confirms_and_resubmit_is_idempotent() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    let cancel = CancellationToken::new();

    let first = h.executor.submit_with_intent(&oi, &cancel).await.unwrap();
    assert_eq!(first.intent.state, IntentState::Confirmed);
    assert!(!first.reused);
    assert!(first.intent.exchange_order_id.is_some());

    let second = h.executor.submit_with_intent(&oi, &cancel).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.intent.exchange_order_id, first.intent.exchange_order_id);
    assert_eq!(h.exchange.submitted().len(), 1);
}

#[tokio::test]
async fn test_timeout_then_lookup_found_on_second_call_confirms() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    h.exchange.push_fault(MockOp::NewOrder, MockFault::TimeoutAfterEffect);

    let err = h
        .executor
        .submit_with_intent(&oi, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OmsError::SentUnknown { .. }));
    let stored = h.executor.journal().ledger().get(&oi.order_intent_id).await.unwrap().unwrap();
    assert_eq!(stored.state, IntentState::SentUnknown);

    h.exchange.push_fault(MockOp::GetOrder, MockFault::NotFound);
    let resolved = h.executor.resolve_sent_unknown(&stored).await.unwrap();
    assert_eq!(resolved.state, IntentState::Confirmed);
    assert_eq!(h.exchange.calls(MockOp::GetOrder), 2);
    let remote = h.exchange.orders().into_iter().find(|o| o.client_order_id == oi.client_order_id).unwrap();
    assert_eq!(resolved.exchange_order_id.as_deref(), Some(remote.order_id.as_str()));

    // settled intents are left alone
    let again = h.executor.resolve_sent_unknown(&resolved).await.unwrap();
    assert_eq!(again, resolved);
    assert_eq!(h.exchange.calls(MockOp::GetOrder), 2);
}

#[tokio::test]
async fn test_timeout_then_every_query_not_found() {
    let h = harness(ExecutorConfig {
        intent_max_rest_queries: 3,
        ..ExecutorConfig::default()
    })
    .await;
    let oi = intent();
    h.exchange.push_fault(MockOp::NewOrder, MockFault::Timeout);
    let _ = h.executor.submit_with_intent(&oi, &CancellationToken::new()).await;

    let resolved = h.executor.resolve_sent_unknown(&oi).await.unwrap();
    assert_eq!(resolved.state, IntentState::NotFound);
    assert_eq!(h.exchange.calls(MockOp::GetOrder), 3);
}

#[tokio::test]
async fn test_lookup_transport_error_keeps_sent_unknown() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    h.exchange.push_fault(MockOp::NewOrder, MockFault::Timeout);
    let _ = h.executor.submit_with_intent(&oi, &CancellationToken::new()).await;

    h.exchange.push_fault(MockOp::GetOrder, MockFault::ServerError);
    let resolved = h.executor.resolve_sent_unknown(&oi).await.unwrap();
    assert_eq!(resolved.state, IntentState::SentUnknown);
}

#[tokio::test]
async fn test_cancelled_submit_is_sent_unknown() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.executor.submit_with_intent(&oi, &cancel).await.unwrap_err();
    assert!(matches!(err, OmsError::SentUnknown { .. }));
}

#[tokio::test]
async fn test_exchange_reject_is_terminal() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    h.exchange.push_fault(
        MockOp::NewOrder,
        MockFault::Reject {
            code: -2010,
            msg: "Account has insufficient balance".into(),
        },
    );

    let err = h
        .executor
        .submit_with_intent(&oi, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OmsError::Rejected { .. }));
    let stored = h.executor.journal().ledger().get(&oi.order_intent_id).await.unwrap().unwrap();
    assert_eq!(stored.state, IntentState::FailedTerminal);

    // a terminal rejection is never resent
    let err = h
        .executor
        .submit_with_intent(&oi, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OmsError::Rejected { .. }));
    assert_eq!(h.exchange.calls(MockOp::NewOrder), 1);
}

#[rstest]
#[case::call_rejected(MockFault::Reject { code: -1013, msg: "Filter failure".into() })]
#[case::leg_rejected_in_ack(MockFault::AckRejected)]
#[tokio::test]
async fn test_failed_protection_is_terminal_with_install_failed(#[case] fault: MockFault) {
    let h = harness(ExecutorConfig::default()).await;
    let d = decision();
    h.exchange.push_fault(MockOp::NewOco, fault);
    let qty = d.entry.as_ref().unwrap().qty.clone();
    let err = h
        .executor
        .install_protection(SCOPE, &d, &qty, &CancellationToken::new())
        .await
        .unwrap_err();
    let OmsError::Rejected { order_intent_id, code, .. } = err else {
        panic!("expected rejection");
    };
    assert_eq!(code, oms::PROTECTION_INSTALL_FAILED);
    let stored = h.executor.journal().ledger().get(&order_intent_id).await.unwrap().unwrap();
    assert_eq!(stored.state, IntentState::FailedTerminal);
    assert_eq!(stored.last_error_code.as_deref(), Some(oms::PROTECTION_INSTALL_FAILED));
}

#[tokio::test]
async fn test_filled_entry_gets_protection_once() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    let cancel = CancellationToken::new();
    h.executor.submit_with_intent(&oi, &cancel).await.unwrap();
    let qty = h.exchange.submitted()[0].quantity.clone();
    h.exchange.fill_order(&oi.client_order_id, &qty);

    let manager = EntryManager::new(h.executor.clone());
    let managed = manager
        .manage_symbol(SCOPE, "BTCUSDT", Some("104.00"), &constraints(), T0, &cancel)
        .await
        .unwrap();
    assert_eq!(managed.len(), 1);
    assert_eq!(managed[0].action, EntryAction::Protected { qty: qty.clone() });
    assert_eq!(h.exchange.oco_requests().len(), 1);
    assert_eq!(h.exchange.oco_requests()[0].quantity, qty);

    manager
        .manage_symbol(SCOPE, "BTCUSDT", Some("104.00"), &constraints(), T0, &cancel)
        .await
        .unwrap();
    assert_eq!(h.exchange.oco_requests().len(), 1);
}

#[tokio::test]
async fn test_stale_entry_repriced_then_cancelled() {
    let h = harness(ExecutorConfig::default()).await;
    let oi = intent();
    let cancel = CancellationToken::new();
    h.executor.submit_with_intent(&oi, &cancel).await.unwrap();
    let manager = EntryManager::new(h.executor.clone());
    let ttl = StrategyConfig::default().maker_ttl_ms;

    let waiting = manager
        .manage_symbol(SCOPE, "BTCUSDT", Some("103.90"), &constraints(), T0 + 1, &cancel)
        .await
        .unwrap();
    assert_eq!(waiting[0].action, EntryAction::Waiting);

    let mut now = T0;
    for n in 1..=StrategyConfig::default().max_reprices {
        now += ttl + 1;
        h.clock.set(now);
        let managed = manager
            .manage_symbol(SCOPE, "BTCUSDT", Some("103.90"), &constraints(), now, &cancel)
            .await
            .unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].action, EntryAction::Repriced { reprice_n: n });
    }

    now += ttl + 1;
    h.clock.set(now);
    let managed = manager
        .manage_symbol(SCOPE, "BTCUSDT", Some("103.90"), &constraints(), now, &cancel)
        .await
        .unwrap();
    assert_eq!(managed[0].action, EntryAction::Cancelled);
    assert!(h.exchange.open_orders(Some("BTCUSDT")).await.unwrap().is_empty());

    let after = manager
        .manage_symbol(SCOPE, "BTCUSDT", Some("103.90"), &constraints(), now + ttl, &cancel)
        .await
        .unwrap();
    assert!(after.is_empty());
}

#[tokio::test]
async fn test_startup_recovery_settles_created_and_unknown() {
    let h = harness(ExecutorConfig::default()).await;
    let journal = h.executor.journal();

    // reached the exchange before the crash, never confirmed locally
    let reached = intent();
    journal.open(&reached).await.unwrap();
    let IntentPayload::NewOrder { request, .. } = IntentPayload::from_intent(&reached).unwrap() else {
        panic!("entry payload expected");
    };
    h.exchange.new_order(&request).await.unwrap();

    // never sent; its target is unknown to the exchange
    let lost = cancel_intent(SCOPE, &reached.decision_id, "BTCUSDT", "X_NEVERPLACED", T0).unwrap();
    journal.open(&lost).await.unwrap();

    let recovery = StartupRecovery::new(ResolverPool::new(h.executor.clone()));
    let stats = recovery.recover().await.unwrap();
    assert_eq!(stats.inspected, 2);
    assert_eq!(stats.created_marked_unknown, 2);
    assert_eq!(stats.confirmed, 1);
    assert_eq!(stats.not_found, 1);

    let ledger = journal.ledger();
    assert_eq!(ledger.get(&reached.order_intent_id).await.unwrap().unwrap().state, IntentState::Confirmed);
    assert_eq!(ledger.get(&lost.order_intent_id).await.unwrap().unwrap().state, IntentState::NotFound);
}
