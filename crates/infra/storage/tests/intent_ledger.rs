//! Intent ledger: idempotent creation and non-regressing transitions

use common::model::{IntentAction, IntentState, OrderIntent};
use rstest::*;
use storage::{IntentLedger, Store, TransitionUpdate};
use tempfile::TempDir;

async fn ledger() -> (TempDir, IntentLedger) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("agent.db"), 1_000).await.unwrap();
    store.migrate().await.unwrap();
    (dir, IntentLedger::new(store))
}

fn intent(id: &str) -> OrderIntent {
    OrderIntent::created(
        id.to_string(),
        "run_1",
        "cyc_1",
        "dec_1",
        "BTCUSDT",
        IntentAction::NewOrder,
        r#"{"qty":"0.123"}"#.to_string(),
        1_000,
    )
}

#[tokio::test]
async fn test_insert_is_idempotent_on_intent_id() {
    let (_dir, ledger) = ledger().await;
    let (first, inserted) = ledger.insert_if_absent(&intent("oi_a")).await.unwrap();
    assert!(inserted);
    assert_eq!(first.state, IntentState::Created);

    ledger
        .transition("oi_a", IntentState::SentUnknown, &TransitionUpdate::default(), 2_000)
        .await
        .unwrap();
    let (again, inserted) = ledger.insert_if_absent(&intent("oi_a")).await.unwrap();
    assert!(!inserted);
    assert_eq!(again.state, IntentState::SentUnknown);
    assert_eq!(again.client_order_id, first.client_order_id);
}

#[rstest]
#[case(IntentState::Confirmed)]
#[case(IntentState::NotFound)]
#[case(IntentState::FailedTerminal)]
#[tokio::test]
async fn test_terminal_states_absorb(#[case] terminal: IntentState) {
    let (_dir, ledger) = ledger().await;
    ledger.insert_if_absent(&intent("oi_t")).await.unwrap();
    if terminal == IntentState::NotFound {
        assert!(ledger
            .transition("oi_t", IntentState::SentUnknown, &TransitionUpdate::default(), 2)
            .await
            .unwrap());
    }
    assert!(ledger.transition("oi_t", terminal, &TransitionUpdate::default(), 3).await.unwrap());
    for next in IntentState::ALL {
        assert!(!ledger.transition("oi_t", *next, &TransitionUpdate::default(), 4).await.unwrap());
    }
    assert_eq!(ledger.get("oi_t").await.unwrap().unwrap().state, terminal);
}

#[tokio::test]
async fn test_sent_unknown_reenters_then_confirms_with_order_id() {
    let (_dir, ledger) = ledger().await;
    ledger.insert_if_absent(&intent("oi_s")).await.unwrap();
    let none = TransitionUpdate::default();
    assert!(ledger.transition("oi_s", IntentState::SentUnknown, &none, 2).await.unwrap());
    assert!(ledger.transition("oi_s", IntentState::SentUnknown, &none, 3).await.unwrap());
    assert!(ledger
        .transition("oi_s", IntentState::Confirmed, &TransitionUpdate::order_id("12345"), 4)
        .await
        .unwrap());

    let row = ledger.get("oi_s").await.unwrap().unwrap();
    assert_eq!(row.state, IntentState::Confirmed);
    assert_eq!(row.exchange_order_id.as_deref(), Some("12345"));
    assert_eq!(row.updated_at_ms, 4);
    let by_client = ledger.get_by_client_order_id(&row.client_order_id).await.unwrap().unwrap();
    assert_eq!(by_client.order_intent_id, "oi_s");
}

#[tokio::test]
async fn test_created_cannot_jump_to_not_found() {
    let (_dir, ledger) = ledger().await;
    ledger.insert_if_absent(&intent("oi_n")).await.unwrap();
    assert!(!ledger
        .transition("oi_n", IntentState::NotFound, &TransitionUpdate::default(), 2)
        .await
        .unwrap());
    assert!(!ledger
        .transition("oi_missing", IntentState::Confirmed, &TransitionUpdate::default(), 2)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_listing_and_counts() {
    let (_dir, ledger) = ledger().await;
    for id in ["oi_1", "oi_2", "oi_3"] {
        ledger.insert_if_absent(&intent(id)).await.unwrap();
    }
    ledger
        .transition("oi_2", IntentState::FailedTerminal, &TransitionUpdate::error("-2010", "rejected"), 5)
        .await
        .unwrap();

    let open = ledger
        .list_by_states(&[IntentState::Created, IntentState::SentUnknown])
        .await
        .unwrap();
    assert_eq!(open.iter().map(|i| i.order_intent_id.as_str()).collect::<Vec<_>>(), ["oi_1", "oi_3"]);

    let failed = ledger.get("oi_2").await.unwrap().unwrap();
    assert_eq!(failed.last_error_code.as_deref(), Some("-2010"));

    assert_eq!(ledger.count_created(IntentAction::NewOrder, Some("BTCUSDT"), 0, 2_000).await.unwrap(), 3);
    assert_eq!(ledger.count_created(IntentAction::NewOrder, None, 1_001, 2_000).await.unwrap(), 0);
    assert_eq!(
        ledger.count_in_state_since("BTCUSDT", IntentState::FailedTerminal, 0).await.unwrap(),
        1
    );
    let counts = ledger.counts_by_state(0, 2_000).await.unwrap();
    assert!(counts.contains(&(IntentState::Created, 2)));
    assert!(counts.contains(&(IntentState::FailedTerminal, 1)));
}
