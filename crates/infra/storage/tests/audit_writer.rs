//! Audit writer behaviour against a real SQLite file and day directory

use common::config::AuditConfig;
use common::{EventType, ManualClock, ReasonCode, Stage};
use rstest::*;
use std::sync::Arc;
use storage::audit::{count_events, count_events_with_reason, events_for_run};
use storage::{AuditError, AuditRecord, AuditWriter, Store};
use tempfile::TempDir;

const T0: i64 = 1_700_000_000_000;
const RUN: &str = "run_20231114_221320_00000a";
const CYCLE: &str = "cyc_20231114_221320_00000b";

struct Harness {
    dir: TempDir,
    store: Store,
    writer: AuditWriter,
}

async fn harness(capacity: usize, migrate: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("agent.db"), 2_000).await.unwrap();
    if migrate {
        store.migrate().await.unwrap();
    }
    let cfg = AuditConfig {
        dir: dir.path().join("audit"),
        audit_writer_queue_capacity: capacity,
        audit_writer_queue_hi_watermark: capacity,
        audit_writer_max_lag_ms: 2_000,
    };
    let writer = AuditWriter::spawn(store.clone(), &cfg.dir, &cfg, Arc::new(ManualClock::new(T0)))
        .await
        .unwrap();
    Harness { dir, store, writer }
}

fn record(seq: i64) -> AuditRecord {
    AuditRecord::new(T0 + seq, RUN, CYCLE, Stage::Boot, EventType::StageChanged, vec![ReasonCode::StageOk])
        .with_field("seq", seq)
}

fn day_file(h: &Harness) -> std::path::PathBuf {
    h.dir.path().join("audit").join("audit-2023-11-14.file")
}

#[rstest]
#[tokio::test]
async fn test_single_producer_order_preserved_in_both_sinks() {
    let h = harness(16, true).await;
    for seq in 0..20 {
        h.writer.write(record(seq)).await.unwrap();
    }

    let rows = events_for_run(&h.store, RUN).await.unwrap();
    let seqs: Vec<String> = rows.iter().map(|r| r.data_json.clone()).collect();
    let expected: Vec<String> = (0..20).map(|s| format!(r#"{{"seq":{s}}}"#)).collect();
    assert_eq!(seqs, expected);

    let text = std::fs::read_to_string(day_file(&h)).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 20);
    for (seq, line) in lines.iter().enumerate() {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(v["seq"], seq as i64);
        assert_eq!(v["event_type"], "STAGE_CHANGED");
    }
    assert!(text.ends_with('\n'));

    let stats = h.writer.stats();
    assert_eq!(stats.queue_len, 0);
    assert_eq!(stats.written, 20);
    h.writer.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_fails_fast() {
    let h = harness(8, true).await;

    // The drain task cannot run until this task yields
    let tickets: Vec<_> = (0..8).map(|seq| h.writer.enqueue(record(seq)).unwrap()).collect();
    assert_eq!(h.writer.stats().queue_len, 8);
    let err = h.writer.enqueue(record(8)).err().unwrap();
    assert!(matches!(err, AuditError::QueueFull { capacity: 8 }));

    for ticket in tickets {
        ticket.wait().await.unwrap();
    }
    assert_eq!(events_for_run(&h.store, RUN).await.unwrap().len(), 8);
    h.writer.shutdown().await;
}

#[tokio::test]
async fn test_write_after_shutdown_is_rejected() {
    let h = harness(4, true).await;
    h.writer.write(record(1)).await.unwrap();
    h.writer.shutdown().await;
    let err = h.writer.write(record(2)).await.unwrap_err();
    assert!(matches!(err, AuditError::WriterClosed));
}

#[tokio::test]
async fn test_insert_failure_skips_day_file() {
    let h = harness(4, false).await;
    let err = h.writer.write(record(1)).await.unwrap_err();
    assert!(matches!(err, AuditError::Store(_)));
    assert!(!day_file(&h).exists());
    assert_eq!(h.writer.stats().failed, 1);
    h.writer.shutdown().await;
}

#[tokio::test]
async fn test_invalid_record_never_enqueued() {
    let h = harness(4, true).await;
    let err = h.writer.write(record(1).with_field("stage", "X")).await.unwrap_err();
    assert!(matches!(err, AuditError::ReservedKey(_)));
    assert_eq!(h.writer.stats().written, 0);
    h.writer.shutdown().await;
}

#[tokio::test]
async fn test_counts_by_type_and_reason() {
    let h = harness(8, true).await;
    let verdict = |seq: i64, reason: ReasonCode| {
        AuditRecord::new(T0 + seq, RUN, CYCLE, Stage::RiskVerdict, EventType::RiskVerdict, vec![reason])
    };
    h.writer.write(verdict(1, ReasonCode::RiskAllow)).await.unwrap();
    h.writer.write(verdict(2, ReasonCode::RiskMaxOpenOrders)).await.unwrap();
    h.writer.write(verdict(3, ReasonCode::RiskAllow)).await.unwrap();
    h.writer.write(record(4)).await.unwrap();

    let window = (T0, T0 + 10);
    assert_eq!(count_events(&h.store, EventType::RiskVerdict, window.0, window.1).await.unwrap(), 3);
    assert_eq!(
        count_events_with_reason(&h.store, EventType::RiskVerdict, ReasonCode::RiskAllow, window.0, window.1)
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        count_events(&h.store, EventType::RiskVerdict, T0 + 2, window.1).await.unwrap(),
        2,
        "lower bound is inclusive"
    );
    h.writer.shutdown().await;
}
