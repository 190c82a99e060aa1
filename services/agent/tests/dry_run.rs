//! Dry run writes the stage envelope trail and nothing else

use common::ids::SequentialNonce;
use common::{AgentConfig, ManualClock, Stage};
use pretty_assertions::assert_eq;
use spot_agent::TracingReporter;
use spot_agent::runtime::dry_run_with;
use std::path::Path;
use std::sync::{Arc, Once};
use storage::Store;
use storage::audit::events_for_run;

const T0: i64 = 1_700_000_000_000;

static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn config(dir: &Path) -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.runtime.db_path = dir.join("agent.db");
    cfg.audit.dir = dir.join("audit");
    cfg
}

fn day_file_lines(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap().lines().count())
        .sum()
}

#[tokio::test]
async fn test_dry_run_records_every_stage_once() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());

    let report = dry_run_with(
        &cfg,
        Arc::new(ManualClock::new(T0)),
        Arc::new(SequentialNonce::default()),
        Arc::new(TracingReporter),
    )
    .await
    .unwrap();
    assert_eq!(report.stages, Stage::DEFAULT_SEQUENCE.len());

    let store = Store::open(&cfg.runtime.db_path, 2_000).await.unwrap();
    let events = events_for_run(&store, &report.run_id).await.unwrap();
    let stages: Vec<&str> = events.iter().map(|e| e.stage.as_str()).collect();
    let expected: Vec<&str> = Stage::DEFAULT_SEQUENCE.iter().map(Stage::as_str).collect();
    assert_eq!(stages, expected);
    for event in &events {
        assert_eq!(event.event_type, "STAGE_CHANGED");
        assert_eq!(event.reasons, ["DRY_RUN"]);
        assert_eq!(event.cycle_id, report.cycle_id);
    }
    assert!(!events.iter().any(|e| e.event_type == "SHUTDOWN"));
    assert_eq!(day_file_lines(&cfg.audit.dir), events.len());
}

#[tokio::test]
async fn test_dry_runs_get_distinct_run_ids() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let nonces = Arc::new(SequentialNonce::default());
    let clock = Arc::new(ManualClock::new(T0));

    let first = dry_run_with(&cfg, clock.clone(), nonces.clone(), Arc::new(TracingReporter))
        .await
        .unwrap();
    let second = dry_run_with(&cfg, clock, nonces, Arc::new(TracingReporter))
        .await
        .unwrap();
    assert_ne!(first.run_id, second.run_id);

    let store = Store::open(&cfg.runtime.db_path, 2_000).await.unwrap();
    assert_eq!(events_for_run(&store, &second.run_id).await.unwrap().len(), 16);
}
