//! Health supervisor task
//!
//! The only writer of the [`SystemModeCell`]. Each tick it samples the
//! heartbeats, disk and audit writer, evaluates the mode table and records
//! what changed.

use crate::disk::disk_free_bytes;
use crate::health::{HealthEvaluator, HealthReport, HealthSignals, HealthThresholds};
use crate::metrics::AgentMetrics;
use common::{Clock, EventType, ReasonCode, Stage, SystemMode, SystemModeCell};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use storage::{AuditRecord, AuditStats, AuditWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Liveness timestamps written by the worker tasks
#[derive(Debug, Default)]
pub struct Heartbeats {
    loop_progress_ms: AtomicI64,
    ws_last_msg_ms: AtomicI64,
    rest_last_success_ms: AtomicI64,
    drift_score_x10000: AtomicI64,
    force_exit: AtomicBool,
}

impl Heartbeats {
    /// The cycle loop made progress
    pub fn loop_progress(&self, now_ms: i64) {
        self.loop_progress_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    /// A book-ticker frame arrived at `ts_ms`
    pub fn ws_message(&self, ts_ms: i64) {
        self.ws_last_msg_ms.fetch_max(ts_ms, Ordering::AcqRel);
    }

    /// A REST call succeeded at `ts_ms`
    pub fn rest_success(&self, ts_ms: i64) {
        self.rest_last_success_ms.fetch_max(ts_ms, Ordering::AcqRel);
    }

    /// Latest reconciler drift score; replaces the previous one
    pub fn drift_score(&self, score_x10000: i64) {
        self.drift_score_x10000.store(score_x10000, Ordering::Release);
    }

    /// Ask the supervisor to enter EXIT
    pub fn request_exit(&self) {
        self.force_exit.store(true, Ordering::Release);
    }

    /// Whether an exit was requested
    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.force_exit.load(Ordering::Acquire)
    }

    /// Signals at `now_ms` with the given disk and audit samples
    #[must_use]
    pub fn signals(&self, now_ms: i64, disk_free_bytes: u64, audit: &AuditStats) -> HealthSignals {
        HealthSignals {
            now_ms,
            last_loop_progress_ms: self.loop_progress_ms.load(Ordering::Acquire),
            ws_last_msg_ms: self.ws_last_msg_ms.load(Ordering::Acquire),
            rest_last_success_ms: self.rest_last_success_ms.load(Ordering::Acquire),
            disk_free_bytes,
            audit_queue_pct: audit.queue_pct(),
            audit_writer_lag_ms: audit.lag_ms,
            drift_score_x10000: self.drift_score_x10000.load(Ordering::Acquire),
            force_exit_requested: self.exit_requested(),
        }
    }
}

/// Audit-writer pressure as last reported
fn backpressure(reasons: &[ReasonCode]) -> Vec<ReasonCode> {
    reasons
        .iter()
        .copied()
        .filter(|r| {
            matches!(
                r,
                ReasonCode::DbWriterQueueHigh | ReasonCode::DbWriterQueueFull | ReasonCode::DbWriterLagHigh
            )
        })
        .collect()
}

const fn stage_for(mode: SystemMode) -> Stage {
    match mode {
        SystemMode::Exit => Stage::Shutdown,
        SystemMode::Pause => Stage::Pause,
        SystemMode::Degrade => Stage::Degrade,
        SystemMode::Normal => Stage::StateUpdate,
    }
}

/// Periodic health evaluation bound to one run
pub struct HealthSupervisor {
    evaluator: HealthEvaluator,
    mode: Arc<SystemModeCell>,
    heartbeats: Arc<Heartbeats>,
    audit: Arc<AuditWriter>,
    clock: Arc<dyn Clock>,
    metrics: Option<AgentMetrics>,
    run_id: String,
    data_dir: PathBuf,
    last_backpressure: Vec<ReasonCode>,
}

impl std::fmt::Debug for HealthSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthSupervisor")
            .field("run_id", &self.run_id)
            .field("mode", &self.mode.get())
            .finish_non_exhaustive()
    }
}

impl HealthSupervisor {
    /// Supervisor publishing into `mode`; disk is sampled at `data_dir`
    #[must_use]
    pub fn new(
        thresholds: HealthThresholds,
        mode: Arc<SystemModeCell>,
        heartbeats: Arc<Heartbeats>,
        audit: Arc<AuditWriter>,
        clock: Arc<dyn Clock>,
        run_id: &str,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            evaluator: HealthEvaluator::new(thresholds),
            mode,
            heartbeats,
            audit,
            clock,
            metrics: None,
            run_id: run_id.to_string(),
            data_dir,
            last_backpressure: Vec::new(),
        }
    }

    /// Also publish into `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn emit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.enqueue(record) {
            warn!(error = %e, "health audit dropped");
        }
    }

    /// Free bytes at `data_dir`, queried off the runtime; 0 when sampling fails
    async fn sample_disk(&self) -> u64 {
        let dir = self.data_dir.clone();
        match tokio::task::spawn_blocking(move || disk_free_bytes(&dir)).await {
            Ok(Ok(free)) => free,
            Ok(Err(e)) => {
                warn!(path = %self.data_dir.display(), error = %e, "disk sample failed");
                0
            }
            Err(e) => {
                warn!(path = %self.data_dir.display(), error = %e, "disk sample task failed");
                0
            }
        }
    }

    /// Sample, evaluate and publish once
    ///
    /// Audit records are enqueued without waiting so a saturated writer
    /// cannot stall the supervisor.
    pub async fn tick(&mut self) -> HealthReport {
        let disk_free = self.sample_disk().await;
        let now = self.clock.now_ms();
        let stats = self.audit.stats();
        let signals = self.heartbeats.signals(now, disk_free, &stats);
        let report = self.evaluator.evaluate(&signals);
        let thresholds = *self.evaluator.thresholds();

        let disk_reason = if disk_free <= thresholds.disk_free_pause_bytes {
            ReasonCode::DiskLowPause
        } else if disk_free <= thresholds.disk_free_degrade_bytes {
            ReasonCode::DiskLowDegrade
        } else {
            ReasonCode::StageOk
        };
        self.emit(
            AuditRecord::new(now, &self.run_id, &self.run_id, Stage::StateUpdate, EventType::DiskHealthSample, vec![disk_reason])
                .with_data(json!({
                    "path": self.data_dir.display().to_string(),
                    "disk_free_bytes": disk_free,
                    "degrade_bytes": thresholds.disk_free_degrade_bytes,
                    "pause_bytes": thresholds.disk_free_pause_bytes,
                })),
        );

        let pressure = backpressure(&report.reasons);
        if pressure != self.last_backpressure {
            let reasons = if pressure.is_empty() {
                vec![ReasonCode::EnterNormal]
            } else {
                pressure.clone()
            };
            warn!(queue_len = stats.queue_len, lag_ms = stats.lag_ms, ?reasons, "audit writer pressure changed");
            self.emit(
                AuditRecord::new(now, &self.run_id, &self.run_id, stage_for(report.mode), EventType::DbWriterBackpressure, reasons)
                    .with_data(json!({
                        "queue_len": stats.queue_len,
                        "capacity": stats.capacity,
                        "hi_watermark": stats.hi_watermark,
                        "queue_pct": stats.queue_pct(),
                        "lag_ms": stats.lag_ms,
                    })),
            );
            self.last_backpressure = pressure;
        }

        let previous = self.mode.set(report.mode);
        if previous != report.mode {
            info!(from = %previous, to = %report.mode, reasons = ?report.reasons, "system mode changed");
            self.emit(
                AuditRecord::new(
                    now,
                    &self.run_id,
                    &self.run_id,
                    stage_for(report.mode),
                    EventType::SystemModeChanged,
                    report.reasons.clone(),
                )
                .with_data(json!({
                    "from": previous.as_str(),
                    "to": report.mode.as_str(),
                    "signals": signals,
                })),
            );
        } else {
            debug!(mode = %report.mode, "health tick");
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_mode(self.mode.get());
            metrics.observe_audit(&stats);
        }
        report
    }

    /// Tick every `interval` until cancelled or EXIT
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.tick().await.mode == SystemMode::Exit {
                        info!("health supervisor entered EXIT");
                        break;
                    }
                }
            }
        }
    }
}
