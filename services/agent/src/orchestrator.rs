//! Cycle orchestrator
//!
//! Walks a stage sequence under one cycle id. Before each stage the shared
//! mode cell is consulted: a stage the mode does not permit is recorded
//! under the supervisory DEGRADE or PAUSE stage instead of running, and
//! EXIT stops the walk so the caller can write the shutdown trail. Every
//! transition is made durable in the audit trail before the stage runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::ids::{NonceSource, new_cycle_id, new_run_id};
use common::{Clock, EventType, ReasonCode, Stage, SystemMode, SystemModeCell};
use monitoring::{AgentMetrics, Heartbeats};
use serde_json::json;
use std::sync::Arc;
use storage::{AuditRecord, AuditWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reporter::{StageEvent, StageReporter};

/// Ids and cancellation handed to each stage
#[derive(Debug, Clone, Copy)]
pub struct StageCtx<'a> {
    /// Process run
    pub run_id: &'a str,
    /// Cycle
    pub cycle_id: &'a str,
    /// Outer shutdown signal
    pub cancel: &'a CancellationToken,
}

/// The work behind the stages of a walk
#[async_trait]
pub trait StageWork: Send {
    /// Reason recorded on each STAGE_CHANGED
    fn entry_reason(&self) -> ReasonCode {
        ReasonCode::StageOk
    }

    /// Run `stage`; an error ends the walk
    async fn run_stage(&mut self, stage: Stage, ctx: StageCtx<'_>) -> Result<()>;
}

/// Stage envelopes only; nothing runs
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRun;

#[async_trait]
impl StageWork for DryRun {
    fn entry_reason(&self) -> ReasonCode {
        ReasonCode::DryRun
    }

    async fn run_stage(&mut self, _stage: Stage, _ctx: StageCtx<'_>) -> Result<()> {
        Ok(())
    }
}

/// How a walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Every stage was run or skipped
    Completed,
    /// EXIT or cancellation stopped the walk before `at`
    Exited {
        /// First stage not walked
        at: Stage,
    },
}

/// Sequences stages for one process run
pub struct Orchestrator {
    run_id: String,
    audit: Arc<AuditWriter>,
    clock: Arc<dyn Clock>,
    nonces: Arc<dyn NonceSource>,
    mode: Arc<SystemModeCell>,
    heartbeats: Arc<Heartbeats>,
    reporter: Arc<dyn StageReporter>,
    metrics: Option<AgentMetrics>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("mode", &self.mode.get())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator with a fresh run id
    ///
    /// # Errors
    ///
    /// Returns an error if the clock reading cannot be formatted.
    pub fn new(
        audit: Arc<AuditWriter>,
        clock: Arc<dyn Clock>,
        nonces: Arc<dyn NonceSource>,
        mode: Arc<SystemModeCell>,
        heartbeats: Arc<Heartbeats>,
        reporter: Arc<dyn StageReporter>,
    ) -> Result<Self> {
        let run_id = new_run_id(clock.as_ref(), nonces.as_ref()).context("run id")?;
        info!(run_id = %run_id, "run started");
        Ok(Self {
            run_id,
            audit,
            clock,
            nonces,
            mode,
            heartbeats,
            reporter,
            metrics: None,
        })
    }

    /// Also count cycles and transitions in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run id of this process
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Mode currently published by the health supervisor
    #[must_use]
    pub fn mode(&self) -> SystemMode {
        self.mode.get()
    }

    /// Issue the id of the next cycle
    ///
    /// # Errors
    ///
    /// Returns an error if the clock reading cannot be formatted.
    pub fn next_cycle(&self) -> Result<String> {
        let cycle_id = new_cycle_id(self.clock.as_ref(), self.nonces.as_ref()).context("cycle id")?;
        if let Some(m) = &self.metrics {
            m.cycle_started();
        }
        Ok(cycle_id)
    }

    async fn record(
        &self,
        cycle_id: &str,
        stage: Stage,
        skipped: Option<Stage>,
        reason: ReasonCode,
        mode: SystemMode,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let mut data = json!({ "system_mode": mode.as_str() });
        if let Some(skipped) = skipped {
            data["skipped_stage"] = json!(skipped.as_str());
        }
        let record = AuditRecord::new(now, &self.run_id, cycle_id, stage, EventType::StageChanged, vec![reason])
            .with_data(data);
        self.audit
            .write(record)
            .await
            .with_context(|| format!("STAGE_CHANGED for {stage}"))?;
        self.heartbeats.loop_progress(now);
        if let Some(m) = &self.metrics {
            m.stage_entered(stage);
        }
        self.reporter.report(&StageEvent {
            run_id: &self.run_id,
            cycle_id,
            stage,
            skipped,
            mode,
        });
        Ok(())
    }

    /// Walk `stages` in order under `cycle_id`
    ///
    /// # Errors
    ///
    /// Returns the first audit failure or stage error; later stages of the
    /// walk do not run.
    pub async fn walk(
        &self,
        stages: &[Stage],
        cycle_id: &str,
        work: &mut dyn StageWork,
        cancel: &CancellationToken,
    ) -> Result<WalkOutcome> {
        let ctx = StageCtx {
            run_id: &self.run_id,
            cycle_id,
            cancel,
        };
        for &stage in stages {
            let mode = self.mode.get();
            if stage != Stage::Shutdown && (mode == SystemMode::Exit || cancel.is_cancelled()) {
                info!(cycle_id, stage = %stage, mode = %mode, "walk stopped");
                return Ok(WalkOutcome::Exited { at: stage });
            }
            if !mode.permits(stage) {
                if let Some(pseudo) = mode.skip_stage() {
                    debug!(cycle_id, stage = %stage, mode = %mode, "stage skipped");
                    self.record(cycle_id, pseudo, Some(stage), ReasonCode::StageSkippedMode, mode)
                        .await?;
                }
                continue;
            }
            self.record(cycle_id, stage, None, work.entry_reason(), mode).await?;
            work.run_stage(stage, ctx)
                .await
                .with_context(|| format!("stage {stage} of {cycle_id}"))?;
        }
        Ok(WalkOutcome::Completed)
    }

    /// Enter SHUTDOWN, run its work and write the SHUTDOWN record
    ///
    /// # Errors
    ///
    /// Returns an error if either audit record cannot be written. A failing
    /// shutdown stage is logged and does not prevent the SHUTDOWN record.
    pub async fn shutdown(
        &self,
        cycle_id: &str,
        reason: ReasonCode,
        work: &mut dyn StageWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mode = self.mode.get();
        self.record(cycle_id, Stage::Shutdown, None, work.entry_reason(), mode).await?;
        let ctx = StageCtx {
            run_id: &self.run_id,
            cycle_id,
            cancel,
        };
        if let Err(e) = work.run_stage(Stage::Shutdown, ctx).await {
            warn!(cycle_id, error = %e, "shutdown stage failed");
        }
        let record = AuditRecord::new(
            self.clock.now_ms(),
            &self.run_id,
            cycle_id,
            Stage::Shutdown,
            EventType::Shutdown,
            vec![reason],
        )
        .with_data(json!({ "system_mode": mode.as_str() }));
        self.audit.write(record).await.context("SHUTDOWN record")?;
        info!(run_id = %self.run_id, cycle_id, reason = %reason, "run finished");
        Ok(())
    }
}
