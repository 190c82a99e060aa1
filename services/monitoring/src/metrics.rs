//! Prometheus metrics of the agent

use crate::error::MonitoringResult;
use common::{Stage, SystemMode};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use storage::AuditStats;

/// Every metric the agent exports, on a private registry
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    cycles_total: IntCounter,
    stage_transitions_total: IntCounterVec,
    intents_total: IntCounterVec,
    audit_queue_depth: IntGauge,
    audit_writer_lag_ms: IntGauge,
    system_mode: IntGauge,
    drift_score_x10000: IntGauge,
    aigate_calls_total: IntCounterVec,
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics").finish_non_exhaustive()
    }
}

impl AgentMetrics {
    /// Create and register the metric set
    ///
    /// # Errors
    ///
    /// Returns an error if a metric is malformed or registered twice.
    pub fn new() -> MonitoringResult<Self> {
        let registry = Registry::new_custom(Some("spot_agent".to_string()), None)?;

        let cycles_total = IntCounter::new("cycles_total", "Cycles started")?;
        let stage_transitions_total = IntCounterVec::new(
            Opts::new("stage_transitions_total", "STAGE_CHANGED events by stage"),
            &["stage"],
        )?;
        let intents_total = IntCounterVec::new(
            Opts::new("intents_total", "Order-intent transitions by resulting state"),
            &["state"],
        )?;
        let audit_queue_depth = IntGauge::new("audit_queue_depth", "Audit records waiting for the drain")?;
        let audit_writer_lag_ms = IntGauge::new("audit_writer_lag_ms", "Enqueue-to-ack lag of the last audit record")?;
        let system_mode = IntGauge::new("system_mode", "0 NORMAL, 1 DEGRADE, 2 PAUSE, 3 EXIT")?;
        let drift_score_x10000 = IntGauge::new("drift_score_x10000", "Last reconciler drift score")?;
        let aigate_calls_total = IntCounterVec::new(
            Opts::new("aigate_calls_total", "Advisory gate calls by verdict"),
            &["verdict"],
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(stage_transitions_total.clone()))?;
        registry.register(Box::new(intents_total.clone()))?;
        registry.register(Box::new(audit_queue_depth.clone()))?;
        registry.register(Box::new(audit_writer_lag_ms.clone()))?;
        registry.register(Box::new(system_mode.clone()))?;
        registry.register(Box::new(drift_score_x10000.clone()))?;
        registry.register(Box::new(aigate_calls_total.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            stage_transitions_total,
            intents_total,
            audit_queue_depth,
            audit_writer_lag_ms,
            system_mode,
            drift_score_x10000,
            aigate_calls_total,
        })
    }

    /// A cycle began
    pub fn cycle_started(&self) {
        self.cycles_total.inc();
    }

    /// The orchestrator entered `stage`
    pub fn stage_entered(&self, stage: Stage) {
        self.stage_transitions_total.with_label_values(&[stage.as_str()]).inc();
    }

    /// An intent reached `state`
    pub fn intent_state(&self, state: &str) {
        self.intents_total.with_label_values(&[state]).inc();
    }

    /// The advisory gate answered `verdict`
    pub fn aigate_call(&self, verdict: &str) {
        self.aigate_calls_total.with_label_values(&[verdict]).inc();
    }

    /// Audit writer occupancy and lag
    pub fn observe_audit(&self, stats: &AuditStats) {
        self.audit_queue_depth.set(i64::try_from(stats.queue_len).unwrap_or(i64::MAX));
        self.audit_writer_lag_ms.set(i64::try_from(stats.lag_ms).unwrap_or(i64::MAX));
    }

    /// Published system mode
    pub fn set_mode(&self, mode: SystemMode) {
        self.system_mode.set(mode as i64);
    }

    /// Last drift score
    pub fn set_drift_score(&self, score_x10000: i64) {
        self.drift_score_x10000.set(score_x10000);
    }

    /// Text exposition of every metric
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> MonitoringResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}
