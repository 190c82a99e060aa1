//! System-mode evaluation
//!
//! Maps liveness, staleness, disk, audit-writer and drift signals to the worst
//! applicable [`SystemMode`] and the reason codes behind it. The mapping is
//! monotone per signal: making one signal worse never lowers the mode.

use common::config::{AuditConfig, HealthConfig, ReconcileConfig};
use common::reason::push_unique;
use common::{ReasonCode, SystemMode};
use serde::{Deserialize, Serialize};

/// One sample of everything the evaluator looks at
///
/// A timestamp of 0 means the source has never reported and counts as
/// infinitely stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSignals {
    /// Evaluation time
    pub now_ms: i64,
    /// Last time the cycle loop made progress
    pub last_loop_progress_ms: i64,
    /// Last book-ticker frame
    pub ws_last_msg_ms: i64,
    /// Last successful REST call
    pub rest_last_success_ms: i64,
    /// Free bytes on the data volume
    pub disk_free_bytes: u64,
    /// Audit queue occupancy in whole percent
    pub audit_queue_pct: u64,
    /// Audit writer enqueue-to-ack lag
    pub audit_writer_lag_ms: u64,
    /// Last reconciler drift score
    pub drift_score_x10000: i64,
    /// Operator or fatal error asked to stop
    pub force_exit_requested: bool,
}

/// Thresholds of the mode table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Loop silence before DEGRADE
    pub loop_stuck_ms_degrade: i64,
    /// Loop silence before PAUSE
    pub loop_stuck_ms_pause: i64,
    /// WebSocket silence before DEGRADE
    pub ws_stale_ms_degrade: i64,
    /// WebSocket silence before PAUSE
    pub ws_stale_ms_pause: i64,
    /// REST silence before DEGRADE
    pub rest_stale_ms_degrade: i64,
    /// REST silence before PAUSE
    pub rest_stale_ms_pause: i64,
    /// Free disk at or below which to DEGRADE
    pub disk_free_degrade_bytes: u64,
    /// Free disk at or below which to PAUSE
    pub disk_free_pause_bytes: u64,
    /// Queue occupancy percent at the hi-watermark
    pub audit_queue_hi_pct: u64,
    /// Queue occupancy percent counted as full
    pub audit_queue_full_pct: u64,
    /// Writer lag at which to DEGRADE
    pub audit_writer_max_lag_ms: u64,
    /// Drift score at which to DEGRADE
    pub drift_degrade_score_x10000: i64,
    /// Drift score at which to PAUSE
    pub drift_pause_score_x10000: i64,
}

impl HealthThresholds {
    /// Thresholds from the health and audit sections
    #[must_use]
    pub fn from_config(health: &HealthConfig, audit: &AuditConfig) -> Self {
        let capacity = audit.audit_writer_queue_capacity.max(1) as u64;
        let reconcile = ReconcileConfig::default();
        Self {
            loop_stuck_ms_degrade: health.loop_stuck_ms_degrade,
            loop_stuck_ms_pause: health.loop_stuck_ms_pause,
            ws_stale_ms_degrade: health.ws_stale_ms_degrade,
            ws_stale_ms_pause: health.ws_stale_ms_pause,
            rest_stale_ms_degrade: health.rest_stale_ms_degrade,
            rest_stale_ms_pause: health.rest_stale_ms_pause,
            disk_free_degrade_bytes: health.disk_free_degrade_bytes,
            disk_free_pause_bytes: health.disk_free_pause_bytes,
            audit_queue_hi_pct: audit.audit_writer_queue_hi_watermark as u64 * 100 / capacity,
            audit_queue_full_pct: 100,
            audit_writer_max_lag_ms: audit.audit_writer_max_lag_ms,
            drift_degrade_score_x10000: reconcile.reconcile_drift_degrade_score_x10000,
            drift_pause_score_x10000: reconcile.reconcile_drift_pause_score_x10000,
        }
    }

    /// Drift thresholds from the reconcile section
    #[must_use]
    pub const fn with_drift(mut self, reconcile: &ReconcileConfig) -> Self {
        self.drift_degrade_score_x10000 = reconcile.reconcile_drift_degrade_score_x10000;
        self.drift_pause_score_x10000 = reconcile.reconcile_drift_pause_score_x10000;
        self
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default(), &AuditConfig::default())
    }
}

/// Worst mode and the violations that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    /// Worst applicable mode
    pub mode: SystemMode,
    /// Degrade and pause codes currently applicable, de-duplicated
    pub violations: Vec<ReasonCode>,
}

/// Time since `last_ms`, saturating to `i64::MAX` when never seen
fn age(now_ms: i64, last_ms: i64) -> i64 {
    if last_ms <= 0 {
        return i64::MAX;
    }
    now_ms.saturating_sub(last_ms)
}

struct Tally {
    mode: SystemMode,
    violations: Vec<ReasonCode>,
}

impl Tally {
    fn raise(&mut self, mode: SystemMode, code: ReasonCode) {
        self.mode = self.mode.max(mode);
        push_unique(&mut self.violations, code);
    }

    fn staleness(&mut self, age_ms: i64, degrade_ms: i64, pause_ms: i64, codes: (ReasonCode, ReasonCode)) {
        if age_ms >= pause_ms {
            self.raise(SystemMode::Pause, codes.1);
        } else if age_ms >= degrade_ms {
            self.raise(SystemMode::Degrade, codes.0);
        }
    }
}

/// Evaluate one sample against the mode table
///
/// A force-exit request yields EXIT with `FORCE_EXIT`. Every other signal
/// contributes at most one code: its pause code past the pause threshold,
/// otherwise its degrade code past the degrade threshold.
#[must_use]
pub fn assess(signals: &HealthSignals, t: &HealthThresholds) -> Assessment {
    let mut tally = Tally {
        mode: SystemMode::Normal,
        violations: Vec::new(),
    };
    if signals.force_exit_requested {
        tally.raise(SystemMode::Exit, ReasonCode::ForceExit);
    }

    let now = signals.now_ms;
    tally.staleness(
        age(now, signals.last_loop_progress_ms),
        t.loop_stuck_ms_degrade,
        t.loop_stuck_ms_pause,
        (ReasonCode::LoopStuckDegrade, ReasonCode::LoopStuckPause),
    );
    tally.staleness(
        age(now, signals.ws_last_msg_ms),
        t.ws_stale_ms_degrade,
        t.ws_stale_ms_pause,
        (ReasonCode::WsStaleDegrade, ReasonCode::WsStalePause),
    );
    tally.staleness(
        age(now, signals.rest_last_success_ms),
        t.rest_stale_ms_degrade,
        t.rest_stale_ms_pause,
        (ReasonCode::RestStaleDegrade, ReasonCode::RestStalePause),
    );

    if signals.disk_free_bytes <= t.disk_free_pause_bytes {
        tally.raise(SystemMode::Pause, ReasonCode::DiskLowPause);
    } else if signals.disk_free_bytes <= t.disk_free_degrade_bytes {
        tally.raise(SystemMode::Degrade, ReasonCode::DiskLowDegrade);
    }

    if signals.audit_queue_pct >= t.audit_queue_full_pct {
        tally.raise(SystemMode::Pause, ReasonCode::DbWriterQueueFull);
    } else if signals.audit_queue_pct >= t.audit_queue_hi_pct {
        tally.raise(SystemMode::Degrade, ReasonCode::DbWriterQueueHigh);
    }
    if signals.audit_writer_lag_ms >= t.audit_writer_max_lag_ms {
        tally.raise(SystemMode::Degrade, ReasonCode::DbWriterLagHigh);
    }

    if signals.drift_score_x10000 >= t.drift_pause_score_x10000 {
        tally.raise(SystemMode::Pause, ReasonCode::DriftLimitExceeded);
    } else if signals.drift_score_x10000 >= t.drift_degrade_score_x10000 {
        tally.raise(SystemMode::Degrade, ReasonCode::DriftDetected);
    }

    Assessment {
        mode: tally.mode,
        violations: tally.violations,
    }
}

/// Result of one supervisor evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Mode to publish
    pub mode: SystemMode,
    /// Violations followed by the `ENTER_*` code of the mode
    pub reasons: Vec<ReasonCode>,
}

const fn enter_code(mode: SystemMode) -> ReasonCode {
    match mode {
        SystemMode::Normal => ReasonCode::EnterNormal,
        SystemMode::Degrade => ReasonCode::EnterDegrade,
        SystemMode::Pause => ReasonCode::EnterPause,
        SystemMode::Exit => ReasonCode::EnterExit,
    }
}

/// Stateful evaluator; once it reports EXIT it never reports anything else
#[derive(Debug, Clone)]
pub struct HealthEvaluator {
    thresholds: HealthThresholds,
    exited: bool,
}

impl HealthEvaluator {
    /// Evaluator over `thresholds`
    #[must_use]
    pub const fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            exited: false,
        }
    }

    /// Thresholds in force
    #[must_use]
    pub const fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Evaluate one sample
    pub fn evaluate(&mut self, signals: &HealthSignals) -> HealthReport {
        if self.exited {
            return HealthReport {
                mode: SystemMode::Exit,
                reasons: vec![ReasonCode::EnterExit],
            };
        }
        let Assessment { mode, mut violations } = assess(signals, &self.thresholds);
        self.exited = mode == SystemMode::Exit;
        push_unique(&mut violations, enter_code(mode));
        HealthReport { mode, reasons: violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const NOW: i64 = 1_700_000_000_000;

    fn healthy() -> HealthSignals {
        HealthSignals {
            now_ms: NOW,
            last_loop_progress_ms: NOW,
            ws_last_msg_ms: NOW,
            rest_last_success_ms: NOW,
            disk_free_bytes: u64::MAX,
            audit_queue_pct: 0,
            audit_writer_lag_ms: 0,
            drift_score_x10000: 0,
            force_exit_requested: false,
        }
    }

    #[test]
    fn test_healthy_is_normal() {
        let a = assess(&healthy(), &HealthThresholds::default());
        assert_eq!(a.mode, SystemMode::Normal);
        assert!(a.violations.is_empty());
    }

    #[rstest]
    #[case::ws_degrade(|s: &mut HealthSignals| s.ws_last_msg_ms = NOW - 11_000, SystemMode::Degrade, ReasonCode::WsStaleDegrade)]
    #[case::ws_pause(|s: &mut HealthSignals| s.ws_last_msg_ms = NOW - 60_000, SystemMode::Pause, ReasonCode::WsStalePause)]
    #[case::ws_never(|s: &mut HealthSignals| s.ws_last_msg_ms = 0, SystemMode::Pause, ReasonCode::WsStalePause)]
    #[case::loop_stuck(|s: &mut HealthSignals| s.last_loop_progress_ms = NOW - 200_000, SystemMode::Degrade, ReasonCode::LoopStuckDegrade)]
    #[case::rest_pause(|s: &mut HealthSignals| s.rest_last_success_ms = NOW - 400_000, SystemMode::Pause, ReasonCode::RestStalePause)]
    #[case::disk_degrade(|s: &mut HealthSignals| s.disk_free_bytes = 1024 * 1024 * 1024, SystemMode::Degrade, ReasonCode::DiskLowDegrade)]
    #[case::disk_pause(|s: &mut HealthSignals| s.disk_free_bytes = 0, SystemMode::Pause, ReasonCode::DiskLowPause)]
    #[case::queue_high(|s: &mut HealthSignals| s.audit_queue_pct = 80, SystemMode::Degrade, ReasonCode::DbWriterQueueHigh)]
    #[case::queue_full(|s: &mut HealthSignals| s.audit_queue_pct = 100, SystemMode::Pause, ReasonCode::DbWriterQueueFull)]
    #[case::lag(|s: &mut HealthSignals| s.audit_writer_lag_ms = 5_000, SystemMode::Degrade, ReasonCode::DbWriterLagHigh)]
    #[case::drift_degrade(|s: &mut HealthSignals| s.drift_score_x10000 = 40_000, SystemMode::Degrade, ReasonCode::DriftDetected)]
    #[case::drift_pause(|s: &mut HealthSignals| s.drift_score_x10000 = 120_000, SystemMode::Pause, ReasonCode::DriftLimitExceeded)]
    #[case::exit(|s: &mut HealthSignals| s.force_exit_requested = true, SystemMode::Exit, ReasonCode::ForceExit)]
    fn test_single_signal(
        #[case] worsen: fn(&mut HealthSignals),
        #[case] mode: SystemMode,
        #[case] code: ReasonCode,
    ) {
        let mut s = healthy();
        worsen(&mut s);
        let a = assess(&s, &HealthThresholds::default());
        assert_eq!(a.mode, mode);
        assert_eq!(a.violations, vec![code]);
    }

    #[test]
    fn test_reasons_accumulate_worst_wins() {
        let mut s = healthy();
        s.ws_last_msg_ms = NOW - 11_000;
        s.audit_queue_pct = 100;
        s.audit_writer_lag_ms = 9_000;
        let report = HealthEvaluator::new(HealthThresholds::default()).evaluate(&s);
        assert_eq!(report.mode, SystemMode::Pause);
        assert_eq!(
            report.reasons,
            vec![
                ReasonCode::WsStaleDegrade,
                ReasonCode::DbWriterQueueFull,
                ReasonCode::DbWriterLagHigh,
                ReasonCode::EnterPause,
            ]
        );
    }

    #[test]
    fn test_exit_is_terminal() {
        let mut eval = HealthEvaluator::new(HealthThresholds::default());
        let mut s = healthy();
        s.force_exit_requested = true;
        assert_eq!(eval.evaluate(&s).mode, SystemMode::Exit);

        let report = eval.evaluate(&healthy());
        assert_eq!(report.mode, SystemMode::Exit);
        assert_eq!(report.reasons, vec![ReasonCode::EnterExit]);
    }

    fn signals() -> impl Strategy<Value = HealthSignals> {
        (
            0i64..1_000_000,
            0i64..1_000_000,
            0i64..1_000_000,
            0u64..4 * 1024 * 1024 * 1024,
            0u64..=100,
            0u64..10_000,
            0i64..=1_000_000,
        )
            .prop_map(|(loop_age, ws_age, rest_age, disk, queue, lag, drift)| HealthSignals {
                now_ms: NOW,
                last_loop_progress_ms: NOW - loop_age,
                ws_last_msg_ms: NOW - ws_age,
                rest_last_success_ms: NOW - rest_age,
                disk_free_bytes: disk,
                audit_queue_pct: queue,
                audit_writer_lag_ms: lag,
                drift_score_x10000: drift,
                force_exit_requested: false,
            })
    }

    proptest! {
        #[test]
        fn prop_worsening_one_signal_never_lowers_mode(
            s in signals(),
            which in 0usize..7,
            by in 1u64..1_000_000,
        ) {
            let t = HealthThresholds::default();
            let before = assess(&s, &t).mode;
            let mut worse = s;
            let step = i64::try_from(by).unwrap();
            match which {
                0 => worse.last_loop_progress_ms -= step,
                1 => worse.ws_last_msg_ms -= step,
                2 => worse.rest_last_success_ms -= step,
                3 => worse.disk_free_bytes = worse.disk_free_bytes.saturating_sub(by),
                4 => worse.audit_queue_pct = (worse.audit_queue_pct + by).min(100),
                5 => worse.audit_writer_lag_ms += by,
                _ => worse.drift_score_x10000 += step,
            }
            prop_assert!(assess(&worse, &t).mode >= before);
        }
    }
}
