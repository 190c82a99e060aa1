//! Soak readiness
//!
//! A soak run samples health on a timer and is ready only while no degrade
//! or pause condition applies.

use crate::health::{HealthSignals, HealthThresholds, assess};
use common::{ReasonCode, SystemMode};
use serde::{Deserialize, Serialize};

/// Readiness at one soak tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoakReport {
    /// Sample time
    pub ts_ms: i64,
    /// Mode the sample maps to
    pub mode: SystemMode,
    /// Applicable degrade and pause codes
    pub violations: Vec<ReasonCode>,
    /// True when there are no violations
    pub ready: bool,
}

/// Evaluate one soak sample
#[must_use]
pub fn soak_tick(signals: &HealthSignals, thresholds: &HealthThresholds) -> SoakReport {
    let assessment = assess(signals, thresholds);
    SoakReport {
        ts_ms: signals.now_ms,
        mode: assessment.mode,
        ready: assessment.violations.is_empty(),
        violations: assessment.violations,
    }
}

/// Running totals over a soak
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoakSummary {
    /// Ticks evaluated
    pub ticks: u64,
    /// Ticks that were ready
    pub ready_ticks: u64,
    /// Every code seen at least once, in first-seen order
    pub seen: Vec<ReasonCode>,
}

impl SoakSummary {
    /// Fold one tick in
    pub fn record(&mut self, report: &SoakReport) {
        self.ticks += 1;
        if report.ready {
            self.ready_ticks += 1;
        }
        for code in &report.violations {
            common::reason::push_unique(&mut self.seen, *code);
        }
    }

    /// True when every tick so far was ready
    #[must_use]
    pub fn passed(&self) -> bool {
        self.ticks > 0 && self.ticks == self.ready_ticks
    }
}
