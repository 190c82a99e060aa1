//! Process-wide system mode
//!
//! Written only by the health supervisor, read by the orchestrator before
//! every stage. EXIT is absorbing.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Supervisory mode, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    /// Full pipeline
    Normal = 0,
    /// Observe and propose, never execute
    Degrade = 1,
    /// Keep state fresh only
    Pause = 2,
    /// Terminal
    Exit = 3,
}

impl SystemMode {
    /// Wire representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Degrade => "DEGRADE",
            Self::Pause => "PAUSE",
            Self::Exit => "EXIT",
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Degrade,
            2 => Self::Pause,
            _ => Self::Exit,
        }
    }

    /// Whether `stage` may run under this mode
    ///
    /// DEGRADE runs up to STRATEGY_PROPOSE, PAUSE up to STATE_UPDATE.
    /// Process-scoped stages and reconciliation run in every non-exit mode.
    #[must_use]
    pub fn permits(&self, stage: Stage) -> bool {
        let last = match self {
            Self::Normal => return true,
            Self::Exit => return stage == Stage::Shutdown,
            Self::Degrade => Stage::StrategyPropose,
            Self::Pause => Stage::StateUpdate,
        };
        if stage.is_process_scoped()
            || matches!(stage, Stage::ReconcileRest | Stage::ReportDailySummary)
        {
            return true;
        }
        match (stage.sequence_index(), last.sequence_index()) {
            (Some(i), Some(limit)) => i <= limit,
            _ => false,
        }
    }

    /// Supervisory pseudo-stage recorded when stages are skipped
    #[must_use]
    pub const fn skip_stage(&self) -> Option<Stage> {
        match self {
            Self::Degrade => Some(Stage::Degrade),
            Self::Pause => Some(Stage::Pause),
            _ => None,
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared mode cell; non-blocking reads, EXIT never left
#[derive(Debug)]
pub struct SystemModeCell {
    mode: AtomicU8,
}

impl Default for SystemModeCell {
    fn default() -> Self {
        Self::new(SystemMode::Normal)
    }
}

impl SystemModeCell {
    /// Cell starting in `mode`
    #[must_use]
    pub const fn new(mode: SystemMode) -> Self {
        Self {
            mode: AtomicU8::new(mode as u8),
        }
    }

    /// Current mode
    #[must_use]
    pub fn get(&self) -> SystemMode {
        SystemMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Store `mode` unless already in EXIT; returns the previous mode
    pub fn set(&self, mode: SystemMode) -> SystemMode {
        let mut current = self.mode.load(Ordering::Acquire);
        loop {
            if current == SystemMode::Exit as u8 {
                return SystemMode::Exit;
            }
            match self.mode.compare_exchange_weak(
                current,
                mode as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return SystemMode::from_u8(prev),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_exit_is_absorbing() {
        let cell = SystemModeCell::default();
        assert_eq!(cell.set(SystemMode::Pause), SystemMode::Normal);
        assert_eq!(cell.set(SystemMode::Exit), SystemMode::Pause);
        assert_eq!(cell.set(SystemMode::Normal), SystemMode::Exit);
        assert_eq!(cell.get(), SystemMode::Exit);
    }

    #[rstest]
    #[case(SystemMode::Degrade, Stage::StrategyPropose, true)]
    #[case(SystemMode::Degrade, Stage::AigateCall, false)]
    #[case(SystemMode::Degrade, Stage::ExecuteIntent, false)]
    #[case(SystemMode::Pause, Stage::StateUpdate, true)]
    #[case(SystemMode::Pause, Stage::StrategyPropose, false)]
    #[case(SystemMode::Pause, Stage::ReconcileRest, true)]
    #[case(SystemMode::Exit, Stage::UniverseScan, false)]
    #[case(SystemMode::Exit, Stage::Shutdown, true)]
    #[case(SystemMode::Normal, Stage::ExecuteIntent, true)]
    fn test_stage_gating(#[case] mode: SystemMode, #[case] stage: Stage, #[case] allowed: bool) {
        assert_eq!(mode.permits(stage), allowed);
    }

    #[test]
    fn test_severity_order() {
        assert!(SystemMode::Normal < SystemMode::Degrade);
        assert!(SystemMode::Degrade < SystemMode::Pause);
        assert!(SystemMode::Pause < SystemMode::Exit);
    }
}
