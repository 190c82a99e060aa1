//! Stage and event-type registries

use crate::closed_set;

closed_set! {
    /// Pipeline stages plus the two supervisory pseudo-stages
    pub enum Stage: "stage" {
        Boot => "BOOT",
        DoctorChecks => "DOCTOR_CHECKS",
        StartupRecover => "STARTUP_RECOVER",
        UniverseScan => "UNIVERSE_SCAN",
        RankTopn => "RANK_TOPN",
        DeepScan => "DEEP_SCAN",
        WatchlistAttach => "WATCHLIST_ATTACH",
        StateUpdate => "STATE_UPDATE",
        StrategyPropose => "STRATEGY_PROPOSE",
        AigateCall => "AIGATE_CALL",
        RiskVerdict => "RISK_VERDICT",
        ExecuteIntent => "EXECUTE_INTENT",
        PositionManage => "POSITION_MANAGE",
        ReconcileRest => "RECONCILE_REST",
        ReportDailySummary => "REPORT_DAILY_SUMMARY",
        Shutdown => "SHUTDOWN",
        Degrade => "DEGRADE",
        Pause => "PAUSE",
    }
}

impl Stage {
    /// The linear sequence one full cycle walks
    pub const DEFAULT_SEQUENCE: [Stage; 16] = [
        Stage::Boot,
        Stage::DoctorChecks,
        Stage::StartupRecover,
        Stage::UniverseScan,
        Stage::RankTopn,
        Stage::DeepScan,
        Stage::WatchlistAttach,
        Stage::StateUpdate,
        Stage::StrategyPropose,
        Stage::AigateCall,
        Stage::RiskVerdict,
        Stage::ExecuteIntent,
        Stage::PositionManage,
        Stage::ReconcileRest,
        Stage::ReportDailySummary,
        Stage::Shutdown,
    ];

    /// Stages run once per process rather than once per cycle
    #[must_use]
    pub const fn is_process_scoped(&self) -> bool {
        matches!(
            self,
            Self::Boot | Self::DoctorChecks | Self::StartupRecover | Self::Shutdown
        )
    }

    /// Position within the default sequence; supervisory stages have none
    #[must_use]
    pub fn sequence_index(&self) -> Option<usize> {
        Self::DEFAULT_SEQUENCE.iter().position(|s| s == self)
    }
}

closed_set! {
    /// Audit event types
    pub enum EventType: "event_type" {
        StageChanged => "STAGE_CHANGED",
        AigateCall => "AIGATE_CALL",
        ReconcileDiff => "RECONCILE_DIFF",
        AlertRaised => "ALERT_RAISED",
        OrderSubmit => "ORDER_SUBMIT",
        OrderCancel => "ORDER_CANCEL",
        OrderCancelReplace => "ORDER_CANCEL_REPLACE",
        IntentStateChanged => "INTENT_STATE_CHANGED",
        DbWriterBackpressure => "DB_WRITER_BACKPRESSURE",
        DiskHealthSample => "DISK_HEALTH_SAMPLE",
        UniverseEligibility => "UNIVERSE_ELIGIBILITY",
        RankTopn => "RANK_TOPN",
        DeepScan => "DEEP_SCAN",
        TopkSelection => "TOPK_SELECTION",
        FiltersRefreshed => "FILTERS_REFRESHED",
        WebuiRequest => "WEBUI_REQUEST",
        DecisionProposed => "DECISION_PROPOSED",
        RiskVerdict => "RISK_VERDICT",
        ProtectionInstall => "PROTECTION_INSTALL",
        SystemModeChanged => "SYSTEM_MODE_CHANGED",
        DailySummary => "DAILY_SUMMARY",
        DoctorResult => "DOCTOR_RESULT",
        Shutdown => "SHUTDOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_covers_pipeline_stages() {
        assert_eq!(Stage::DEFAULT_SEQUENCE.len(), 16);
        assert_eq!(Stage::DEFAULT_SEQUENCE[0], Stage::Boot);
        assert_eq!(Stage::DEFAULT_SEQUENCE[15], Stage::Shutdown);
        assert_eq!(Stage::Degrade.sequence_index(), None);
        assert_eq!(Stage::AigateCall.sequence_index(), Some(9));
        for (i, stage) in Stage::DEFAULT_SEQUENCE.iter().enumerate() {
            assert_eq!(Stage::ALL[i], *stage);
        }
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!("WARMUP".parse::<Stage>().is_err());
        assert_eq!("RANK_TOPN".parse::<Stage>().unwrap(), Stage::RankTopn);
    }
}
