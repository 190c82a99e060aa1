//! Reason-code registry
//!
//! Every reason attached to an audit event, decision, risk verdict or
//! advisory response must be a member of this set.

use crate::closed_set;
use crate::error::{CommonError, CommonResult};

closed_set! {
    /// Closed registry of reason codes
    pub enum ReasonCode: "reason_code" {
        // Stage bookkeeping
        StageOk => "STAGE_OK",
        StageSkippedMode => "STAGE_SKIPPED_MODE",
        DryRun => "DRY_RUN",
        ShutdownRequested => "SHUTDOWN_REQUESTED",
        DoctorCheckFailed => "DOCTOR_CHECK_FAILED",
        DoctorOk => "DOCTOR_OK",
        RecoveryResolved => "RECOVERY_RESOLVED",
        TimeSyncResync => "TIME_SYNC_RESYNC",
        FiltersRefreshed => "FILTERS_REFRESHED",
        DailySummary => "DAILY_SUMMARY",

        // Universe
        UniverseEligible => "UNIVERSE_ELIGIBLE",
        UniverseSymbolNotTrading => "UNIVERSE_SYMBOL_NOT_TRADING",
        UniverseFiltersNotOk => "UNIVERSE_FILTERS_NOT_OK",
        UniverseWsNotOk => "UNIVERSE_WS_NOT_OK",
        UniverseQuarantined => "UNIVERSE_QUARANTINED",
        UniverseLowVolume => "UNIVERSE_LOW_VOLUME",
        UniverseLowTrades => "UNIVERSE_LOW_TRADES",
        UniverseLowPriceChange => "UNIVERSE_LOW_PRICE_CHANGE",

        // Rank / deep scan / top-K
        RankSelected => "RANK_SELECTED",
        RankTruncated => "RANK_TRUNCATED",
        DeepSpreadTooWide => "DEEP_SPREAD_TOO_WIDE",
        DeepImbalanceLow => "DEEP_IMBALANCE_LOW",
        DeepEdgeTooLow => "DEEP_EDGE_TOO_LOW",
        DeepPassed => "DEEP_PASSED",
        TopkSelected => "TOPK_SELECTED",
        TopkCorrLimit => "TOPK_CORR_LIMIT",
        TopkChurnGuardKept => "TOPK_CHURN_GUARD_KEPT",
        TopkCapacityReached => "TOPK_CAPACITY_REACHED",

        // Strategy
        StratEntryPullbackTrend => "STRAT_ENTRY_PULLBACK_TREND",
        StratEntryPullbackRange => "STRAT_ENTRY_PULLBACK_RANGE",
        StratRegimeWeak => "STRAT_REGIME_WEAK",
        StratPullbackOutOfBand => "STRAT_PULLBACK_OUT_OF_BAND",
        StratSpreadTooWide => "STRAT_SPREAD_TOO_WIDE",
        StratSpreadWidening => "STRAT_SPREAD_WIDENING",
        StratImbalanceLow => "STRAT_IMBALANCE_LOW",
        StratVolumeLow => "STRAT_VOLUME_LOW",
        StratExitInvalid => "STRAT_EXIT_INVALID",
        StratEdgeBelowMin => "STRAT_EDGE_BELOW_MIN",
        StratInputInvalid => "STRAT_INPUT_INVALID",
        StratSizeTooSmall => "STRAT_SIZE_TOO_SMALL",
        StratTrailingArmed => "STRAT_TRAILING_ARMED",
        StratFallbackEnabled => "STRAT_FALLBACK_ENABLED",

        // Risk
        RiskAllow => "RISK_ALLOW",
        RiskPositionAlreadyOpen => "RISK_POSITION_ALREADY_OPEN",
        RiskEntryAlreadyPending => "RISK_ENTRY_ALREADY_PENDING",
        SymbolQuarantined => "SYMBOL_QUARANTINED",
        RiskCooldownActive => "RISK_COOLDOWN_ACTIVE",
        RiskMaxTradesWindow => "RISK_MAX_TRADES_WINDOW",
        RiskMaxTradesDay => "RISK_MAX_TRADES_DAY",
        RiskMaxOpenOrders => "RISK_MAX_OPEN_ORDERS",
        RiskSymbolLossStreak => "RISK_SYMBOL_LOSS_STREAK",
        WsOooEvent => "WS_OOO_EVENT",
        RiskChurnLimitHit => "RISK_CHURN_LIMIT_HIT",
        RiskCancelReplaceLimitHit => "RISK_CANCEL_REPLACE_LIMIT_HIT",
        RiskUnfilledOrderCountRisk => "RISK_UNFILLED_ORDER_COUNT_RISK",
        RiskDailyLossLimit => "RISK_DAILY_LOSS_LIMIT",
        RiskDrawdownLimit => "RISK_DRAWDOWN_LIMIT",
        RiskExposureLimit => "RISK_EXPOSURE_LIMIT",
        RiskInsufficientFreeBalance => "RISK_INSUFFICIENT_FREE_BALANCE",
        RiskNotEntry => "RISK_NOT_ENTRY",

        // Protection / filters
        ProtectionInvalidFilter => "PROTECTION_INVALID_FILTER",
        ProtectionInvalidMinNotional => "PROTECTION_INVALID_MIN_NOTIONAL",
        ProtectionInstallFailed => "PROTECTION_INSTALL_FAILED",
        ProtectionInstalled => "PROTECTION_INSTALLED",

        // Advisory gate
        AigateDisabled => "AIGATE_DISABLED",
        AigateApproved => "AIGATE_APPROVED",
        AigateBlocked => "AIGATE_BLOCKED",
        AigateModified => "AIGATE_MODIFIED",
        AigateLowConfidence => "AIGATE_LOW_CONFIDENCE",
        AigateRiskTooHigh => "AIGATE_RISK_TOO_HIGH",
        AigateReduceSize => "AIGATE_REDUCE_SIZE",
        AigateTighterStop => "AIGATE_TIGHTER_STOP",
        AigateTimeout => "AIGATE_TIMEOUT",
        AigateParseFail => "AIGATE_PARSE_FAIL",
        AigateSchemaInvalid => "AIGATE_SCHEMA_INVALID",
        AigateReasonUnknown => "AIGATE_REASON_UNKNOWN",
        AigateModifyInvalid => "AIGATE_MODIFY_INVALID",
        AigateHttpError => "AIGATE_HTTP_ERROR",

        // Executor
        ExecSubmitted => "EXEC_SUBMITTED",
        ExecConfirmed => "EXEC_CONFIRMED",
        ExecRejected => "EXEC_REJECTED",
        ExecSentUnknown => "EXEC_SENT_UNKNOWN",
        ExecNotFound => "EXEC_NOT_FOUND",
        ExecCancelled => "EXEC_CANCELLED",
        ExecRepriced => "EXEC_REPRICED",
        ExecIntentReused => "EXEC_INTENT_REUSED",
        ExecRateLimited => "EXEC_RATE_LIMITED",

        // Health / supervisory
        LoopStuckDegrade => "LOOP_STUCK_DEGRADE",
        LoopStuckPause => "LOOP_STUCK_PAUSE",
        WsStaleDegrade => "WS_STALE_DEGRADE",
        WsStalePause => "WS_STALE_PAUSE",
        RestStaleDegrade => "REST_STALE_DEGRADE",
        RestStalePause => "REST_STALE_PAUSE",
        DiskLowDegrade => "DISK_LOW_DEGRADE",
        DiskLowPause => "DISK_LOW_PAUSE",
        DbWriterQueueHigh => "DB_WRITER_QUEUE_HIGH",
        DbWriterQueueFull => "DB_WRITER_QUEUE_FULL",
        DbWriterLagHigh => "DB_WRITER_LAG_HIGH",
        ForceExit => "FORCE_EXIT",
        EnterNormal => "ENTER_NORMAL",
        EnterDegrade => "ENTER_DEGRADE",
        EnterPause => "ENTER_PAUSE",
        EnterExit => "ENTER_EXIT",

        // Reconcile
        ReconcileOk => "RECONCILE_OK",
        DriftLimitExceeded => "DRIFT_LIMIT_EXCEEDED",
        DriftDetected => "DRIFT_DETECTED",
    }
}

impl ReasonCode {
    /// Parse a list of external strings, rejecting any unregistered code as schema-invalid
    pub fn parse_list(values: &[String]) -> CommonResult<Vec<Self>> {
        Ok(crate::registry::parse_all(values)?)
    }

    /// Wire strings of a list
    #[must_use]
    pub fn to_strings(codes: &[Self]) -> Vec<String> {
        codes.iter().map(|c| c.as_str().to_string()).collect()
    }
}

/// Reason lists carried by decisions and events must be non-empty
pub fn validate_reasons(codes: &[ReasonCode]) -> CommonResult<()> {
    if codes.is_empty() {
        return Err(CommonError::schema("reasons", "must not be empty"));
    }
    Ok(())
}

/// Append `code` unless already present
pub fn push_unique(codes: &mut Vec<ReasonCode>, code: ReasonCode) {
    if !codes.contains(&code) {
        codes.push(code);
    }
}
