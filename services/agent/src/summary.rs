//! Daily summary
//!
//! At the first cycle of a new UTC day the previous day is summarized from
//! the intent ledger and the audit trail and written back as a
//! DAILY_SUMMARY record. Shutdown writes the partial summary of the day.

use anyhow::{Context, Result};
use chrono::DateTime;
use common::{EventType, ReasonCode, Stage};
use serde::Serialize;
use std::collections::BTreeMap;
use storage::audit::{count_events, count_events_with_reason};
use storage::{AuditRecord, AuditWriter, IntentLedger, Store, StoreResult};
use tracing::info;

const DAY_MS: i64 = 86_400_000;

/// Activity of one UTC day
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    /// `YYYY-MM-DD`
    pub day: String,
    /// Window start, inclusive
    pub from_ms: i64,
    /// Window end, exclusive
    pub to_ms: i64,
    /// Intents created in the window by current state
    pub intents_by_state: BTreeMap<String, i64>,
    /// Decisions proposed
    pub decisions: i64,
    /// Risk verdicts that blocked an entry
    pub risk_blocks: i64,
    /// Advisory gate calls
    pub aigate_calls: i64,
    /// Advisory gate blocks
    pub aigate_blocks: i64,
    /// Reconciliation alerts
    pub drift_alerts: i64,
    /// True when the window was cut short
    pub partial: bool,
}

impl DailySummary {
    /// Summarize `[from_ms, to_ms)` from the ledger and the audit trail
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn collect(store: &Store, from_ms: i64, to_ms: i64) -> StoreResult<Self> {
        let day = DateTime::from_timestamp_millis(from_ms)
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let intents_by_state = IntentLedger::new(store.clone())
            .counts_by_state(from_ms, to_ms)
            .await?
            .into_iter()
            .map(|(state, n)| (state.as_str().to_string(), n))
            .collect();

        let verdicts = count_events(store, EventType::RiskVerdict, from_ms, to_ms).await?;
        let allows = count_events_with_reason(store, EventType::RiskVerdict, ReasonCode::RiskAllow, from_ms, to_ms).await?;
        let passed =
            count_events_with_reason(store, EventType::RiskVerdict, ReasonCode::RiskNotEntry, from_ms, to_ms).await?;

        Ok(Self {
            day,
            from_ms,
            to_ms,
            intents_by_state,
            decisions: count_events(store, EventType::DecisionProposed, from_ms, to_ms).await?,
            risk_blocks: verdicts - allows - passed,
            aigate_calls: count_events(store, EventType::AigateCall, from_ms, to_ms).await?,
            aigate_blocks: count_events_with_reason(store, EventType::AigateCall, ReasonCode::AigateBlocked, from_ms, to_ms)
                .await?,
            drift_alerts: count_events(store, EventType::AlertRaised, from_ms, to_ms).await?,
            partial: false,
        })
    }

    /// Write as a DAILY_SUMMARY record at `stage`
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be made durable.
    pub async fn write(&self, audit: &AuditWriter, run_id: &str, cycle_id: &str, stage: Stage, now_ms: i64) -> Result<()> {
        let data = serde_json::to_value(self).context("daily summary payload")?;
        audit
            .write(
                AuditRecord::new(
                    now_ms,
                    run_id,
                    cycle_id,
                    stage,
                    EventType::DailySummary,
                    vec![ReasonCode::DailySummary],
                )
                .with_data(data),
            )
            .await
            .context("DAILY_SUMMARY")?;
        info!(day = %self.day, decisions = self.decisions, risk_blocks = self.risk_blocks, partial = self.partial, "daily summary written");
        Ok(())
    }
}

/// Detects UTC day changes between cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryTracker {
    day: Option<i64>,
}

impl SummaryTracker {
    /// `[from, to)` of the day that ended since the last call, if any
    ///
    /// The first call only records the current day.
    pub fn roll(&mut self, now_ms: i64) -> Option<(i64, i64)> {
        let today = now_ms.div_euclid(DAY_MS);
        match self.day.replace(today) {
            Some(prev) if prev < today => Some((prev * DAY_MS, (prev + 1) * DAY_MS)),
            _ => None,
        }
    }

    /// Start of the current day, once known
    #[must_use]
    pub fn day_start_ms(&self) -> Option<i64> {
        self.day.map(|d| d * DAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::AuditConfig;
    use common::ManualClock;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const DAY0: i64 = 19_700 * DAY_MS;
    const RUN: &str = "run_20231114_000000_000001";
    const CYC: &str = "cyc_20231114_000000_000002";

    #[test]
    fn test_tracker_reports_the_finished_day_once() {
        let mut t = SummaryTracker::default();
        assert_eq!(t.roll(DAY0 + 5), None);
        assert_eq!(t.roll(DAY0 + 60_000), None);
        assert_eq!(t.roll(DAY0 + DAY_MS + 1), Some((DAY0, DAY0 + DAY_MS)));
        assert_eq!(t.roll(DAY0 + DAY_MS + 2), None);
        assert_eq!(t.day_start_ms(), Some(DAY0 + DAY_MS));
    }

    #[tokio::test]
    async fn test_collect_counts_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("agent.db"), 2_000).await.unwrap();
        store.migrate().await.unwrap();
        let cfg = AuditConfig {
            dir: dir.path().join("audit"),
            ..AuditConfig::default()
        };
        let audit = AuditWriter::spawn(store.clone(), &cfg.dir, &cfg, Arc::new(ManualClock::new(DAY0)))
            .await
            .unwrap();
        let event = |ts, event_type, reasons| AuditRecord::new(ts, RUN, CYC, Stage::RiskVerdict, event_type, reasons);
        for record in [
            event(DAY0 + 1, EventType::DecisionProposed, vec![ReasonCode::StratEntryPullbackTrend]),
            event(DAY0 + 2, EventType::RiskVerdict, vec![ReasonCode::RiskAllow]),
            event(DAY0 + 3, EventType::RiskVerdict, vec![ReasonCode::RiskMaxOpenOrders]),
            event(DAY0 + 4, EventType::RiskVerdict, vec![ReasonCode::RiskExposureLimit, ReasonCode::RiskDrawdownLimit]),
            event(DAY0 + DAY_MS, EventType::RiskVerdict, vec![ReasonCode::RiskMaxOpenOrders]),
        ] {
            audit.write(record).await.unwrap();
        }

        let summary = DailySummary::collect(&store, DAY0, DAY0 + DAY_MS).await.unwrap();
        assert_eq!(summary.day, "2023-12-09");
        assert_eq!(summary.decisions, 1);
        assert_eq!(summary.risk_blocks, 2);
        assert_eq!(summary.aigate_calls, 0);
        assert!(summary.intents_by_state.is_empty());

        summary.write(&audit, RUN, CYC, Stage::ReportDailySummary, DAY0 + DAY_MS + 5).await.unwrap();
        assert_eq!(count_events(&store, EventType::DailySummary, DAY0, DAY0 + 2 * DAY_MS).await.unwrap(), 1);
        audit.shutdown().await;
    }
}
