//! `ai_gate_events` rows

use crate::error::StoreResult;
use crate::store::Store;
use sqlx::Row;

/// One advisory-gate call as persisted; JSON columns are already redacted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AiGateEventRow {
    /// Process run
    pub run_id: String,
    /// Cycle
    pub cycle_id: String,
    /// Always `LIVE`
    pub mode: String,
    /// Emitting stage
    pub stage: String,
    /// Always `AIGATE_CALL`
    pub event_type: String,
    /// Reviewed snapshot
    pub snapshot_id: String,
    /// Its hash
    pub snapshot_hash: String,
    /// Reviewed decision
    pub decision_id: String,
    /// Hash of the request payload
    pub input_hash: String,
    /// Gate was enabled for this call
    pub enabled: bool,
    /// Final verdict
    pub verdict: String,
    /// Reason codes
    pub reasons: Vec<String>,
    /// Model name
    pub model: String,
    /// Round-trip latency
    pub latency_ms: i64,
    /// SHA-256 of the raw response text
    pub raw_hash: Option<String>,
    /// Redacted request
    pub request_json_redacted: Option<String>,
    /// Redacted response
    pub response_json_redacted: Option<String>,
    /// Redacted modified decision
    pub modified_decision_json_redacted: Option<String>,
    /// MODIFY was accepted and applied
    pub modify_applied: bool,
    /// Local error kind when the verdict is ERROR
    pub error_code: Option<String>,
    /// Redacted error detail
    pub error_detail_redacted: Option<String>,
    /// Exchange time of the snapshot
    pub exchange_time_ms: Option<i64>,
    /// Local receive time of the snapshot
    pub local_received_ms: Option<i64>,
}

/// Insert one advisory-gate event
///
/// # Errors
///
/// Returns an error if the insert fails.
pub async fn insert_ai_gate_event(store: &Store, row: &AiGateEventRow, created_at_ms: i64) -> StoreResult<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO ai_gate_events (
            run_id, cycle_id, mode, stage, event_type, snapshot_id, snapshot_hash,
            decision_id, input_hash, enabled, verdict, reasons_json, model, latency_ms,
            raw_hash, request_json_redacted, response_json_redacted,
            modified_decision_json_redacted, modify_applied, error_code,
            error_detail_redacted, exchange_time_ms, local_received_ms, created_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&row.run_id)
    .bind(&row.cycle_id)
    .bind(&row.mode)
    .bind(&row.stage)
    .bind(&row.event_type)
    .bind(&row.snapshot_id)
    .bind(&row.snapshot_hash)
    .bind(&row.decision_id)
    .bind(&row.input_hash)
    .bind(row.enabled)
    .bind(&row.verdict)
    .bind(serde_json::to_string(&row.reasons)?)
    .bind(&row.model)
    .bind(row.latency_ms)
    .bind(&row.raw_hash)
    .bind(&row.request_json_redacted)
    .bind(&row.response_json_redacted)
    .bind(&row.modified_decision_json_redacted)
    .bind(row.modify_applied)
    .bind(&row.error_code)
    .bind(&row.error_detail_redacted)
    .bind(row.exchange_time_ms)
    .bind(row.local_received_ms)
    .bind(created_at_ms)
    .execute(store.pool())
    .await?;
    Ok(result.last_insert_rowid())
}

/// Verdicts recorded for `decision_id`, oldest first
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn verdicts_for_decision(store: &Store, decision_id: &str) -> StoreResult<Vec<(String, bool)>> {
    let rows = sqlx::query("SELECT verdict, modify_applied FROM ai_gate_events WHERE decision_id = ? ORDER BY id ASC")
        .bind(decision_id)
        .fetch_all(store.pool())
        .await?;
    rows.iter()
        .map(|r| -> StoreResult<(String, bool)> { Ok((r.try_get("verdict")?, r.try_get("modify_applied")?)) })
        .collect()
}
