//! Intent journal
//!
//! Wraps the intent ledger so that every state change of an order intent is
//! written to the ledger first and then to the audit trail. An audit record
//! is only produced for a transition the ledger actually applied.

use crate::error::OmsResult;
use common::model::{IntentAction, IntentState, OrderIntent};
use common::{Clock, EventType, ReasonCode, Stage};
use serde_json::{Value, json};
use std::sync::Arc;
use storage::{AuditRecord, AuditWriter, IntentLedger, RedactionPolicy, TransitionUpdate};
use tracing::{debug, info};

/// Stage that owns mutations of `action`
#[must_use]
pub const fn stage_for(action: IntentAction) -> Stage {
    match action {
        IntentAction::NewOrder | IntentAction::OcoCreate => Stage::ExecuteIntent,
        IntentAction::CancelOrder | IntentAction::CancelReplace => Stage::PositionManage,
    }
}

/// Ledger plus audit trail for order intents
#[derive(Clone)]
pub struct IntentJournal {
    ledger: IntentLedger,
    audit: Arc<AuditWriter>,
    redaction: RedactionPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IntentJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentJournal").finish_non_exhaustive()
    }
}

/// Result of opening an intent
#[derive(Debug, Clone)]
pub struct Opened {
    /// Stored row; an existing row is returned as stored
    pub intent: OrderIntent,
    /// Whether this call created the row
    pub inserted: bool,
}

impl IntentJournal {
    /// Journal over `ledger` writing to `audit`
    #[must_use]
    pub fn new(ledger: IntentLedger, audit: Arc<AuditWriter>, redaction: RedactionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            audit,
            redaction,
            clock,
        }
    }

    /// Underlying ledger
    #[must_use]
    pub const fn ledger(&self) -> &IntentLedger {
        &self.ledger
    }

    /// Current time of the journal's clock
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Error detail safe to persist
    #[must_use]
    pub fn redact_detail(&self, detail: &str) -> String {
        self.redaction
            .redact_text(detail)
            .unwrap_or_else(|e| format!("<REDACTION_REFUSED {e}>"))
    }

    /// JSON safe to persist; refused values become a marker string
    #[must_use]
    pub fn redact_json(&self, value: &Value) -> Value {
        self.redaction
            .redact(value)
            .unwrap_or_else(|e| Value::String(format!("<REDACTION_REFUSED {e}>")))
    }

    /// Insert `intent` unless its id is already ledgered
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or the audit trail fails.
    pub async fn open(&self, intent: &OrderIntent) -> OmsResult<Opened> {
        let (stored, inserted) = self.ledger.insert_if_absent(intent).await?;
        if inserted {
            self.audit_state(&stored, None, vec![ReasonCode::ExecSubmitted]).await?;
        } else {
            debug!(order_intent_id = %stored.order_intent_id, state = %stored.state, "intent already ledgered");
        }
        Ok(Opened {
            intent: stored,
            inserted,
        })
    }

    /// Move `intent` to `next` and audit the change
    ///
    /// Returns the reloaded row, or `None` when the stored state does not
    /// allow the transition (for example after a concurrent resolution).
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or the audit trail fails.
    pub async fn advance(
        &self,
        intent: &OrderIntent,
        next: IntentState,
        update: &TransitionUpdate,
        reason: ReasonCode,
    ) -> OmsResult<Option<OrderIntent>> {
        let now = self.clock.now_ms();
        if !self.ledger.transition(&intent.order_intent_id, next, update, now).await? {
            return Ok(None);
        }
        let Some(stored) = self.ledger.get(&intent.order_intent_id).await? else {
            return Ok(None);
        };
        if next != intent.state {
            info!(
                order_intent_id = %stored.order_intent_id,
                from = %intent.state,
                to = %next,
                reason = %reason,
                "intent state changed"
            );
        }
        self.audit_state(&stored, Some(intent.state), vec![reason]).await?;
        Ok(Some(stored))
    }

    async fn audit_state(&self, intent: &OrderIntent, from: Option<IntentState>, reasons: Vec<ReasonCode>) -> OmsResult<()> {
        let record = AuditRecord::new(
            self.clock.now_ms(),
            &intent.run_id,
            &intent.cycle_id,
            stage_for(intent.action),
            EventType::IntentStateChanged,
            reasons,
        )
        .with_decision(&intent.decision_id)
        .with_intent(&intent.order_intent_id)
        .with_data(json!({
            "symbol": intent.symbol,
            "action": intent.action.as_str(),
            "client_order_id": intent.client_order_id,
            "from_state": from.map(|s| s.as_str()),
            "to_state": intent.state.as_str(),
            "exchange_order_id": intent.exchange_order_id,
            "exchange_oco_id": intent.exchange_oco_id,
            "error_code": intent.last_error_code,
        }));
        self.audit.write(record).await?;
        Ok(())
    }

    /// Audit an exchange-facing event about `intent`
    ///
    /// # Errors
    ///
    /// Returns an error if the audit trail rejects the record.
    pub async fn record(
        &self,
        intent: &OrderIntent,
        stage: Stage,
        event_type: EventType,
        reasons: Vec<ReasonCode>,
        data: Value,
    ) -> OmsResult<()> {
        let record = AuditRecord::new(
            self.clock.now_ms(),
            &intent.run_id,
            &intent.cycle_id,
            stage,
            event_type,
            reasons,
        )
        .with_decision(&intent.decision_id)
        .with_intent(&intent.order_intent_id)
        .with_data(data);
        self.audit.write(record).await?;
        Ok(())
    }
}
