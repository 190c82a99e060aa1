//! Order intents
//!
//! An order intent is the persisted record of a remote mutation the agent
//! wants to perform. Its id is content-addressed, so replaying a cycle
//! re-derives the same id and the same exchange dedup key.

use crate::canonical::canonical_hash;
use crate::closed_set;
use crate::error::CommonResult;
use crate::ids::client_order_id;
use crate::model::decision::{Decision, DecisionIntent, Side};
use crate::model::market::DecisionConstraints;
use serde::{Deserialize, Serialize};

closed_set! {
    /// Remote mutation kind
    pub enum IntentAction: "intent_action" {
        NewOrder => "NEW_ORDER",
        CancelOrder => "CANCEL_ORDER",
        CancelReplace => "CANCEL_REPLACE",
        OcoCreate => "OCO_CREATE",
    }
}

closed_set! {
    /// Ledger state
    pub enum IntentState: "intent_state" {
        Created => "CREATED",
        SentUnknown => "SENT_UNKNOWN",
        Confirmed => "CONFIRMED",
        NotFound => "NOT_FOUND",
        FailedTerminal => "FAILED_TERMINAL",
    }
}

impl IntentState {
    /// States reachable from `self`
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [IntentState] {
        match self {
            Self::Created => &[Self::Confirmed, Self::SentUnknown, Self::FailedTerminal],
            Self::SentUnknown => &[Self::Confirmed, Self::NotFound, Self::SentUnknown],
            Self::Confirmed | Self::NotFound | Self::FailedTerminal => &[],
        }
    }

    /// Whether `self -> next` is allowed
    #[must_use]
    pub fn can_transition_to(&self, next: IntentState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Absorbing states
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::NotFound | Self::FailedTerminal)
    }

    /// States from which `next` may be entered; used by non-regressing updates
    #[must_use]
    pub fn predecessors(next: IntentState) -> Vec<IntentState> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

/// Content that defines an order intent id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntentKey {
    /// Always `LIVE`
    pub mode: String,
    /// Symbol
    pub symbol: String,
    /// Side
    pub side: Side,
    /// Decision intent
    pub intent: DecisionIntent,
    /// Entry quantity
    pub entry_qty: String,
    /// Entry limit price
    pub entry_limit_price: String,
    /// Take-profit price
    pub exit_tp: String,
    /// Stop-loss price
    pub exit_sl: String,
    /// Snapshot the decision came from
    pub snapshot_hash: String,
    /// Exchange constraints
    pub constraints: DecisionConstraints,
}

impl OrderIntentKey {
    /// Key fields of a decision; absent plans contribute empty strings
    #[must_use]
    pub fn from_decision(decision: &Decision) -> Self {
        let (entry_qty, entry_limit_price) = decision
            .entry
            .as_ref()
            .map(|e| (e.qty.clone(), e.limit_price.clone()))
            .unwrap_or_default();
        let (exit_tp, exit_sl) = decision
            .exit
            .as_ref()
            .map(|x| (x.tp_price.clone(), x.sl_price.clone()))
            .unwrap_or_default();
        Self {
            mode: decision.mode.clone(),
            symbol: decision.symbol.clone(),
            side: decision.side,
            intent: decision.intent,
            entry_qty,
            entry_limit_price,
            exit_tp,
            exit_sl,
            snapshot_hash: decision.snapshot_hash.clone(),
            constraints: decision.constraints.clone(),
        }
    }

    /// `oi_` + canonical hash of the key
    pub fn intent_id(&self) -> CommonResult<String> {
        Ok(format!("oi_{}", canonical_hash(self)?))
    }
}

/// `oi_` id for a decision
pub fn order_intent_id(decision: &Decision) -> CommonResult<String> {
    OrderIntentKey::from_decision(decision).intent_id()
}

/// Persisted order intent row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Content-addressed id
    pub order_intent_id: String,
    /// Process run
    pub run_id: String,
    /// Cycle
    pub cycle_id: String,
    /// Always `LIVE`
    pub mode: String,
    /// Originating decision
    pub decision_id: String,
    /// Symbol
    pub symbol: String,
    /// Mutation kind
    pub action: IntentAction,
    /// Exchange dedup id derived from the intent id
    pub client_order_id: String,
    /// Canonical JSON of the request
    pub intent_payload_json: String,
    /// Ledger state
    pub state: IntentState,
    /// Remote order id once known
    pub exchange_order_id: Option<String>,
    /// Remote OCO list id once known
    pub exchange_oco_id: Option<String>,
    /// Last error code
    pub last_error_code: Option<String>,
    /// Last error detail, redacted
    pub last_error_detail_redacted: Option<String>,
    /// Creation time
    pub created_at_ms: i64,
    /// Last update time
    pub updated_at_ms: i64,
}

impl OrderIntent {
    /// Fresh CREATED intent; the client order id is derived from `order_intent_id`
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn created(
        order_intent_id: String,
        run_id: &str,
        cycle_id: &str,
        decision_id: &str,
        symbol: &str,
        action: IntentAction,
        intent_payload_json: String,
        now_ms: i64,
    ) -> Self {
        Self {
            client_order_id: client_order_id(&order_intent_id),
            order_intent_id,
            run_id: run_id.to_string(),
            cycle_id: cycle_id.to_string(),
            mode: crate::MODE_LIVE.to_string(),
            decision_id: decision_id.to_string(),
            symbol: symbol.to_string(),
            action,
            intent_payload_json,
            state: IntentState::Created,
            exchange_order_id: None,
            exchange_oco_id: None,
            last_error_code: None,
            last_error_detail_redacted: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}
