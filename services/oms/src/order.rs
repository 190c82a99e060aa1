//! Order intents and the exchange requests they carry
//!
//! Every remote mutation is described by an [`IntentPayload`] stored as the
//! intent's canonical JSON. Intent ids are content-addressed, so the same
//! decision or the same stale-order action always lands on the same ledger
//! row and the same exchange dedup id.

use crate::error::{OmsError, OmsResult};
use crate::quantize::{QuantizeRequest, quantize_order};
use common::canonical::{canonical_hash, to_canonical_json};
use common::ids::{IntentVariant, client_order_id};
use common::model::decision::{Decision, DecisionIntent, EntryKind, ProtectionMode};
use common::model::intent::order_intent_id;
use common::model::{IntentAction, OrderIntent};
use feeds::{CancelReplaceRequest, OcoRequest, OrderRequest, OrderType, RemoteOrder};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Run and cycle an intent is created under
#[derive(Debug, Clone, Copy)]
pub struct IntentScope<'a> {
    /// Process run
    pub run_id: &'a str,
    /// Cycle
    pub cycle_id: &'a str,
}

/// Maker-window timing carried with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTiming {
    /// Time the order may rest before it is repriced or cancelled
    pub ttl_ms: i64,
    /// Reprice budget
    pub max_reprices: i64,
}

/// What an intent asks the exchange to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentPayload {
    /// Place an entry order
    NewOrder {
        /// Order
        request: OrderRequest,
        /// Maker window
        timing: EntryTiming,
        /// Protection to install once the order fills, sized to the full entry
        protection: Option<OcoRequest>,
    },
    /// Cancel a resting order
    CancelOrder {
        /// Symbol
        symbol: String,
        /// Client id of the order to cancel
        target_client_order_id: String,
    },
    /// Cancel a resting order and post its replacement
    CancelReplace {
        /// Exchange request
        request: CancelReplaceRequest,
        /// Entry intent the chain started from
        origin_intent_id: String,
        /// 1 for the first reprice of the origin, 2 for the next
        reprice_n: i64,
        /// Maker window of the replacement
        timing: EntryTiming,
    },
    /// Install OCO protection
    OcoCreate {
        /// Exchange request
        request: OcoRequest,
    },
}

impl IntentPayload {
    /// Ledger action for this payload
    #[must_use]
    pub const fn action(&self) -> IntentAction {
        match self {
            Self::NewOrder { .. } => IntentAction::NewOrder,
            Self::CancelOrder { .. } => IntentAction::CancelOrder,
            Self::CancelReplace { .. } => IntentAction::CancelReplace,
            Self::OcoCreate { .. } => IntentAction::OcoCreate,
        }
    }

    /// Symbol the mutation applies to
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::NewOrder { request, .. } => &request.symbol,
            Self::CancelOrder { symbol, .. } => symbol,
            Self::CancelReplace { request, .. } => &request.new_order.symbol,
            Self::OcoCreate { request } => &request.symbol,
        }
    }

    /// Client id whose remote state tells whether the mutation took effect
    #[must_use]
    pub fn lookup_client_order_id(&self) -> &str {
        match self {
            Self::NewOrder { request, .. } => &request.client_order_id,
            Self::CancelOrder {
                target_client_order_id, ..
            } => target_client_order_id,
            Self::CancelReplace { request, .. } => &request.new_order.client_order_id,
            Self::OcoCreate { request } => &request.take_profit_client_order_id,
        }
    }

    /// Whether `remote`, found by probing, shows the mutation took effect
    #[must_use]
    pub fn is_effected_by(&self, remote: &RemoteOrder) -> bool {
        match self {
            Self::CancelOrder { .. } => !remote.is_open(),
            _ => true,
        }
    }

    /// Canonical JSON stored as `intent_payload_json`
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be canonicalized.
    pub fn to_json(&self) -> OmsResult<String> {
        Ok(to_canonical_json(self)?)
    }

    /// Payload of a stored intent
    ///
    /// # Errors
    ///
    /// Returns an error if the stored JSON does not parse or disagrees with
    /// the intent's action.
    pub fn from_intent(intent: &OrderIntent) -> OmsResult<Self> {
        let payload: Self = serde_json::from_str(&intent.intent_payload_json)
            .map_err(|e| OmsError::InvalidInput(format!("{}: payload: {e}", intent.order_intent_id)))?;
        if payload.action() != intent.action {
            return Err(OmsError::InvalidInput(format!(
                "{}: payload action {} but intent action {}",
                intent.order_intent_id,
                payload.action(),
                intent.action
            )));
        }
        Ok(payload)
    }

    fn into_intent(self, id: String, scope: IntentScope<'_>, decision_id: &str, now_ms: i64) -> OmsResult<OrderIntent> {
        let json = self.to_json()?;
        Ok(OrderIntent::created(
            id,
            scope.run_id,
            scope.cycle_id,
            decision_id,
            self.symbol(),
            self.action(),
            json,
            now_ms,
        ))
    }
}

/// Exchange request for a decision's entry plan, quantized onto its constraints
///
/// # Errors
///
/// Returns an error if the decision is not an entry, its client id does not
/// derive from its intent id, or quantization fails.
pub fn entry_request(decision: &Decision) -> OmsResult<OrderRequest> {
    if decision.intent != DecisionIntent::Entry {
        return Err(OmsError::InvalidInput(format!("{} is not an entry", decision.decision_id)));
    }
    let entry = decision
        .entry
        .as_ref()
        .ok_or_else(|| OmsError::InvalidInput(format!("{} has no entry plan", decision.decision_id)))?;
    let expected = client_order_id(&order_intent_id(decision)?);
    if entry.client_order_id != expected {
        return Err(OmsError::InvalidInput(format!(
            "{}: entry client id does not derive from the intent id",
            decision.decision_id
        )));
    }
    let q = quantize_order(
        &QuantizeRequest {
            price: entry.limit_price.clone(),
            qty: entry.qty.clone(),
            trailing_delta_bips: 0,
        },
        &decision.constraints,
    )?;
    let (order_type, time_in_force, price) = match entry.kind {
        EntryKind::MakerFirst => (OrderType::LimitMaker, None, Some(q.price)),
        EntryKind::Taker => (OrderType::Limit, Some(entry.time_in_force.as_str().to_string()), Some(q.price)),
        EntryKind::Market => (OrderType::Market, None, None),
    };
    Ok(OrderRequest {
        symbol: decision.symbol.clone(),
        side: decision.side,
        order_type,
        time_in_force,
        price,
        quantity: q.qty,
        client_order_id: entry.client_order_id.clone(),
    })
}

/// CREATED intent for a decision's entry
///
/// # Errors
///
/// Returns an error if [`entry_request`] fails.
pub fn entry_intent(scope: IntentScope<'_>, decision: &Decision, now_ms: i64) -> OmsResult<OrderIntent> {
    let request = entry_request(decision)?;
    let timing = decision.entry.as_ref().map_or(
        EntryTiming {
            ttl_ms: 0,
            max_reprices: 0,
        },
        |e| EntryTiming {
            ttl_ms: e.ttl_ms,
            max_reprices: e.max_reprices,
        },
    );
    let protection = match &decision.exit {
        Some(_) => Some(oco_request(decision, &request.quantity)?),
        None => None,
    };
    IntentPayload::NewOrder {
        request,
        timing,
        protection,
    }
    .into_intent(order_intent_id(decision)?, scope, &decision.decision_id, now_ms)
}

/// OCO protection for a filled entry of `filled_qty`
///
/// Opposite side, TP limit at the exit TP, stop and stop-limit at the SL.
///
/// # Errors
///
/// Returns an error if the decision has no OCO exit plan or a leg fails
/// quantization.
pub fn oco_request(decision: &Decision, filled_qty: &str) -> OmsResult<OcoRequest> {
    let exit = decision
        .exit
        .as_ref()
        .ok_or_else(|| OmsError::InvalidInput(format!("{} has no exit plan", decision.decision_id)))?;
    if exit.protection != ProtectionMode::Oco {
        return Err(OmsError::InvalidInput(format!(
            "{}: protection {} is not installed by the executor",
            decision.decision_id, exit.protection
        )));
    }
    let leg = |price: &str| {
        quantize_order(
            &QuantizeRequest {
                price: price.to_string(),
                qty: filled_qty.to_string(),
                trailing_delta_bips: 0,
            },
            &decision.constraints,
        )
    };
    let tp = leg(&exit.tp_price)?;
    let sl = leg(&exit.sl_price)?;
    let parent = order_intent_id(decision)?;
    Ok(OcoRequest {
        symbol: decision.symbol.clone(),
        side: decision.side.opposite(),
        quantity: tp.qty,
        take_profit_price: tp.price,
        stop_price: sl.price.clone(),
        stop_limit_price: sl.price,
        list_client_order_id: client_order_id(&IntentVariant::Oco.intent_id(&parent)),
        take_profit_client_order_id: exit.tp_client_order_id.clone(),
        stop_client_order_id: exit.sl_client_order_id.clone(),
    })
}

/// CREATED OCO_CREATE intent; its id is the entry intent id plus `_OCO`
///
/// # Errors
///
/// Returns an error if [`oco_request`] fails.
pub fn oco_intent(scope: IntentScope<'_>, decision: &Decision, filled_qty: &str, now_ms: i64) -> OmsResult<OrderIntent> {
    let request = oco_request(decision, filled_qty)?;
    let id = IntentVariant::Oco.intent_id(&order_intent_id(decision)?);
    IntentPayload::OcoCreate { request }.into_intent(id, scope, &decision.decision_id, now_ms)
}

/// CREATED OCO_CREATE intent from the protection stored with an entry
///
/// `filled_qty` replaces the planned quantity when the entry filled only
/// partially; exchange fills are already on the step grid.
///
/// # Errors
///
/// Returns an error if `entry` is not a NEW_ORDER intent or carries no
/// protection.
pub fn protection_intent(scope: IntentScope<'_>, entry: &OrderIntent, filled_qty: &str, now_ms: i64) -> OmsResult<OrderIntent> {
    let IntentPayload::NewOrder {
        protection: Some(plan), ..
    } = IntentPayload::from_intent(entry)?
    else {
        return Err(OmsError::InvalidInput(format!(
            "{} carries no protection plan",
            entry.order_intent_id
        )));
    };
    let request = OcoRequest {
        quantity: filled_qty.to_string(),
        ..plan
    };
    let id = IntentVariant::Oco.intent_id(&entry.order_intent_id);
    IntentPayload::OcoCreate { request }.into_intent(id, scope, &entry.decision_id, now_ms)
}

/// CREATED CANCEL_ORDER intent for a resting order
///
/// # Errors
///
/// Returns an error if the payload cannot be canonicalized.
pub fn cancel_intent(
    scope: IntentScope<'_>,
    decision_id: &str,
    symbol: &str,
    target_client_order_id: &str,
    now_ms: i64,
) -> OmsResult<OrderIntent> {
    let id = format!(
        "oi_{}",
        canonical_hash(&json!({
            "action": IntentAction::CancelOrder.as_str(),
            "symbol": symbol,
            "target": target_client_order_id,
        }))?
    );
    IntentPayload::CancelOrder {
        symbol: symbol.to_string(),
        target_client_order_id: target_client_order_id.to_string(),
    }
    .into_intent(id, scope, decision_id, now_ms)
}

/// Inputs of one reprice in a stale-entry chain
#[derive(Debug, Clone)]
pub struct Reprice<'a> {
    /// Entry intent the chain started from
    pub origin_intent_id: &'a str,
    /// Order currently resting
    pub live: &'a OrderRequest,
    /// Replacement price, before quantization
    pub new_price: &'a str,
    /// Position in the chain, from 1
    pub reprice_n: i64,
    /// Maker window of the replacement
    pub timing: EntryTiming,
}

/// CREATED CANCEL_REPLACE intent; the replacement's client id derives from
/// the new intent id
///
/// # Errors
///
/// Returns an error if the new price fails quantization.
pub fn cancel_replace_intent(
    scope: IntentScope<'_>,
    decision_id: &str,
    reprice: &Reprice<'_>,
    constraints: &common::model::DecisionConstraints,
    now_ms: i64,
) -> OmsResult<OrderIntent> {
    let q = quantize_order(
        &QuantizeRequest {
            price: reprice.new_price.to_string(),
            qty: reprice.live.quantity.clone(),
            trailing_delta_bips: 0,
        },
        constraints,
    )?;
    let id = format!(
        "oi_{}",
        canonical_hash(&json!({
            "action": IntentAction::CancelReplace.as_str(),
            "origin": reprice.origin_intent_id,
            "target": reprice.live.client_order_id,
            "price": q.price,
            "qty": q.qty,
            "reprice_n": reprice.reprice_n,
        }))?
    );
    let new_order = OrderRequest {
        price: Some(q.price),
        quantity: q.qty,
        client_order_id: client_order_id(&id),
        ..reprice.live.clone()
    };
    IntentPayload::CancelReplace {
        request: CancelReplaceRequest {
            cancel_client_order_id: reprice.live.client_order_id.clone(),
            new_order,
        },
        origin_intent_id: reprice.origin_intent_id.to_string(),
        reprice_n: reprice.reprice_n,
        timing: reprice.timing,
    }
    .into_intent(id, scope, decision_id, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::StrategyConfig;
    use common::ids::CLIENT_ORDER_ID_LEN;
    use common::model::IntentState;
    use common::model::decision::Side;
    use common::model::market::fixtures::btc_filters;
    use common::model::snapshot::fixtures::{T0, trend_snapshot};
    use engine::{Proposal, propose_entry};
    use pretty_assertions::assert_eq;

    const SCOPE: IntentScope<'static> = IntentScope {
        run_id: "run_1",
        cycle_id: "cyc_1",
    };

    fn decision() -> Decision {
        let cfg = StrategyConfig {
            pullback_max_bps: 150,
            ..StrategyConfig::default()
        };
        let c = btc_filters().to_constraints().unwrap();
        match propose_entry(&cfg, &trend_snapshot(), &c, "cyc_1", T0).unwrap() {
            Proposal::Entry(d) => *d,
            Proposal::NoTrade { reasons, .. } => panic!("{reasons:?}"),
        }
    }

    #[test]
    fn test_entry_intent_ids_line_up() {
        let d = decision();
        let oi = entry_intent(SCOPE, &d, T0).unwrap();
        assert_eq!(oi.order_intent_id, order_intent_id(&d).unwrap());
        assert_eq!(oi.client_order_id, d.entry.as_ref().unwrap().client_order_id);
        assert_eq!(oi.client_order_id.len(), CLIENT_ORDER_ID_LEN);
        assert_eq!(oi.state, IntentState::Created);
        assert_eq!(oi.action, IntentAction::NewOrder);

        let IntentPayload::NewOrder { request, protection, .. } = IntentPayload::from_intent(&oi).unwrap() else {
            panic!("wrong payload");
        };
        assert_eq!(request.order_type, OrderType::LimitMaker);
        assert_eq!(request.price.as_deref(), Some("104.00"));
        assert_eq!(request.quantity, "4.807");
        assert_eq!(request.client_order_id, oi.client_order_id);
        assert_eq!(protection.unwrap().quantity, "4.807");
    }

    #[test]
    fn test_entry_ids_are_replay_stable() {
        let a = entry_intent(SCOPE, &decision(), T0).unwrap();
        let b = entry_intent(SCOPE, &decision(), T0 + 5).unwrap();
        assert_eq!(a.order_intent_id, b.order_intent_id);
        assert_eq!(a.client_order_id, b.client_order_id);
    }

    #[test]
    fn test_tampered_client_id_rejected() {
        let mut d = decision();
        d.entry.as_mut().unwrap().client_order_id = format!("X_{}", "A".repeat(34));
        assert!(matches!(entry_request(&d), Err(OmsError::InvalidInput(_))));
    }

    #[test]
    fn test_oco_mirrors_exit_plan() {
        let d = decision();
        let oco = oco_intent(SCOPE, &d, "4.807", T0).unwrap();
        assert_eq!(oco.order_intent_id, format!("{}_OCO", order_intent_id(&d).unwrap()));
        let IntentPayload::OcoCreate { request } = IntentPayload::from_intent(&oco).unwrap() else {
            panic!("wrong payload");
        };
        assert_eq!(request.side, Side::Sell);
        assert_eq!(request.quantity, "4.807");
        assert_eq!(request.take_profit_price, "108.16");
        assert_eq!(request.stop_price, "101.92");
        assert_eq!(request.stop_limit_price, "101.92");
        assert_eq!(request.list_client_order_id, oco.client_order_id);
        assert_eq!(request.take_profit_client_order_id, d.exit.as_ref().unwrap().tp_client_order_id);
    }

    #[test]
    fn test_stored_protection_matches_decision_oco() {
        let d = decision();
        let entry = entry_intent(SCOPE, &d, T0).unwrap();
        let from_entry = protection_intent(SCOPE, &entry, "4.807", T0).unwrap();
        let from_decision = oco_intent(SCOPE, &d, "4.807", T0).unwrap();
        assert_eq!(from_entry.order_intent_id, from_decision.order_intent_id);
        assert_eq!(from_entry.intent_payload_json, from_decision.intent_payload_json);

        let partial = protection_intent(SCOPE, &entry, "2.000", T0).unwrap();
        assert_eq!(partial.order_intent_id, from_decision.order_intent_id);
        assert!(partial.intent_payload_json.contains("\"quantity\":\"2.000\""));
    }

    #[test]
    fn test_cancel_replace_derives_new_client_id() {
        let d = decision();
        let entry = entry_request(&d).unwrap();
        let reprice = Reprice {
            origin_intent_id: "oi_origin",
            live: &entry,
            new_price: "104.055",
            reprice_n: 1,
            timing: EntryTiming {
                ttl_ms: 10_000,
                max_reprices: 2,
            },
        };
        let oi = cancel_replace_intent(SCOPE, &d.decision_id, &reprice, &d.constraints, T0).unwrap();
        let IntentPayload::CancelReplace { request, reprice_n, .. } = IntentPayload::from_intent(&oi).unwrap() else {
            panic!("wrong payload");
        };
        assert_eq!(reprice_n, 1);
        assert_eq!(request.cancel_client_order_id, entry.client_order_id);
        assert_eq!(request.new_order.price.as_deref(), Some("104.05"));
        assert_eq!(request.new_order.client_order_id, oi.client_order_id);
        assert_ne!(request.new_order.client_order_id, entry.client_order_id);
    }

    #[test]
    fn test_payload_action_must_match() {
        let mut oi = cancel_intent(SCOPE, "dec_1", "BTCUSDT", "X_a", T0).unwrap();
        oi.action = IntentAction::NewOrder;
        assert!(IntentPayload::from_intent(&oi).is_err());
    }
}
