//! Exactly-once execution of order intents
//!
//! An intent is ledgered before anything is sent. The exchange call runs
//! under a deadline and an outer cancellation token; any outcome the agent
//! cannot observe leaves the intent SENT_UNKNOWN, and only a lookup by client
//! order id may settle it. A ledgered intent is never sent twice blindly.

use crate::error::{OmsError, OmsResult};
use crate::order::{IntentPayload, IntentScope, oco_intent};
use crate::persistence::{IntentJournal, stage_for};
use common::config::ExecutorConfig;
use common::model::decision::Decision;
use common::model::{IntentAction, IntentState, OrderIntent};
use common::{ErrorKind, EventType, ReasonCode};
use feeds::{ExchangeError, ExchangeRest, ExchangeResult, OcoAck, OrderAck, OrderLookup, RemoteOrder};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::TransitionUpdate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error code stored on a protection intent that could not be installed
pub const PROTECTION_INSTALL_FAILED: &str = "PROTECTION_INSTALL_FAILED";

/// Successful execution of an intent
#[derive(Debug, Clone)]
pub struct Execution {
    /// Intent as stored after the call
    pub intent: OrderIntent,
    /// True when a ledgered intent was settled without a new send
    pub reused: bool,
}

enum Ack {
    Order(OrderAck),
    Oco(OcoAck),
}

impl Ack {
    fn rejected_status(&self) -> Option<&str> {
        match self {
            Self::Order(a) if a.is_rejected() => Some(&a.status),
            Self::Oco(a) => a.orders.iter().find(|o| o.is_rejected()).map(|o| o.status.as_str()),
            Self::Order(_) => None,
        }
    }

    fn update(&self) -> TransitionUpdate {
        match self {
            Self::Order(a) => TransitionUpdate::order_id(a.order_id.clone()),
            Self::Oco(a) => TransitionUpdate {
                exchange_order_id: a.orders.first().map(|o| o.order_id.clone()),
                exchange_oco_id: Some(a.order_list_id.clone()),
                ..TransitionUpdate::default()
            },
        }
    }

    fn status(&self) -> &str {
        match self {
            Self::Order(a) => &a.status,
            Self::Oco(_) => "ALL_DONE",
        }
    }
}

enum Sent {
    Ack(Ack),
    Failed(ExchangeError),
    TimedOut,
    Cancelled,
}

fn event_type(action: IntentAction) -> EventType {
    match action {
        IntentAction::NewOrder => EventType::OrderSubmit,
        IntentAction::CancelOrder => EventType::OrderCancel,
        IntentAction::CancelReplace => EventType::OrderCancelReplace,
        IntentAction::OcoCreate => EventType::ProtectionInstall,
    }
}

fn confirmed_reason(action: IntentAction) -> ReasonCode {
    match action {
        IntentAction::NewOrder => ReasonCode::ExecConfirmed,
        IntentAction::CancelOrder => ReasonCode::ExecCancelled,
        IntentAction::CancelReplace => ReasonCode::ExecRepriced,
        IntentAction::OcoCreate => ReasonCode::ProtectionInstalled,
    }
}

fn rejected_reason(action: IntentAction, kind: ErrorKind) -> ReasonCode {
    match (action, kind) {
        (IntentAction::OcoCreate, _) => ReasonCode::ProtectionInstallFailed,
        (_, ErrorKind::RateLimited) => ReasonCode::ExecRateLimited,
        _ => ReasonCode::ExecRejected,
    }
}

/// Update recorded when a lookup finds the intended order
fn lookup_update(remote: &RemoteOrder) -> TransitionUpdate {
    TransitionUpdate {
        exchange_order_id: Some(remote.order_id.clone()),
        exchange_oco_id: (remote.order_list_id >= 0).then(|| remote.order_list_id.to_string()),
        ..TransitionUpdate::default()
    }
}

/// Sends ledgered intents to the exchange and settles unknown outcomes
pub struct Executor {
    exchange: Arc<dyn ExchangeRest>,
    journal: IntentJournal,
    cfg: ExecutorConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("cfg", &self.cfg).finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor over `exchange` journaling through `journal`
    #[must_use]
    pub fn new(exchange: Arc<dyn ExchangeRest>, journal: IntentJournal, cfg: ExecutorConfig) -> Self {
        Self { exchange, journal, cfg }
    }

    /// Journal used for every state change
    #[must_use]
    pub const fn journal(&self) -> &IntentJournal {
        &self.journal
    }

    /// Exchange the executor talks to
    #[must_use]
    pub fn exchange(&self) -> &Arc<dyn ExchangeRest> {
        &self.exchange
    }

    /// Executor settings
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.cfg
    }

    /// Ledger `intent` and perform its mutation at most once
    ///
    /// A stored CONFIRMED intent is returned without an exchange call. A
    /// stored SENT_UNKNOWN intent is queried, never resent. A stored CREATED
    /// intent is queried once and resent only if the exchange does not know it.
    ///
    /// # Errors
    ///
    /// Returns [`OmsError::SentUnknown`] when the outcome cannot be observed,
    /// [`OmsError::Rejected`] when the exchange refused the mutation, and
    /// ledger or audit errors as they occur.
    pub async fn submit_with_intent(&self, intent: &OrderIntent, cancel: &CancellationToken) -> OmsResult<Execution> {
        let payload = IntentPayload::from_intent(intent)?;
        let opened = self.journal.open(intent).await?;
        let stored = opened.intent;

        match stored.state {
            IntentState::Confirmed => {
                self.journal
                    .record(
                        &stored,
                        stage_for(stored.action),
                        event_type(stored.action),
                        vec![ReasonCode::ExecIntentReused],
                        json!({"client_order_id": stored.client_order_id, "state": stored.state.as_str()}),
                    )
                    .await?;
                return Ok(Execution {
                    intent: stored,
                    reused: true,
                });
            }
            IntentState::FailedTerminal => {
                return Err(OmsError::Rejected {
                    code: stored.last_error_code.clone().unwrap_or_default(),
                    detail: stored.last_error_detail_redacted.clone().unwrap_or_default(),
                    order_intent_id: stored.order_intent_id,
                });
            }
            IntentState::NotFound => {
                return Err(OmsError::InvalidIntentState {
                    order_intent_id: stored.order_intent_id,
                    operation: "resubmitted",
                    state: IntentState::NotFound.to_string(),
                });
            }
            IntentState::SentUnknown => {
                let resolved = self.resolve_sent_unknown(&stored).await?;
                return settled(resolved);
            }
            IntentState::Created => {}
        }

        if !opened.inserted {
            if let Some(remote) = self.query_once(&stored, &payload).await {
                debug!(order_intent_id = %stored.order_intent_id, "created intent already on the exchange");
                let confirmed = self
                    .journal
                    .advance(&stored, IntentState::Confirmed, &lookup_update(&remote), ReasonCode::ExecIntentReused)
                    .await?;
                return settled(confirmed.unwrap_or(stored));
            }
        }

        self.send(stored, &payload, cancel).await
    }

    async fn call(&self, payload: &IntentPayload) -> ExchangeResult<Ack> {
        match payload {
            IntentPayload::NewOrder { request, .. } => self.exchange.new_order(request).await.map(Ack::Order),
            IntentPayload::CancelOrder {
                symbol,
                target_client_order_id,
            } => self.exchange.cancel_order(symbol, target_client_order_id).await.map(Ack::Order),
            IntentPayload::CancelReplace { request, .. } => self.exchange.cancel_replace(request).await.map(Ack::Order),
            IntentPayload::OcoCreate { request } => self.exchange.new_oco(request).await.map(Ack::Oco),
        }
    }

    async fn send(&self, intent: OrderIntent, payload: &IntentPayload, cancel: &CancellationToken) -> OmsResult<Execution> {
        let deadline = Duration::from_millis(self.cfg.submit_timeout_ms);
        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => Sent::Cancelled,
            r = tokio::time::timeout(deadline, self.call(payload)) => match r {
                Ok(Ok(ack)) => Sent::Ack(ack),
                Ok(Err(e)) => Sent::Failed(e),
                Err(_) => Sent::TimedOut,
            },
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let action = intent.action;
        let stage = stage_for(action);
        let request = self.journal.redact_json(&serde_json::to_value(payload).unwrap_or_default());

        match sent {
            Sent::Ack(ack) => {
                if let Some(status) = ack.rejected_status().map(str::to_string) {
                    let detail = format!("order status {status}");
                    let code = if action == IntentAction::OcoCreate { PROTECTION_INSTALL_FAILED.to_string() } else { status };
                    return self
                        .fail(intent, code, detail, rejected_reason(action, ErrorKind::ExchangeReject), latency_ms, request)
                        .await;
                }
                let reason = confirmed_reason(action);
                let status = ack.status().to_string();
                let confirmed = self
                    .journal
                    .advance(&intent, IntentState::Confirmed, &ack.update(), reason)
                    .await?
                    .unwrap_or(intent);
                self.journal
                    .record(
                        &confirmed,
                        stage,
                        event_type(action),
                        vec![reason],
                        json!({
                            "client_order_id": confirmed.client_order_id,
                            "exchange_order_id": confirmed.exchange_order_id,
                            "exchange_oco_id": confirmed.exchange_oco_id,
                            "status": status,
                            "latency_ms": latency_ms,
                            "request": request,
                        }),
                    )
                    .await?;
                info!(
                    order_intent_id = %confirmed.order_intent_id,
                    symbol = %confirmed.symbol,
                    action = %action,
                    latency_ms,
                    "intent confirmed"
                );
                Ok(Execution {
                    intent: confirmed,
                    reused: false,
                })
            }
            Sent::Failed(e) if e.is_outcome_unknown() || matches!(e, ExchangeError::Decode(_)) => {
                self.unknown(intent, &e.error_code(), &e.to_string(), latency_ms, request).await
            }
            Sent::Failed(e) => {
                let (code, detail) = if action == IntentAction::OcoCreate {
                    (PROTECTION_INSTALL_FAILED.to_string(), format!("{}: {e}", e.error_code()))
                } else {
                    (e.error_code(), e.to_string())
                };
                self.fail(intent, code, detail, rejected_reason(action, e.kind()), latency_ms, request)
                    .await
            }
            Sent::TimedOut => {
                let detail = format!("no response within {}ms", self.cfg.submit_timeout_ms);
                self.unknown(intent, "TIMEOUT", &detail, latency_ms, request).await
            }
            Sent::Cancelled => self.unknown(intent, "CANCELLED", "submit cancelled", latency_ms, request).await,
        }
    }

    async fn unknown(
        &self,
        intent: OrderIntent,
        code: &str,
        detail: &str,
        latency_ms: u64,
        request: serde_json::Value,
    ) -> OmsResult<Execution> {
        let update = TransitionUpdate::error(code, self.journal.redact_detail(detail));
        let stored = self
            .journal
            .advance(&intent, IntentState::SentUnknown, &update, ReasonCode::ExecSentUnknown)
            .await?
            .unwrap_or(intent);
        self.journal
            .record(
                &stored,
                stage_for(stored.action),
                event_type(stored.action),
                vec![ReasonCode::ExecSentUnknown],
                json!({
                    "client_order_id": stored.client_order_id,
                    "error_code": code,
                    "latency_ms": latency_ms,
                    "request": request,
                }),
            )
            .await?;
        warn!(order_intent_id = %stored.order_intent_id, code, "intent outcome unknown");
        Err(OmsError::SentUnknown {
            order_intent_id: stored.order_intent_id,
        })
    }

    async fn fail(
        &self,
        intent: OrderIntent,
        code: String,
        detail: String,
        reason: ReasonCode,
        latency_ms: u64,
        request: serde_json::Value,
    ) -> OmsResult<Execution> {
        let detail = self.journal.redact_detail(&detail);
        let update = TransitionUpdate::error(code.clone(), detail.clone());
        let stored = self
            .journal
            .advance(&intent, IntentState::FailedTerminal, &update, reason)
            .await?
            .unwrap_or(intent);
        self.journal
            .record(
                &stored,
                stage_for(stored.action),
                event_type(stored.action),
                vec![reason],
                json!({
                    "client_order_id": stored.client_order_id,
                    "error_code": code,
                    "latency_ms": latency_ms,
                    "request": request,
                }),
            )
            .await?;
        warn!(order_intent_id = %stored.order_intent_id, code = %code, "intent rejected");
        Err(OmsError::Rejected {
            order_intent_id: stored.order_intent_id,
            code,
            detail,
        })
    }

    /// One bounded lookup; the remote order when it shows the mutation took effect
    async fn query_once(&self, intent: &OrderIntent, payload: &IntentPayload) -> Option<RemoteOrder> {
        let deadline = Duration::from_millis(self.cfg.intent_rest_query_timeout_ms);
        match tokio::time::timeout(deadline, self.exchange.get_order(&intent.symbol, payload.lookup_client_order_id())).await {
            Ok(Ok(OrderLookup::Found(remote))) if payload.is_effected_by(&remote) => Some(remote),
            _ => None,
        }
    }

    /// Settle a SENT_UNKNOWN intent by probing its client order id
    ///
    /// Up to `intent_max_rest_queries` lookups, each under
    /// `intent_rest_query_timeout_ms`. The first lookup that finds the
    /// mutation confirms the intent. NOT_FOUND requires every lookup to have
    /// answered not-found; a timeout or transport error leaves the intent
    /// SENT_UNKNOWN for a later pass. Intents in any other state are
    /// returned as stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is unreadable or the ledger or audit
    /// trail fails.
    pub async fn resolve_sent_unknown(&self, intent: &OrderIntent) -> OmsResult<OrderIntent> {
        let Some(current) = self.journal.ledger().get(&intent.order_intent_id).await? else {
            return Err(OmsError::InvalidInput(format!("{} is not ledgered", intent.order_intent_id)));
        };
        if current.state != IntentState::SentUnknown {
            return Ok(current);
        }
        let payload = IntentPayload::from_intent(&current)?;
        let lookup_id = payload.lookup_client_order_id();
        let deadline = Duration::from_millis(self.cfg.intent_rest_query_timeout_ms);
        let attempts = self.cfg.intent_max_rest_queries.max(1);
        let mut every_query_not_found = true;

        for attempt in 1..=attempts {
            match tokio::time::timeout(deadline, self.exchange.get_order(&current.symbol, lookup_id)).await {
                Ok(Ok(OrderLookup::Found(remote))) if payload.is_effected_by(&remote) => {
                    info!(order_intent_id = %current.order_intent_id, attempt, order_id = %remote.order_id, "lookup found intent");
                    let confirmed = self
                        .journal
                        .advance(&current, IntentState::Confirmed, &lookup_update(&remote), ReasonCode::ExecConfirmed)
                        .await?;
                    return Ok(confirmed.unwrap_or(current));
                }
                Ok(Ok(_)) => debug!(order_intent_id = %current.order_intent_id, attempt, "lookup: not found"),
                Ok(Err(e)) if e.is_unknown_order() => {
                    debug!(order_intent_id = %current.order_intent_id, attempt, "lookup: unknown order");
                }
                Ok(Err(e)) => {
                    every_query_not_found = false;
                    warn!(order_intent_id = %current.order_intent_id, attempt, error = %e, "lookup failed");
                }
                Err(_) => {
                    every_query_not_found = false;
                    warn!(order_intent_id = %current.order_intent_id, attempt, "lookup timed out");
                }
            }
        }

        if every_query_not_found {
            let update = TransitionUpdate::error("NOT_FOUND", format!("{attempts} lookups found nothing"));
            let settled = self
                .journal
                .advance(&current, IntentState::NotFound, &update, ReasonCode::ExecNotFound)
                .await?;
            return Ok(settled.unwrap_or(current));
        }
        Ok(current)
    }

    /// Place OCO protection for a filled entry
    ///
    /// # Errors
    ///
    /// Returns a quantize error when a leg violates the filters, and the
    /// errors of [`Self::submit_with_intent`]; an exchange failure leaves the
    /// protection intent FAILED_TERMINAL with `PROTECTION_INSTALL_FAILED`.
    pub async fn install_protection(
        &self,
        scope: IntentScope<'_>,
        decision: &Decision,
        filled_qty: &str,
        cancel: &CancellationToken,
    ) -> OmsResult<Execution> {
        let intent = oco_intent(scope, decision, filled_qty, self.journal.now_ms())?;
        self.submit_with_intent(&intent, cancel).await
    }
}

fn settled(intent: OrderIntent) -> OmsResult<Execution> {
    match intent.state {
        IntentState::Confirmed => Ok(Execution { intent, reused: true }),
        IntentState::SentUnknown => Err(OmsError::SentUnknown {
            order_intent_id: intent.order_intent_id,
        }),
        state => Err(OmsError::InvalidIntentState {
            order_intent_id: intent.order_intent_id,
            operation: "resubmitted",
            state: state.to_string(),
        }),
    }
}
