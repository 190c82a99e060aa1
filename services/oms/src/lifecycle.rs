//! Working-entry management (POSITION_MANAGE)
//!
//! Walks the live entry orders of a symbol once per cycle:
//! - a filled entry gets its OCO protection installed
//! - an entry resting past its TTL is repriced to the current best bid with
//!   cancel-replace, up to its reprice budget, and cancelled after that
//! - a partly filled entry past its TTL is cancelled and the filled part
//!   protected
//!
//! Every mutation is its own content-addressed intent, so running the walk
//! twice over the same remote state produces no second effect.

use crate::error::{OmsError, OmsResult};
use crate::executor::Executor;
use crate::order::{EntryTiming, IntentPayload, IntentScope, Reprice, cancel_intent, cancel_replace_intent, protection_intent};
use common::decimal::parse_decimal;
use common::ids::IntentVariant;
use common::model::{DecisionConstraints, IntentAction, IntentState, OrderIntent};
use feeds::{OrderLookup, OrderRequest, RemoteOrder};
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the walk did to one live entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryAction {
    /// Still inside its maker window
    Waiting,
    /// Protection installed for the filled quantity
    Protected {
        /// Quantity protected
        qty: String,
    },
    /// Replaced at a new price
    Repriced {
        /// Position in the reprice chain
        reprice_n: i64,
    },
    /// Cancelled after its reprice budget ran out
    Cancelled,
    /// Remote order gone without a fill
    Closed,
    /// The exchange could not be asked or the mutation is still unknown
    Unresolved,
}

/// Result for one live entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEntry {
    /// Intent that placed the order now live
    pub order_intent_id: String,
    /// What happened
    pub action: EntryAction,
}

/// Live entry order as the ledger knows it
struct LiveEntry {
    intent: OrderIntent,
    origin_intent_id: String,
    request: OrderRequest,
    timing: EntryTiming,
    reprice_n: i64,
}

impl LiveEntry {
    fn from_intent(intent: OrderIntent) -> OmsResult<Option<Self>> {
        let entry = match IntentPayload::from_intent(&intent)? {
            IntentPayload::NewOrder { request, timing, .. } => Self {
                origin_intent_id: intent.order_intent_id.clone(),
                intent,
                request,
                timing,
                reprice_n: 0,
            },
            IntentPayload::CancelReplace {
                request,
                origin_intent_id,
                reprice_n,
                timing,
            } => Self {
                intent,
                origin_intent_id,
                request: request.new_order,
                timing,
                reprice_n,
            },
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }
}

fn positive(qty: &str) -> bool {
    parse_decimal(qty).is_ok_and(|q| q > Decimal::ZERO)
}

/// Manages confirmed entries until they fill or are withdrawn
#[derive(Debug, Clone)]
pub struct EntryManager {
    executor: Arc<Executor>,
}

impl EntryManager {
    /// Manager acting through `executor`
    #[must_use]
    pub const fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    /// Confirmed entry orders of `symbol` not yet superseded by a reprice or cancel
    async fn live_entries(&self, symbol: &str) -> OmsResult<Vec<LiveEntry>> {
        let ledger = self.executor.journal().ledger();
        let mut superseded = FxHashSet::default();
        for action in [IntentAction::CancelReplace, IntentAction::CancelOrder] {
            for intent in ledger.list_for_symbol(symbol, action).await? {
                if matches!(intent.state, IntentState::FailedTerminal | IntentState::NotFound) {
                    continue;
                }
                match IntentPayload::from_intent(&intent)? {
                    IntentPayload::CancelReplace { request, .. } => {
                        superseded.insert(request.cancel_client_order_id);
                    }
                    IntentPayload::CancelOrder {
                        target_client_order_id, ..
                    } => {
                        superseded.insert(target_client_order_id);
                    }
                    _ => {}
                }
            }
        }

        let mut live = Vec::new();
        for action in [IntentAction::NewOrder, IntentAction::CancelReplace] {
            for intent in ledger.list_for_symbol(symbol, action).await? {
                if intent.state != IntentState::Confirmed || superseded.contains(&intent.client_order_id) {
                    continue;
                }
                if let Some(entry) = LiveEntry::from_intent(intent)? {
                    live.push(entry);
                }
            }
        }
        Ok(live)
    }

    async fn lookup(&self, entry: &LiveEntry) -> Option<RemoteOrder> {
        let timeout = Duration::from_millis(self.executor.config().intent_rest_query_timeout_ms);
        let call = self
            .executor
            .exchange()
            .get_order(&entry.request.symbol, &entry.request.client_order_id);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(OrderLookup::Found(remote))) => Some(remote),
            Ok(Ok(OrderLookup::NotFound)) => {
                warn!(order_intent_id = %entry.intent.order_intent_id, "confirmed entry unknown to the exchange");
                None
            }
            Ok(Err(e)) => {
                warn!(order_intent_id = %entry.intent.order_intent_id, error = %e, "entry lookup failed");
                None
            }
            Err(_) => {
                warn!(order_intent_id = %entry.intent.order_intent_id, "entry lookup timed out");
                None
            }
        }
    }

    /// Protect `qty` of the entry chain unless protection already exists
    async fn protect(
        &self,
        scope: IntentScope<'_>,
        entry: &LiveEntry,
        qty: &str,
        cancel: &CancellationToken,
    ) -> OmsResult<EntryAction> {
        let ledger = self.executor.journal().ledger();
        let oco_id = IntentVariant::Oco.intent_id(&entry.origin_intent_id);
        if ledger.get(&oco_id).await?.is_some() {
            debug!(order_intent_id = %oco_id, "protection already ledgered");
            return Ok(EntryAction::Protected { qty: qty.to_string() });
        }
        let Some(origin) = ledger.get(&entry.origin_intent_id).await? else {
            return Err(OmsError::InvalidInput(format!("{} is not ledgered", entry.origin_intent_id)));
        };
        let intent = protection_intent(scope, &origin, qty, self.executor.journal().now_ms())?;
        match self.executor.submit_with_intent(&intent, cancel).await {
            Ok(_) => Ok(EntryAction::Protected { qty: qty.to_string() }),
            Err(OmsError::SentUnknown { .. }) => Ok(EntryAction::Unresolved),
            Err(e) => Err(e),
        }
    }

    /// Walk every live entry of `symbol` at `now_ms`
    ///
    /// `best_bid` is the reprice target; without it a stale entry is
    /// cancelled rather than repriced.
    ///
    /// # Errors
    ///
    /// Returns ledger and audit failures, and rejections of protection
    /// intents. A rejected reprice or cancel is logged and reported as
    /// unresolved.
    pub async fn manage_symbol(
        &self,
        scope: IntentScope<'_>,
        symbol: &str,
        best_bid: Option<&str>,
        constraints: &DecisionConstraints,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> OmsResult<Vec<ManagedEntry>> {
        let mut managed = Vec::new();
        for entry in self.live_entries(symbol).await? {
            let action = self
                .manage_entry(scope, &entry, best_bid, constraints, now_ms, cancel)
                .await?;
            if action != EntryAction::Waiting {
                info!(
                    symbol,
                    order_intent_id = %entry.intent.order_intent_id,
                    ?action,
                    "entry managed"
                );
            }
            managed.push(ManagedEntry {
                order_intent_id: entry.intent.order_intent_id,
                action,
            });
        }
        Ok(managed)
    }

    async fn manage_entry(
        &self,
        scope: IntentScope<'_>,
        entry: &LiveEntry,
        best_bid: Option<&str>,
        constraints: &DecisionConstraints,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> OmsResult<EntryAction> {
        let Some(remote) = self.lookup(entry).await else {
            return Ok(EntryAction::Unresolved);
        };
        if remote.status == "FILLED" {
            return self.protect(scope, entry, &remote.executed_qty, cancel).await;
        }
        if !remote.is_open() {
            if positive(&remote.executed_qty) {
                return self.protect(scope, entry, &remote.executed_qty, cancel).await;
            }
            return Ok(EntryAction::Closed);
        }
        let age_ms = now_ms - entry.intent.updated_at_ms;
        if entry.timing.ttl_ms <= 0 || age_ms < entry.timing.ttl_ms {
            return Ok(EntryAction::Waiting);
        }

        let next_n = entry.reprice_n + 1;
        let reprice_target = best_bid.filter(|_| next_n <= entry.timing.max_reprices && !positive(&remote.executed_qty));
        let intent = match reprice_target {
            Some(price) => cancel_replace_intent(
                scope,
                &entry.intent.decision_id,
                &Reprice {
                    origin_intent_id: &entry.origin_intent_id,
                    live: &entry.request,
                    new_price: price,
                    reprice_n: next_n,
                    timing: entry.timing,
                },
                constraints,
                now_ms,
            )?,
            None => cancel_intent(
                scope,
                &entry.intent.decision_id,
                &entry.request.symbol,
                &entry.request.client_order_id,
                now_ms,
            )?,
        };

        match self.executor.submit_with_intent(&intent, cancel).await {
            Ok(_) if reprice_target.is_some() => Ok(EntryAction::Repriced { reprice_n: next_n }),
            Ok(_) => {
                if positive(&remote.executed_qty) {
                    return self.protect(scope, entry, &remote.executed_qty, cancel).await;
                }
                Ok(EntryAction::Cancelled)
            }
            Err(OmsError::SentUnknown { .. }) => Ok(EntryAction::Unresolved),
            Err(OmsError::Rejected { code, .. }) => {
                warn!(order_intent_id = %intent.order_intent_id, code = %code, "entry management rejected");
                Ok(EntryAction::Unresolved)
            }
            Err(e) => Err(e),
        }
    }
}
