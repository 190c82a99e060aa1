//! REST reconciliation
//!
//! Compares what the agent believes is on the exchange with what the
//! exchange reports, scores the drift and publishes the score to the health
//! supervisor, which turns it into DEGRADE or PAUSE.
//!
//! The local view is the account as synced at STATE_UPDATE plus the orders
//! placed since. Symbols the agent mutated after the sync are excluded, as
//! are assets explained by a fill the exchange confirms.

use anyhow::{Context, Result};
use common::config::ReconcileConfig;
use common::decimal::parse_decimal;
use common::{Clock, EventType, ReasonCode, Stage};
use feeds::{Balance, ExchangeRest, OrderLookup, RemoteOrder};
use monitoring::{AgentMetrics, Heartbeats};
use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use storage::{AuditRecord, AuditWriter};
use tracing::{info, warn};

use crate::account::total_of;

/// A symbol whose holdings are checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSymbol {
    /// Symbol
    pub symbol: String,
    /// Base asset held when a position is open
    pub base_asset: String,
    /// Holdings below this are dust
    pub min_qty: Decimal,
}

/// An order the agent believes is resting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOrder {
    /// Symbol
    pub symbol: String,
    /// Client id
    pub client_order_id: String,
}

impl From<&RemoteOrder> for LocalOrder {
    fn from(o: &RemoteOrder) -> Self {
        Self {
            symbol: o.symbol.clone(),
            client_order_id: o.client_order_id.clone(),
        }
    }
}

/// What the agent believes
#[derive(Debug, Clone, Default)]
pub struct LocalView {
    /// Quote asset of the account
    pub quote_asset: String,
    /// Orders resting as of the last sync plus those placed since
    pub open_orders: Vec<LocalOrder>,
    /// Balances as of the last sync
    pub balances: Vec<Balance>,
    /// Symbols whose holdings are checked
    pub tracked: Vec<TrackedSymbol>,
    /// Symbols mutated since the sync
    pub touched: FxHashSet<String>,
}

/// What the exchange reports
#[derive(Debug, Clone, Default)]
pub struct RemoteView {
    /// Resting orders
    pub open_orders: Vec<RemoteOrder>,
    /// Balances
    pub balances: Vec<Balance>,
    /// Lookups of local orders missing from `open_orders`; `None` when the
    /// exchange does not know the order. A failed lookup has no entry.
    pub lookups: FxHashMap<String, Option<RemoteOrder>>,
}

/// Differences between the two views, by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftDiff {
    /// Local orders the exchange does not know
    pub orders_missing: Vec<String>,
    /// Remote orders the agent does not know
    pub orders_extra: Vec<String>,
    /// Local orders the exchange closed without a fill
    pub orders_status_mismatch: Vec<String>,
    /// Symbols held on both sides in different amounts
    pub positions_qty_mismatch: Vec<String>,
    /// Symbols held on one side only
    pub positions_side_mismatch: Vec<String>,
    /// Assets whose balances differ
    pub balances_mismatch: Vec<String>,
    /// Positions without protection, or protection without a position
    pub protection_mismatch: Vec<String>,
}

fn units(n: usize, weight: i64, cap: i64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX).saturating_mul(weight).min(cap)
}

impl DriftDiff {
    /// Order differences of every kind
    #[must_use]
    pub fn order_diffs(&self) -> usize {
        self.orders_missing.len() + self.orders_extra.len() + self.orders_status_mismatch.len()
    }

    /// Position differences of every kind
    #[must_use]
    pub fn position_diffs(&self) -> usize {
        self.positions_qty_mismatch.len() + self.positions_side_mismatch.len()
    }

    /// Weighted, capped drift score in x10000 units
    #[must_use]
    pub fn score(&self) -> i64 {
        10_000
            * (units(self.order_diffs(), 4, 40)
                + units(self.position_diffs(), 6, 30)
                + units(self.balances_mismatch.len(), 4, 20)
                + units(self.protection_mismatch.len(), 2, 10))
    }

    /// True when the views agree
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.score() == 0
    }
}

/// What the drift calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftAction {
    /// Views agree well enough
    None,
    /// Stop executing
    Degrade,
    /// Stop proposing
    Pause,
}

impl DriftAction {
    /// Action for `score` under `cfg`
    #[must_use]
    pub const fn for_score(score: i64, cfg: &ReconcileConfig) -> Self {
        if score >= cfg.reconcile_drift_pause_score_x10000 {
            Self::Pause
        } else if score >= cfg.reconcile_drift_degrade_score_x10000 {
            Self::Degrade
        } else {
            Self::None
        }
    }

    /// Reasons recorded with the diff
    #[must_use]
    pub fn reasons(&self) -> Vec<ReasonCode> {
        match self {
            Self::Pause => vec![ReasonCode::DriftLimitExceeded, ReasonCode::EnterPause],
            Self::Degrade => vec![ReasonCode::DriftDetected, ReasonCode::EnterDegrade],
            Self::None => vec![ReasonCode::ReconcileOk],
        }
    }
}

/// One reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Differences found
    pub diff: DriftDiff,
    /// Drift score
    pub score_x10000: i64,
    /// Resulting action
    pub action: DriftAction,
}

fn same_amount(a: &str, b: &str) -> bool {
    match (parse_decimal(a), parse_decimal(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn balance_map(balances: &[Balance]) -> FxHashMap<&str, &Balance> {
    balances.iter().map(|b| (b.asset.as_str(), b)).collect()
}

/// Diff `local` against `remote`
#[must_use]
pub fn drift_diff(local: &LocalView, remote: &RemoteView) -> DriftDiff {
    let mut diff = DriftDiff::default();
    let remote_open: FxHashMap<&str, &RemoteOrder> = remote
        .open_orders
        .iter()
        .map(|o| (o.client_order_id.as_str(), o))
        .collect();
    let local_cids: FxHashSet<&str> = local.open_orders.iter().map(|o| o.client_order_id.as_str()).collect();
    let mut filled: FxHashSet<&str> = FxHashSet::default();

    for order in &local.open_orders {
        if remote_open.contains_key(order.client_order_id.as_str()) || local.touched.contains(&order.symbol) {
            continue;
        }
        match remote.lookups.get(&order.client_order_id) {
            Some(None) => diff.orders_missing.push(order.client_order_id.clone()),
            Some(Some(lookup)) => match lookup.status.as_str() {
                "FILLED" | "PARTIALLY_FILLED" => {
                    filled.insert(order.symbol.as_str());
                }
                _ => diff.orders_status_mismatch.push(order.client_order_id.clone()),
            },
            None => {}
        }
    }
    for order in &remote.open_orders {
        if !local_cids.contains(order.client_order_id.as_str()) && !local.touched.contains(&order.symbol) {
            diff.orders_extra.push(order.client_order_id.clone());
        }
    }

    // Assets a confirmed fill or a later mutation accounts for
    let mut explained: FxHashSet<&str> = FxHashSet::default();
    let moved = |s: &str| filled.contains(s) || local.touched.contains(s);
    for t in local.tracked.iter().filter(|t| moved(&t.symbol)) {
        explained.insert(t.base_asset.as_str());
        explained.insert(local.quote_asset.as_str());
    }

    let local_bal = balance_map(&local.balances);
    let remote_bal = balance_map(&remote.balances);
    let mut assets: Vec<&str> = local_bal.keys().chain(remote_bal.keys()).copied().collect();
    assets.sort_unstable();
    assets.dedup();
    for asset in assets {
        if explained.contains(asset) {
            continue;
        }
        let agree = match (local_bal.get(asset), remote_bal.get(asset)) {
            (Some(l), Some(r)) => same_amount(&l.free, &r.free) && same_amount(&l.locked, &r.locked),
            (Some(b), None) | (None, Some(b)) => same_amount(&b.free, "0") && same_amount(&b.locked, "0"),
            (None, None) => true,
        };
        if !agree {
            diff.balances_mismatch.push(asset.to_string());
        }
    }

    for t in &local.tracked {
        if moved(&t.symbol) {
            continue;
        }
        let local_qty = total_of(&local.balances, &t.base_asset);
        let remote_qty = total_of(&remote.balances, &t.base_asset);
        let held = |q: Decimal| q > Decimal::ZERO && q >= t.min_qty;
        match (held(local_qty), held(remote_qty)) {
            (true, true) if local_qty != remote_qty => diff.positions_qty_mismatch.push(t.symbol.clone()),
            (true, false) | (false, true) => diff.positions_side_mismatch.push(t.symbol.clone()),
            _ => {}
        }

        let protected = remote
            .open_orders
            .iter()
            .any(|o| o.symbol == t.symbol && o.order_list_id >= 0);
        if held(remote_qty) != protected {
            diff.protection_mismatch.push(t.symbol.clone());
        }
    }
    diff
}

/// Periodic REST reconciliation bound to one run
pub struct Reconciler {
    exchange: Arc<dyn ExchangeRest>,
    audit: Arc<AuditWriter>,
    heartbeats: Arc<Heartbeats>,
    clock: Arc<dyn Clock>,
    cfg: ReconcileConfig,
    metrics: Option<AgentMetrics>,
    last_run_ms: Option<i64>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("cfg", &self.cfg)
            .field("last_run_ms", &self.last_run_ms)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler publishing drift into `heartbeats`
    #[must_use]
    pub fn new(
        exchange: Arc<dyn ExchangeRest>,
        audit: Arc<AuditWriter>,
        heartbeats: Arc<Heartbeats>,
        clock: Arc<dyn Clock>,
        cfg: ReconcileConfig,
    ) -> Self {
        Self {
            exchange,
            audit,
            heartbeats,
            clock,
            cfg,
            metrics: None,
            last_run_ms: None,
        }
    }

    /// Also publish the score into `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether the interval since the last pass has elapsed
    #[must_use]
    pub fn due(&self, now_ms: i64) -> bool {
        let interval = i64::try_from(self.cfg.reconcile_rest_interval_ms).unwrap_or(i64::MAX);
        self.last_run_ms.is_none_or(|last| now_ms - last >= interval)
    }

    async fn remote_view(&self, local: &LocalView) -> Result<RemoteView> {
        let open_orders = self.exchange.open_orders(None).await.context("open orders")?;
        let balances = self.exchange.balances().await.context("balances")?;
        let mut lookups = FxHashMap::default();
        for order in &local.open_orders {
            let listed = open_orders.iter().any(|o| o.client_order_id == order.client_order_id);
            if listed || local.touched.contains(&order.symbol) {
                continue;
            }
            match self.exchange.get_order(&order.symbol, &order.client_order_id).await {
                Ok(OrderLookup::Found(remote)) => {
                    lookups.insert(order.client_order_id.clone(), Some(remote));
                }
                Ok(OrderLookup::NotFound) => {
                    lookups.insert(order.client_order_id.clone(), None);
                }
                Err(e) => warn!(
                    client_order_id = %order.client_order_id,
                    error = %e,
                    "reconcile lookup failed"
                ),
            }
        }
        Ok(RemoteView {
            open_orders,
            balances,
            lookups,
        })
    }

    /// Fetch the remote view, diff it and record the outcome
    ///
    /// # Errors
    ///
    /// Returns an error if the open orders or balances cannot be fetched or
    /// the diff cannot be audited. Nothing is published in that case.
    pub async fn reconcile(&mut self, run_id: &str, cycle_id: &str, local: &LocalView) -> Result<DriftReport> {
        let remote = self.remote_view(local).await?;
        let diff = drift_diff(local, &remote);
        let score_x10000 = diff.score();
        let action = DriftAction::for_score(score_x10000, &self.cfg);
        let report = DriftReport {
            diff,
            score_x10000,
            action,
        };

        let now = self.clock.now_ms();
        let reasons = action.reasons();
        let data = json!({
            "diff": report.diff,
            "score_x10000": score_x10000,
            "action": action,
            "degrade_score_x10000": self.cfg.reconcile_drift_degrade_score_x10000,
            "pause_score_x10000": self.cfg.reconcile_drift_pause_score_x10000,
        });
        self.audit
            .write(
                AuditRecord::new(now, run_id, cycle_id, Stage::ReconcileRest, EventType::ReconcileDiff, reasons.clone())
                    .with_data(data.clone()),
            )
            .await
            .context("RECONCILE_DIFF")?;
        if action != DriftAction::None {
            warn!(cycle_id, score_x10000, ?action, diff = ?report.diff, "drift detected");
            self.audit
                .write(
                    AuditRecord::new(now, run_id, cycle_id, Stage::ReconcileRest, EventType::AlertRaised, reasons)
                        .with_data(data),
                )
                .await
                .context("ALERT_RAISED")?;
        } else {
            info!(cycle_id, "reconcile clean");
        }

        self.heartbeats.drift_score(score_x10000);
        if let Some(m) = &self.metrics {
            m.set_drift_score(score_x10000);
        }
        self.last_run_ms = Some(now);
        Ok(report)
    }
}
