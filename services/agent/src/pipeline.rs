//! Live stage work
//!
//! [`LivePipeline`] carries what one cycle hands from stage to stage: the
//! symbol filters and snapshots from the scan, the selection funnel, the
//! account state and the decisions still alive. Cycle state is reset at
//! UNIVERSE_SCAN; the account sync point and the reconciler survive across
//! cycles.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use common::decimal::parse_decimal;
use common::model::{
    CostInputs, Decision, HealthFlags, IntentState, RiskOutcome, Snapshot, SymbolFilters, Ticker24h,
};
use common::reason::push_unique;
use common::{AgentConfig, EventType, ReasonCode, Stage, canonical_hash};
use engine::snapshot::MICRO_WINDOW_MS;
use engine::{
    CandleSeries, KLINE_LIMIT, PreviousTopK, Proposal, SnapshotBuilder, SnapshotInputs, TopKCandidate,
    deep_scan, propose_entry, rank_top_n, select_top_k, universe_scan,
};
use ai_gate::{AiGate, ReviewScope};
use feeds::{Balance, RemoteOrder};
use oms::{
    EntryAction, EntryManager, Executor, IntentJournal, IntentScope, OmsError, ResolverPool, StartupRecovery,
    entry_intent,
};
use risk_manager::{AccountState, ActivityMonitor, RiskEngine};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::{
    AuditRecord, IntentLedger, RankingRow, RankingStage, RedactionPolicy, SelectionLog, SelectionRow,
    UniverseScanRow,
};
use tracing::{debug, info, warn};

use crate::account::{EquityDay, account_state};
use crate::context::AgentContext;
use crate::doctor::run_checks;
use crate::orchestrator::{StageCtx, StageWork};
use crate::reconcile::{LocalOrder, LocalView, Reconciler, TrackedSymbol};
use crate::summary::{DailySummary, SummaryTracker};

const STATUS_TRADING: &str = "TRADING";
const DAY_MS: i64 = 86_400_000;

/// Symbols scanned each cycle
///
/// The configured list when non-empty, otherwise every TRADING symbol
/// quoted in the configured quote asset.
#[must_use]
pub fn universe_symbols(cfg: &AgentConfig, filters: &[SymbolFilters]) -> Vec<String> {
    if !cfg.runtime.symbols.is_empty() {
        return cfg.runtime.symbols.clone();
    }
    let mut symbols: Vec<String> = filters
        .iter()
        .filter(|f| f.status == STATUS_TRADING && f.quote_asset == cfg.exchange.quote_asset)
        .map(|f| f.symbol.clone())
        .collect();
    symbols.sort();
    symbols
}

fn reasons_or(reasons: Vec<ReasonCode>, fallback: ReasonCode) -> Vec<ReasonCode> {
    if reasons.is_empty() { vec![fallback] } else { reasons }
}

fn union<'a>(lists: impl IntoIterator<Item = &'a [ReasonCode]>) -> Vec<ReasonCode> {
    let mut out = Vec::new();
    for list in lists {
        for &r in list {
            push_unique(&mut out, r);
        }
    }
    out
}

fn rank_i64(rank: usize) -> i64 {
    i64::try_from(rank).unwrap_or(i64::MAX)
}

/// State produced by one cycle, dropped at the next UNIVERSE_SCAN
#[derive(Debug, Default)]
struct CycleState {
    universe: Vec<String>,
    filters: FxHashMap<String, SymbolFilters>,
    snapshots: FxHashMap<String, Snapshot>,
    eligible: Vec<String>,
    ranked: Vec<String>,
    deep_passed: Vec<(String, i64)>,
    watchlist: Vec<String>,
    account: AccountState,
    decisions: Vec<Decision>,
    opened: Vec<LocalOrder>,
}

/// Remote state read at the last STATE_UPDATE
#[derive(Debug)]
struct SyncPoint {
    open_orders: Vec<RemoteOrder>,
    balances: Vec<Balance>,
}

/// Stage work of a live cycle
pub struct LivePipeline {
    ctx: AgentContext,
    builder: SnapshotBuilder,
    risk: RiskEngine,
    gate: AiGate,
    executor: Arc<Executor>,
    entries: EntryManager,
    resolver: ResolverPool,
    reconciler: Reconciler,
    selection: SelectionLog,
    summary: SummaryTracker,
    equity: EquityDay,
    previous_topk: Option<PreviousTopK>,
    cycle: CycleState,
    sync: Option<SyncPoint>,
    touched: FxHashSet<String>,
}

impl std::fmt::Debug for LivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePipeline")
            .field("universe", &self.cycle.universe.len())
            .field("watchlist", &self.cycle.watchlist)
            .field("decisions", &self.cycle.decisions.len())
            .finish_non_exhaustive()
    }
}

impl LivePipeline {
    /// Wire every component over the shared handles
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be hashed, the risk limits are
    /// invalid, or the advisory gate cannot load its prompt assets.
    pub fn new(ctx: AgentContext) -> Result<Self> {
        let cfg = ctx.cfg.clone();
        let builder = SnapshotBuilder::new(&cfg, 1).context("snapshot builder")?;
        let redaction = RedactionPolicy::from(&cfg.redaction);
        let monitor = Arc::new(ActivityMonitor::new(cfg.risk.trades_window_ms));
        let risk = RiskEngine::new(cfg.risk.clone(), monitor).context("risk limits")?;
        let gate = AiGate::from_config(&cfg.aigate, redaction.clone(), ctx.clock.clone()).context("advisory gate")?;

        let journal = IntentJournal::new(
            IntentLedger::new(ctx.store.clone()),
            ctx.audit.clone(),
            redaction,
            ctx.clock.clone(),
        );
        let executor = Arc::new(Executor::new(ctx.exchange.clone(), journal, cfg.executor.clone()));
        let mut reconciler = Reconciler::new(
            ctx.exchange.clone(),
            ctx.audit.clone(),
            ctx.heartbeats.clone(),
            ctx.clock.clone(),
            cfg.reconcile.clone(),
        );
        if let Some(metrics) = &ctx.metrics {
            reconciler = reconciler.with_metrics(metrics.clone());
        }

        Ok(Self {
            builder,
            risk,
            gate,
            entries: EntryManager::new(executor.clone()),
            resolver: ResolverPool::new(executor.clone()),
            executor,
            reconciler,
            selection: SelectionLog::new(ctx.store.clone()),
            summary: SummaryTracker::default(),
            equity: EquityDay::default(),
            previous_topk: None,
            cycle: CycleState::default(),
            sync: None,
            touched: FxHashSet::default(),
            ctx,
        })
    }

    fn now(&self) -> i64 {
        self.ctx.clock.now_ms()
    }

    fn record(&self, ctx: StageCtx<'_>, stage: Stage, event: EventType, reasons: Vec<ReasonCode>) -> AuditRecord {
        AuditRecord::new(self.now(), ctx.run_id, ctx.cycle_id, stage, event, reasons)
    }

    async fn write(&self, record: AuditRecord) -> Result<()> {
        let event = record.event_type;
        self.ctx.audit.write(record).await.with_context(|| format!("{event} record"))?;
        Ok(())
    }

    fn tracked(&self) -> Vec<TrackedSymbol> {
        self.cycle
            .universe
            .iter()
            .filter_map(|s| self.cycle.filters.get(s))
            .map(|f| TrackedSymbol {
                symbol: f.symbol.clone(),
                base_asset: f.base_asset.clone(),
                min_qty: parse_decimal(&f.min_qty).unwrap_or_default(),
            })
            .collect()
    }

    async fn boot(&self) -> Result<()> {
        let offset_ms = self.ctx.exchange.sync_time().await.context("clock sync")?;
        let config_hash = self.ctx.cfg.config_hash().context("config hash")?;
        info!(offset_ms, %config_hash, "boot");
        Ok(())
    }

    async fn doctor(&self, ctx: StageCtx<'_>) -> Result<()> {
        let report = run_checks(
            &self.ctx.cfg,
            Some(&self.ctx.store),
            Some(self.ctx.exchange.as_ref()),
            self.ctx.clock.as_ref(),
        )
        .await;
        let reason = if report.passed() { ReasonCode::DoctorOk } else { ReasonCode::DoctorCheckFailed };
        let data = serde_json::to_value(&report).context("doctor payload")?;
        self.write(
            self.record(ctx, Stage::DoctorChecks, EventType::DoctorResult, vec![reason])
                .with_data(json!({ "report": data })),
        )
        .await?;
        if !report.passed() {
            let failed: Vec<&str> = report.failures().map(|c| c.name).collect();
            bail!("doctor checks failed: {}", failed.join(", "));
        }
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        let stats = StartupRecovery::new(self.resolver.clone())
            .recover()
            .await
            .context("startup recovery")?;
        info!(
            inspected = stats.inspected,
            confirmed = stats.confirmed,
            not_found = stats.not_found,
            still_unknown = stats.still_unknown,
            elapsed_ms = stats.elapsed_ms,
            "startup recovery"
        );
        Ok(())
    }

    async fn build_snapshot(&self, filters: &SymbolFilters, ticker: &Ticker24h) -> Result<Snapshot> {
        let symbol = filters.symbol.as_str();
        let exchange = &self.ctx.exchange;
        let candles = CandleSeries {
            m1: exchange.klines(symbol, "1m", KLINE_LIMIT).await?,
            m5: exchange.klines(symbol, "5m", KLINE_LIMIT).await?,
            m15: exchange.klines(symbol, "15m", KLINE_LIMIT).await?,
            h1: exchange.klines(symbol, "1h", KLINE_LIMIT).await?,
        };

        let now = self.now();
        let books = &self.ctx.books;
        let mut book = books.window(symbol, now, MICRO_WINDOW_MS);
        if book.is_empty() {
            book.push(exchange.book_ticker(symbol).await?);
        }
        let cfg = &self.ctx.cfg;
        let monitor = self.risk.monitor();
        let health = HealthFlags {
            filters_ok: filters.validate().is_ok(),
            ws_ok: books
                .latest(symbol)
                .is_some_and(|s| now - s.local_ts_ms <= cfg.health.ws_stale_ms_degrade),
            symbol_status: filters.status.clone(),
            quarantine_until_ms: monitor.quarantine_until_ms(symbol, now, cfg.risk.max_rejects_per_hour),
            recent_rejects: monitor.counts(symbol, now).rejects_last_hour,
        };
        let costs = CostInputs {
            maker_fee_bps: cfg.exchange.maker_fee_bps,
            taker_fee_bps: cfg.exchange.taker_fee_bps,
            slippage_entry_maker_bps: 0,
            slippage_entry_taker_bps: 0,
            slippage_exit_taker_bps: 0,
        };
        let snapshot = self.builder.build(
            &SnapshotInputs {
                ticker,
                book: &book,
                candles: &candles,
                filters,
                costs,
                health,
                ooo_drops: books.ooo_drops(symbol),
            },
            now,
        )?;
        Ok(snapshot)
    }

    async fn universe_scan(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        self.cycle = CycleState::default();
        let exchange = self.ctx.exchange.clone();

        let filters = exchange.exchange_info().await.context("exchange info")?;
        let filters_hash = canonical_hash(&filters).context("filters hash")?;
        self.write(
            self.record(ctx, Stage::UniverseScan, EventType::FiltersRefreshed, vec![ReasonCode::FiltersRefreshed])
                .with_data(json!({ "symbols": filters.len(), "filters_hash": filters_hash })),
        )
        .await?;
        let universe = universe_symbols(&self.ctx.cfg, &filters);
        let by_symbol: FxHashMap<String, SymbolFilters> =
            filters.into_iter().map(|f| (f.symbol.clone(), f)).collect();
        let tickers: FxHashMap<String, Ticker24h> = exchange
            .ticker_24h()
            .await
            .context("24h tickers")?
            .into_iter()
            .map(|t| (t.symbol.clone(), t))
            .collect();

        let mut snapshots = Vec::with_capacity(universe.len());
        for symbol in &universe {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let (Some(f), Some(t)) = (by_symbol.get(symbol), tickers.get(symbol)) else {
                warn!(symbol, "no filters or ticker, skipped");
                continue;
            };
            match self.build_snapshot(f, t).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(symbol, error = %e, "snapshot skipped"),
            }
        }

        let verdicts = universe_scan(&self.ctx.cfg.universe, &snapshots);
        let rows: Vec<UniverseScanRow> = verdicts
            .iter()
            .map(|v| UniverseScanRow {
                symbol: v.symbol.clone(),
                eligible: v.eligible,
                reasons: v.reasons.clone(),
                quote_volume: v.quote_volume.clone(),
                trade_count: i64::try_from(v.trade_count).unwrap_or(i64::MAX),
                price_change_bps: v.price_change_bps,
            })
            .collect();
        let now = self.now();
        self.selection
            .record_universe(ctx.run_id, ctx.cycle_id, &rows, now)
            .await
            .context("universe rows")?;

        let eligible: Vec<String> = verdicts.iter().filter(|v| v.eligible).map(|v| v.symbol.clone()).collect();
        let reasons = union(verdicts.iter().map(|v| v.reasons.as_slice()));
        self.write(
            self.record(ctx, Stage::UniverseScan, EventType::UniverseEligibility, reasons_or(reasons, ReasonCode::StageOk))
                .with_data(json!({
                    "scanned": snapshots.len(),
                    "eligible": eligible,
                    "verdicts": verdicts,
                })),
        )
        .await?;
        info!(universe = universe.len(), scanned = snapshots.len(), eligible = eligible.len(), "universe scan");

        self.cycle.universe = universe;
        self.cycle.filters = by_symbol;
        self.cycle.snapshots = snapshots.into_iter().map(|s| (s.symbol.clone(), s)).collect();
        self.cycle.eligible = eligible;
        Ok(())
    }

    async fn rank(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let eligible: Vec<&Snapshot> = self
            .cycle
            .eligible
            .iter()
            .filter_map(|s| self.cycle.snapshots.get(s))
            .collect();
        let ranked = rank_top_n(&self.ctx.cfg.rank, &eligible);
        let rows: Vec<RankingRow> = ranked
            .iter()
            .map(|r| RankingRow {
                rank: rank_i64(r.rank),
                symbol: r.symbol.clone(),
                score_x10000: r.score_x10000,
                components: json!({
                    "liquidity_x10000": r.liquidity_x10000,
                    "momentum_x10000": r.momentum_x10000,
                    "spread_x10000": r.spread_x10000,
                    "selected": r.selected,
                    "reason": r.reason,
                }),
            })
            .collect();
        self.selection
            .record_ranking(ctx.run_id, ctx.cycle_id, RankingStage::TopN, &rows, self.now())
            .await
            .context("ranking rows")?;

        let mut reasons = Vec::new();
        for r in &ranked {
            push_unique(&mut reasons, r.reason);
        }
        let selected: Vec<String> = ranked.iter().filter(|r| r.selected).map(|r| r.symbol.clone()).collect();
        self.write(
            self.record(ctx, Stage::RankTopn, EventType::RankTopn, reasons_or(reasons, ReasonCode::StageOk))
                .with_data(json!({ "ranked": ranked.len(), "selected": selected })),
        )
        .await?;
        debug!(ranked = ranked.len(), selected = selected.len(), "rank top-n");
        self.cycle.ranked = selected;
        Ok(())
    }

    async fn deep(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let ranked: Vec<&Snapshot> = self
            .cycle
            .ranked
            .iter()
            .filter_map(|s| self.cycle.snapshots.get(s))
            .collect();
        let scores = deep_scan(&self.ctx.cfg.deep, &ranked);
        let rows: Vec<RankingRow> = scores
            .iter()
            .map(|d| RankingRow {
                rank: rank_i64(d.rank),
                symbol: d.symbol.clone(),
                score_x10000: d.score_x10000,
                components: json!({
                    "edge_bps": d.edge_bps,
                    "passed": d.passed,
                    "reasons": d.reasons,
                }),
            })
            .collect();
        self.selection
            .record_ranking(ctx.run_id, ctx.cycle_id, RankingStage::Deep, &rows, self.now())
            .await
            .context("deep scan rows")?;

        let passed: Vec<(String, i64)> = scores
            .iter()
            .filter(|d| d.passed)
            .map(|d| (d.symbol.clone(), d.score_x10000))
            .collect();
        let reasons = union(scores.iter().map(|d| d.reasons.as_slice()));
        self.write(
            self.record(ctx, Stage::DeepScan, EventType::DeepScan, reasons_or(reasons, ReasonCode::StageOk))
                .with_data(json!({
                    "scored": scores.len(),
                    "passed": passed.iter().map(|(s, _)| s).collect::<Vec<_>>(),
                })),
        )
        .await?;
        self.cycle.deep_passed = passed;
        Ok(())
    }

    async fn watchlist(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let candidates: Vec<TopKCandidate<'_>> = self
            .cycle
            .deep_passed
            .iter()
            .filter_map(|(symbol, score)| {
                self.cycle.snapshots.get(symbol).map(|s| TopKCandidate {
                    symbol,
                    score_x10000: *score,
                    returns: &s.returns,
                })
            })
            .collect();
        let outcome = select_top_k(&self.ctx.cfg.topk, &candidates, self.previous_topk.as_ref());
        let selected = outcome.selected();

        let rows: Vec<SelectionRow> = outcome
            .entries
            .iter()
            .filter(|e| e.selected)
            .enumerate()
            .map(|(i, e)| SelectionRow {
                rank: rank_i64(i + 1),
                symbol: e.symbol.clone(),
                score_x10000: e.score_x10000,
                reasons: e.reasons.clone(),
            })
            .collect();
        self.selection
            .record_selection(ctx.run_id, ctx.cycle_id, &rows, self.now())
            .await
            .context("selection rows")?;
        let reasons = union(outcome.entries.iter().map(|e| e.reasons.as_slice()));
        let data = serde_json::to_value(&outcome).context("top-k payload")?;
        self.write(
            self.record(ctx, Stage::WatchlistAttach, EventType::TopkSelection, reasons_or(reasons, ReasonCode::StageOk))
                .with_data(json!({ "selected": selected, "outcome": data })),
        )
        .await?;

        let age_cycles = match &self.previous_topk {
            Some(p) if p.symbols == selected => p.age_cycles + 1,
            _ => 0,
        };
        self.previous_topk = Some(PreviousTopK {
            symbols: selected.clone(),
            age_cycles,
        });
        info!(watchlist = ?selected, age_cycles, "watchlist attached");
        self.cycle.watchlist = selected;
        Ok(())
    }

    async fn state_update(&mut self) -> Result<()> {
        let stats = self.resolver.resolve_pending().await.context("resolve pending intents")?;
        if stats.inspected > 0 {
            info!(inspected = stats.inspected, confirmed = stats.confirmed, not_found = stats.not_found, "pending intents resolved");
        }

        let exchange = self.ctx.exchange.clone();
        let balances = exchange.balances().await.context("balances")?;
        let open_orders = exchange.open_orders(None).await.context("open orders")?;
        let tracked = self.tracked();
        let now = self.now();
        self.cycle.account = account_state(
            &self.ctx.cfg.exchange.quote_asset,
            &balances,
            &open_orders,
            &tracked,
            &self.ctx.books,
            &mut self.equity,
            now,
        );
        debug!(
            free_quote = %self.cycle.account.free_quote,
            exposure = %self.cycle.account.total_exposure,
            open_orders = self.cycle.account.open_orders,
            "account state"
        );
        self.sync = Some(SyncPoint { open_orders, balances });
        self.touched.clear();
        Ok(())
    }

    async fn propose(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let mut decisions = Vec::new();
        for symbol in &self.cycle.watchlist {
            let (Some(snapshot), Some(filters)) = (self.cycle.snapshots.get(symbol), self.cycle.filters.get(symbol))
            else {
                continue;
            };
            let constraints = match filters.to_constraints() {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol, error = %e, "constraints unavailable");
                    continue;
                }
            };
            match propose_entry(&self.ctx.cfg.strategy, snapshot, &constraints, ctx.cycle_id, self.now()) {
                Ok(Proposal::Entry(decision)) => {
                    let data = serde_json::to_value(&*decision).context("decision payload")?;
                    self.write(
                        self.record(ctx, Stage::StrategyPropose, EventType::DecisionProposed, decision.reasons.clone())
                            .with_snapshot(&decision.snapshot_id)
                            .with_decision(&decision.decision_id)
                            .with_data(json!({ "decision": data })),
                    )
                    .await?;
                    decisions.push(*decision);
                }
                Ok(Proposal::NoTrade { symbol, reasons }) => debug!(symbol, ?reasons, "no trade"),
                Err(e) => warn!(symbol, error = %e, "proposal failed"),
            }
        }
        info!(proposed = decisions.len(), "strategy propose");
        self.cycle.decisions = decisions;
        Ok(())
    }

    async fn advisory(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        if !self.gate.is_enabled() {
            return Ok(());
        }
        let scope = ReviewScope {
            run_id: ctx.run_id,
            cycle_id: ctx.cycle_id,
        };
        let mut kept = Vec::new();
        for decision in std::mem::take(&mut self.cycle.decisions) {
            let Some(snapshot) = self.cycle.snapshots.get(&decision.symbol) else {
                continue;
            };
            match self.gate.review(scope, &decision, snapshot).await {
                Ok(Some(outcome)) => {
                    outcome
                        .persist(&self.ctx.audit, &self.ctx.store)
                        .await
                        .context("advisory gate record")?;
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.aigate_call(outcome.result.verdict.as_str());
                    }
                    if outcome.proceeds() {
                        kept.push(outcome.decision);
                    } else {
                        info!(symbol = %decision.symbol, decision_id = %decision.decision_id, "blocked by advisory gate");
                    }
                }
                Ok(None) => kept.push(decision),
                Err(e) => warn!(symbol = %decision.symbol, error = %e, "advisory review failed, decision dropped"),
            }
        }
        self.cycle.decisions = kept;
        Ok(())
    }

    async fn risk_verdicts(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let mut allowed = Vec::new();
        for mut decision in std::mem::take(&mut self.cycle.decisions) {
            let Some(snapshot) = self.cycle.snapshots.get(&decision.symbol) else {
                continue;
            };
            let verdict = self.risk.evaluate(&decision, snapshot, &self.cycle.account, self.now());
            let data = serde_json::to_value(&verdict).context("risk verdict payload")?;
            self.write(
                self.record(ctx, Stage::RiskVerdict, EventType::RiskVerdict, verdict.reasons.clone())
                    .with_snapshot(&decision.snapshot_id)
                    .with_decision(&decision.decision_id)
                    .with_data(json!({ "verdict": data })),
            )
            .await?;

            let allow = verdict.verdict == RiskOutcome::Allow;
            if allow {
                // later decisions this cycle see the quote this one reserves
                if let Ok(q) = parse_decimal(&verdict.limits.required_quote) {
                    self.cycle.account.pending_reserve_quote += q;
                }
                self.cycle
                    .account
                    .positions
                    .entry(decision.symbol.clone())
                    .or_default()
                    .entry_pending = true;
                self.cycle.account.open_orders += 1;
            }
            decision.risk = Some(verdict);
            if allow {
                allowed.push(decision);
            }
        }
        self.cycle.decisions = allowed;
        Ok(())
    }

    fn count_intent(&self, state: IntentState) {
        if let Some(metrics) = &self.ctx.metrics {
            metrics.intent_state(state.as_str());
        }
    }

    async fn execute(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let scope = IntentScope {
            run_id: ctx.run_id,
            cycle_id: ctx.cycle_id,
        };
        let monitor = self.risk.monitor().clone();
        for decision in std::mem::take(&mut self.cycle.decisions) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let now = self.now();
            let intent = match entry_intent(scope, &decision, now) {
                Ok(intent) => intent,
                Err(e) => {
                    warn!(symbol = %decision.symbol, error = %e, "entry intent not built");
                    continue;
                }
            };
            self.touched.insert(decision.symbol.clone());
            match self.executor.submit_with_intent(&intent, ctx.cancel).await {
                Ok(execution) => {
                    let state = execution.intent.state;
                    self.count_intent(state);
                    if state == IntentState::Confirmed {
                        if !execution.reused {
                            monitor.record_entry(&decision.symbol, now);
                        }
                        self.cycle.opened.push(LocalOrder {
                            symbol: decision.symbol.clone(),
                            client_order_id: execution.intent.client_order_id.clone(),
                        });
                    }
                    info!(
                        symbol = %decision.symbol,
                        order_intent_id = %execution.intent.order_intent_id,
                        state = %state,
                        reused = execution.reused,
                        "entry submitted"
                    );
                }
                Err(OmsError::Rejected { order_intent_id, code, detail }) => {
                    self.count_intent(IntentState::FailedTerminal);
                    monitor.record_reject(&decision.symbol, now);
                    warn!(symbol = %decision.symbol, %order_intent_id, %code, %detail, "entry rejected");
                }
                Err(OmsError::SentUnknown { order_intent_id }) => {
                    self.count_intent(IntentState::SentUnknown);
                    warn!(symbol = %decision.symbol, %order_intent_id, "entry outcome unknown, left to the resolver");
                }
                Err(e) => return Err(e).context("entry submit"),
            }
        }
        Ok(())
    }

    async fn manage_positions(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let scope = IntentScope {
            run_id: ctx.run_id,
            cycle_id: ctx.cycle_id,
        };
        let mut symbols: BTreeSet<String> = self.cycle.universe.iter().cloned().collect();
        if let Some(sync) = &self.sync {
            symbols.extend(sync.open_orders.iter().map(|o| o.symbol.clone()));
        }
        let monitor = self.risk.monitor().clone();
        for symbol in symbols {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let Some(filters) = self.cycle.filters.get(&symbol) else {
                continue;
            };
            let Ok(constraints) = filters.to_constraints() else {
                continue;
            };
            let best_bid = self.ctx.books.latest(&symbol).map(|s| s.bid_price);
            let now = self.now();
            let managed = match self
                .entries
                .manage_symbol(scope, &symbol, best_bid.as_deref(), &constraints, now, ctx.cancel)
                .await
            {
                Ok(managed) => managed,
                Err(e) => {
                    warn!(%symbol, error = %e, "entry management failed");
                    self.touched.insert(symbol);
                    continue;
                }
            };
            for entry in managed {
                match entry.action {
                    EntryAction::Waiting => continue,
                    EntryAction::Repriced { .. } => monitor.record_cancel_replace(&symbol, now),
                    EntryAction::Cancelled => monitor.record_churn(&symbol, now),
                    EntryAction::Protected { .. } | EntryAction::Closed | EntryAction::Unresolved => {}
                }
                self.touched.insert(symbol.clone());
            }
        }
        Ok(())
    }

    async fn reconcile(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        if !self.reconciler.due(self.now()) {
            return Ok(());
        }
        let Some(sync) = &self.sync else {
            debug!("no account sync yet, reconcile deferred");
            return Ok(());
        };
        let mut open_orders: Vec<LocalOrder> = sync.open_orders.iter().map(LocalOrder::from).collect();
        open_orders.extend(self.cycle.opened.iter().cloned());
        let local = LocalView {
            quote_asset: self.ctx.cfg.exchange.quote_asset.clone(),
            open_orders,
            balances: sync.balances.clone(),
            tracked: self.tracked(),
            touched: self.touched.clone(),
        };
        match self.reconciler.reconcile(ctx.run_id, ctx.cycle_id, &local).await {
            Ok(report) => debug!(score_x10000 = report.score_x10000, action = ?report.action, "reconciled"),
            Err(e) => warn!(error = %e, "reconcile failed"),
        }
        Ok(())
    }

    async fn daily_summary(&mut self, ctx: StageCtx<'_>) -> Result<()> {
        let now = self.now();
        let Some((from, to)) = self.summary.roll(now) else {
            return Ok(());
        };
        let summary = DailySummary::collect(&self.ctx.store, from, to).await.context("daily summary")?;
        summary
            .write(&self.ctx.audit, ctx.run_id, ctx.cycle_id, Stage::ReportDailySummary, now)
            .await
    }

    async fn partial_summary(&self, ctx: StageCtx<'_>) -> Result<()> {
        let now = self.now();
        let from = self.summary.day_start_ms().unwrap_or(now - now.rem_euclid(DAY_MS));
        let mut summary = DailySummary::collect(&self.ctx.store, from, now + 1)
            .await
            .context("partial daily summary")?;
        summary.partial = true;
        summary
            .write(&self.ctx.audit, ctx.run_id, ctx.cycle_id, Stage::Shutdown, now)
            .await
    }
}

#[async_trait]
impl StageWork for LivePipeline {
    async fn run_stage(&mut self, stage: Stage, ctx: StageCtx<'_>) -> Result<()> {
        match stage {
            Stage::Boot => self.boot().await,
            Stage::DoctorChecks => self.doctor(ctx).await,
            Stage::StartupRecover => self.recover().await,
            Stage::UniverseScan => self.universe_scan(ctx).await,
            Stage::RankTopn => self.rank(ctx).await,
            Stage::DeepScan => self.deep(ctx).await,
            Stage::WatchlistAttach => self.watchlist(ctx).await,
            Stage::StateUpdate => self.state_update().await,
            Stage::StrategyPropose => self.propose(ctx).await,
            Stage::AigateCall => self.advisory(ctx).await,
            Stage::RiskVerdict => self.risk_verdicts(ctx).await,
            Stage::ExecuteIntent => self.execute(ctx).await,
            Stage::PositionManage => self.manage_positions(ctx).await,
            Stage::ReconcileRest => self.reconcile(ctx).await,
            Stage::ReportDailySummary => self.daily_summary(ctx).await,
            Stage::Shutdown => self.partial_summary(ctx).await,
            Stage::Degrade | Stage::Pause => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::market::fixtures::btc_filters;
    use pretty_assertions::assert_eq;

    fn filters(symbol: &str, status: &str, quote: &str) -> SymbolFilters {
        SymbolFilters {
            symbol: symbol.into(),
            status: status.into(),
            quote_asset: quote.into(),
            ..btc_filters()
        }
    }

    #[test]
    fn test_configured_symbols_win() {
        let cfg = AgentConfig::default();
        let listed = [filters("SOLUSDT", STATUS_TRADING, "USDT")];
        assert_eq!(universe_symbols(&cfg, &listed), cfg.runtime.symbols);
    }

    #[test]
    fn test_empty_list_scans_trading_quote_pairs() {
        let mut cfg = AgentConfig::default();
        cfg.runtime.symbols.clear();
        let listed = [
            filters("SOLUSDT", STATUS_TRADING, "USDT"),
            filters("ADAUSDT", STATUS_TRADING, "USDT"),
            filters("ETHBTC", STATUS_TRADING, "BTC"),
            filters("LUNAUSDT", "BREAK", "USDT"),
        ];
        assert_eq!(universe_symbols(&cfg, &listed), ["ADAUSDT", "SOLUSDT"]);
    }

    #[test]
    fn test_reason_union_keeps_first_seen_order() {
        let a = [ReasonCode::UniverseEligible];
        let b = [ReasonCode::UniverseEligible, ReasonCode::RankSelected];
        assert_eq!(union([&a[..], &b[..]]), [ReasonCode::UniverseEligible, ReasonCode::RankSelected]);
        assert_eq!(reasons_or(Vec::new(), ReasonCode::StageOk), [ReasonCode::StageOk]);
    }
}
