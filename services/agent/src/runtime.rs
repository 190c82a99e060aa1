//! Process wiring behind the CLI commands
//!
//! `run` owns the long-lived tasks: the cycle loop, book-ticker ingest, the
//! REST heartbeat, the health supervisor and the metrics endpoint. All of
//! them stop on one cancellation token; the cycle loop then writes the
//! shutdown trail and the audit writer is drained last.

use anyhow::{Context, Result, bail};
use common::ids::NonceSource;
use common::{AgentConfig, Clock, ReasonCode, Stage, SystemClock, SystemMode, SystemModeCell, ThreadRngNonce};
use feeds::{BinanceRest, BookTickerStore, ExchangeRest, run_book_ticker, stream_url};
use monitoring::{AgentMetrics, HealthSupervisor, HealthThresholds, Heartbeats, MetricsState, serve};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{AuditWriter, Store};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AgentContext;
use crate::doctor::{DoctorReport, run_checks};
use crate::orchestrator::{DryRun, Orchestrator, WalkOutcome};
use crate::pipeline::{LivePipeline, universe_symbols};
use crate::reporter::{ConsoleReporter, StageReporter, TracingReporter};

/// Stages run once before the first cycle
pub const STARTUP_STAGES: [Stage; 3] = [Stage::Boot, Stage::DoctorChecks, Stage::StartupRecover];

/// Book samples older than this are pruned
const BOOK_RETENTION_MS: i64 = 300_000;

/// Options of the `run` command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Print stage transitions on stdout
    pub console: bool,
    /// Stop after this many cycles
    pub max_cycles: Option<u64>,
    /// Do not connect the book-ticker stream
    pub no_stream: bool,
}

/// What a dry run walked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    /// Run id
    pub run_id: String,
    /// Cycle id
    pub cycle_id: String,
    /// STAGE_CHANGED records written
    pub stages: usize,
}

/// Per-cycle stages of the default sequence
#[must_use]
pub fn cycle_stages() -> Vec<Stage> {
    Stage::DEFAULT_SEQUENCE
        .iter()
        .copied()
        .filter(|s| !s.is_process_scoped())
        .collect()
}

/// Load, apply environment overrides and validate
///
/// # Errors
///
/// Returns an error if the file cannot be read or the config is invalid.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    AgentConfig::load(path).with_context(|| format!("config {}", path.display()))
}

fn busy_timeout_ms(cfg: &AgentConfig) -> u64 {
    cfg.audit.audit_writer_max_lag_ms.max(1)
}

/// Open the store without touching the schema
async fn open_store(cfg: &AgentConfig) -> Result<Store> {
    Store::open(&cfg.runtime.db_path, busy_timeout_ms(cfg))
        .await
        .with_context(|| format!("store {}", cfg.runtime.db_path.display()))
}

/// Open the store and ensure the schema
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrated.
pub async fn migrate(cfg: &AgentConfig) -> Result<Store> {
    let store = open_store(cfg).await?;
    let applied = store.migrate().await.context("schema migration")?;
    info!(db = %cfg.runtime.db_path.display(), applied, "schema ready");
    Ok(store)
}

/// Run the startup checks outside a cycle
///
/// # Errors
///
/// Returns an error only if the exchange client cannot be built.
pub async fn doctor(cfg: &AgentConfig, offline: bool) -> Result<DoctorReport> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = match open_store(cfg).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "store not opened");
            None
        }
    };
    let exchange = if offline {
        None
    } else {
        Some(BinanceRest::new(&cfg.exchange, clock.clone()).context("exchange client")?)
    };
    let report = run_checks(
        cfg,
        store.as_ref(),
        exchange.as_ref().map(|e| e as &dyn ExchangeRest),
        clock.as_ref(),
    )
    .await;
    if let Some(store) = store {
        store.close().await;
    }
    Ok(report)
}

/// Walk the default sequence once without doing any work
///
/// Writes one STAGE_CHANGED per stage with reason DRY_RUN.
///
/// # Errors
///
/// Returns an error if the store or the audit writer fails.
pub async fn dry_run(cfg: &AgentConfig, console: bool) -> Result<DryRunReport> {
    dry_run_with(cfg, Arc::new(SystemClock), Arc::new(ThreadRngNonce), reporter(console)).await
}

/// [`dry_run`] with an explicit clock, nonce source and reporter
///
/// # Errors
///
/// Returns an error if the store or the audit writer fails.
pub async fn dry_run_with(
    cfg: &AgentConfig,
    clock: Arc<dyn Clock>,
    nonces: Arc<dyn NonceSource>,
    reporter: Arc<dyn StageReporter>,
) -> Result<DryRunReport> {
    let store = migrate(cfg).await?;
    let audit = Arc::new(
        AuditWriter::spawn(store.clone(), &cfg.audit.dir, &cfg.audit, clock.clone())
            .await
            .context("audit writer")?,
    );
    let orchestrator = Orchestrator::new(
        audit.clone(),
        clock,
        nonces,
        Arc::new(SystemModeCell::default()),
        Arc::new(Heartbeats::default()),
        reporter,
    )?;
    let cycle_id = orchestrator.next_cycle()?;
    let cancel = CancellationToken::new();
    let outcome = orchestrator
        .walk(&Stage::DEFAULT_SEQUENCE, &cycle_id, &mut DryRun, &cancel)
        .await;
    audit.shutdown().await;
    store.close().await;
    if outcome? != WalkOutcome::Completed {
        bail!("dry run stopped early");
    }
    Ok(DryRunReport {
        run_id: orchestrator.run_id().to_string(),
        cycle_id,
        stages: Stage::DEFAULT_SEQUENCE.len(),
    })
}

fn reporter(console: bool) -> Arc<dyn StageReporter> {
    if console { Arc::new(ConsoleReporter) } else { Arc::new(TracingReporter) }
}

/// Run the agent against the live exchange until interrupted
///
/// # Errors
///
/// Returns an error if startup fails or the shutdown trail cannot be
/// written.
pub async fn run(cfg: AgentConfig, opts: &RunOptions) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = migrate(&cfg).await?;
    let audit = Arc::new(
        AuditWriter::spawn(store.clone(), &cfg.audit.dir, &cfg.audit, clock.clone())
            .await
            .context("audit writer")?,
    );
    let exchange: Arc<dyn ExchangeRest> =
        Arc::new(BinanceRest::new(&cfg.exchange, clock.clone()).context("exchange client")?);
    let metrics = match cfg.runtime.metrics_addr {
        Some(_) => Some(AgentMetrics::new().context("metrics registry")?),
        None => None,
    };
    let ctx = AgentContext {
        cfg: Arc::new(cfg),
        store: store.clone(),
        audit: audit.clone(),
        exchange,
        books: Arc::new(BookTickerStore::new(BOOK_RETENTION_MS)),
        clock,
        heartbeats: Arc::new(Heartbeats::default()),
        mode: Arc::new(SystemModeCell::default()),
        metrics,
    };

    let result = run_with(ctx, Arc::new(ThreadRngNonce), opts).await;
    audit.shutdown().await;
    store.close().await;
    result
}

/// Run the cycle loop and its companion tasks over `ctx`
///
/// # Errors
///
/// Returns an error if a startup stage fails, the metrics address is
/// invalid, or the shutdown trail cannot be written. Errors inside a cycle
/// end that cycle only.
pub async fn run_with(ctx: AgentContext, nonces: Arc<dyn NonceSource>, opts: &RunOptions) -> Result<()> {
    let cfg = ctx.cfg.clone();
    let cancel = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(
        ctx.audit.clone(),
        ctx.clock.clone(),
        nonces,
        ctx.mode.clone(),
        ctx.heartbeats.clone(),
        reporter(opts.console),
    )?;
    if let Some(metrics) = &ctx.metrics {
        orchestrator = orchestrator.with_metrics(metrics.clone());
    }

    // staleness is measured from process start until the first real signal
    let started = ctx.clock.now_ms();
    ctx.heartbeats.loop_progress(started);
    ctx.heartbeats.ws_message(started);
    ctx.heartbeats.rest_success(started);

    let mut tasks = JoinSet::new();
    spawn_supervisor(&mut tasks, &ctx, orchestrator.run_id(), &cancel);
    tasks.spawn(pump_heartbeats(ctx.clone(), cancel.clone()));
    spawn_metrics(&mut tasks, &ctx, &cancel)?;
    tasks.spawn(interrupt(ctx.heartbeats.clone(), cancel.clone()));

    let mut pipeline = LivePipeline::new(ctx.clone())?;
    let mut cycle_id = orchestrator.next_cycle()?;
    let result = cycle_loop(&ctx, opts, &orchestrator, &mut pipeline, &mut cycle_id, &mut tasks, &cancel).await;

    let reason = if ctx.mode.get() == SystemMode::Exit && !ctx.heartbeats.exit_requested() {
        ReasonCode::ForceExit
    } else {
        ReasonCode::ShutdownRequested
    };
    if let Err(e) = &result {
        error!(cycle_id = %cycle_id, error = %format!("{e:#}"), "run aborted");
    }
    let shutdown = orchestrator.shutdown(&cycle_id, reason, &mut pipeline, &cancel).await;
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "task ended abnormally");
        }
    }
    info!(run_id = orchestrator.run_id(), config_hash = ?cfg.config_hash().ok(), "stopped");
    result.and(shutdown)
}

async fn cycle_loop(
    ctx: &AgentContext,
    opts: &RunOptions,
    orchestrator: &Orchestrator,
    pipeline: &mut LivePipeline,
    cycle_id: &mut String,
    tasks: &mut JoinSet<()>,
    cancel: &CancellationToken,
) -> Result<()> {
    if let WalkOutcome::Exited { at } = orchestrator.walk(&STARTUP_STAGES, cycle_id, pipeline, cancel).await? {
        info!(stage = %at, "exit during startup");
        return Ok(());
    }
    if !opts.no_stream {
        spawn_book_stream(tasks, ctx, cancel).await;
    }

    let stages = cycle_stages();
    let interval = Duration::from_millis(ctx.cfg.runtime.cycle_interval_ms);
    let mut cycles = 0_u64;
    loop {
        let started = tokio::time::Instant::now();
        match orchestrator.walk(&stages, cycle_id, pipeline, cancel).await {
            Ok(WalkOutcome::Completed) => {}
            Ok(WalkOutcome::Exited { at }) => {
                info!(cycle_id = %cycle_id, stage = %at, "cycle stopped for exit");
                return Ok(());
            }
            Err(e) => error!(cycle_id = %cycle_id, error = %format!("{e:#}"), "cycle failed"),
        }
        cycles += 1;
        if opts.max_cycles.is_some_and(|max| cycles >= max) {
            info!(cycles, "cycle limit reached");
            return Ok(());
        }

        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(wait) => {}
        }
        if orchestrator.mode() == SystemMode::Exit {
            return Ok(());
        }
        *cycle_id = orchestrator.next_cycle()?;
    }
}

fn spawn_supervisor(tasks: &mut JoinSet<()>, ctx: &AgentContext, run_id: &str, cancel: &CancellationToken) {
    let cfg = &ctx.cfg;
    let data_dir = cfg
        .runtime
        .db_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let thresholds = HealthThresholds::from_config(&cfg.health, &cfg.audit).with_drift(&cfg.reconcile);
    let mut supervisor = HealthSupervisor::new(
        thresholds,
        ctx.mode.clone(),
        ctx.heartbeats.clone(),
        ctx.audit.clone(),
        ctx.clock.clone(),
        run_id,
        data_dir,
    );
    if let Some(metrics) = &ctx.metrics {
        supervisor = supervisor.with_metrics(metrics.clone());
    }
    tasks.spawn(supervisor.run(Duration::from_millis(cfg.health.tick_interval_ms), cancel.clone()));
}

fn spawn_metrics(tasks: &mut JoinSet<()>, ctx: &AgentContext, cancel: &CancellationToken) -> Result<()> {
    let (Some(addr), Some(metrics)) = (&ctx.cfg.runtime.metrics_addr, &ctx.metrics) else {
        return Ok(());
    };
    let addr: SocketAddr = addr.parse().with_context(|| format!("metrics_addr {addr}"))?;
    let state = MetricsState {
        metrics: metrics.clone(),
        mode: ctx.mode.clone(),
    };
    let cancel = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = serve(addr, state, cancel).await {
            error!(%addr, error = %e, "metrics endpoint failed");
        }
    });
    Ok(())
}

async fn spawn_book_stream(tasks: &mut JoinSet<()>, ctx: &AgentContext, cancel: &CancellationToken) {
    let symbols = match ctx.exchange.exchange_info().await {
        Ok(filters) => universe_symbols(&ctx.cfg, &filters),
        Err(e) => {
            warn!(error = %e, "exchange info unavailable, streaming configured symbols");
            ctx.cfg.runtime.symbols.clone()
        }
    };
    if symbols.is_empty() {
        warn!("no symbols to stream");
        return;
    }
    let url = stream_url(&ctx.cfg.exchange.ws_base_url, &symbols);
    info!(symbols = symbols.len(), "book ticker stream starting");
    tasks.spawn(run_book_ticker(url, ctx.books.clone(), ctx.clock.clone(), cancel.clone()));
}

/// Copies feed activity into the heartbeats and pings REST when idle
async fn pump_heartbeats(ctx: AgentContext, cancel: CancellationToken) {
    let tick = Duration::from_millis(ctx.cfg.health.tick_interval_ms.max(1));
    let idle_ms = (ctx.cfg.health.rest_stale_ms_degrade / 2).max(1);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(tick) => {}
        }
        if let Some(ts) = ctx.books.last_message_ms() {
            ctx.heartbeats.ws_message(ts);
        }
        let now = ctx.clock.now_ms();
        let last = ctx.exchange.last_success_ms().unwrap_or(0);
        if now - last >= idle_ms {
            if let Err(e) = ctx.exchange.ping().await {
                warn!(error = %e, "REST heartbeat failed");
            }
        }
        if let Some(ts) = ctx.exchange.last_success_ms() {
            ctx.heartbeats.rest_success(ts);
        }
    }
}

async fn interrupt(heartbeats: Arc<Heartbeats>, cancel: CancellationToken) {
    tokio::select! {
        () = cancel.cancelled() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("interrupt received, shutting down");
                heartbeats.request_exit();
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "interrupt handler unavailable"),
        },
    }
}
