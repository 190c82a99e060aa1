//! Risk Manager Service
//!
//! Pre-trade gate for spot entries. Every proposed ENTRY passes through
//! [`RiskEngine::evaluate`], which checks:
//! - cost inputs and the adaptive minimum edge
//! - position policy (one position or pending entry per symbol)
//! - symbol health, cooldown and loss streak
//! - trade, order, churn and cancel-replace rates
//! - daily loss, drawdown, exposure and free balance
//!
//! Checks never short-circuit: a blocked verdict carries every applicable
//! reason code together with the limits that were in force.

#![forbid(unsafe_code)]

pub mod circuit_breaker;
pub mod limits;
pub mod monitor;

pub use limits::{EdgeThreshold, adaptive_min_edge};
pub use monitor::{ActivityCounts, ActivityMonitor};

use common::config::RiskConfig;
use common::decimal::{format_plain, parse_decimal};
use common::model::decision::{ActiveLimits, Decision, DecisionIntent, RiskOutcome, RiskVerdict};
use common::model::snapshot::Snapshot;
use common::reason::push_unique;
use common::{ErrorKind, ReasonCode};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Symbol status that admits new entries
pub const STATUS_TRADING: &str = "TRADING";

/// Risk configuration errors
#[derive(Error, Debug)]
pub enum RiskError {
    /// A limit is out of its legal range
    #[error("Invalid risk limit {field}: {detail}")]
    InvalidLimit {
        /// Config key
        field: &'static str,
        /// What is wrong
        detail: String,
    },
}

impl RiskError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidLimit { .. } => ErrorKind::ConfigInvalid,
        }
    }
}

/// Risk result
pub type RiskResult<T> = Result<T, RiskError>;

/// Holdings and open work for one symbol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolPosition {
    /// Quote value of the held base asset
    pub exposure: Decimal,
    /// A filled entry is still held
    pub position_open: bool,
    /// An entry order is working
    pub entry_pending: bool,
}

/// Account-level state gathered by the caller before each verdict
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    /// Free quote balance
    pub free_quote: Decimal,
    /// Quote locked in open orders
    pub locked_quote: Decimal,
    /// Quote reserved for entries not yet on the book
    pub pending_reserve_quote: Decimal,
    /// Realized PnL since UTC midnight
    pub realized_pnl_today: Decimal,
    /// Mark-to-market PnL of open positions
    pub unrealized_pnl: Decimal,
    /// Equity at UTC midnight
    pub start_equity: Decimal,
    /// Highest equity seen today
    pub peak_equity: Decimal,
    /// Quote exposure across every symbol
    pub total_exposure: Decimal,
    /// Open orders on the exchange
    pub open_orders: u32,
    /// Entries on the book without any fill
    pub unfilled_orders: u32,
    /// Latest WebSocket event delay
    pub ws_latency_ms: i64,
    /// Per-symbol holdings
    pub positions: FxHashMap<String, SymbolPosition>,
}

impl AccountState {
    /// Quote usable for a new entry
    #[must_use]
    pub fn available_quote(&self) -> Decimal {
        self.free_quote - self.locked_quote - self.pending_reserve_quote
    }

    /// Start equity plus today's PnL
    #[must_use]
    pub fn equity(&self) -> Decimal {
        self.start_equity + self.realized_pnl_today + self.unrealized_pnl
    }
}

/// Entry notional and the quote it reserves including the taker fee
struct EntrySizing {
    notional: Decimal,
    required_quote: Decimal,
}

fn entry_sizing(decision: &Decision, snapshot: &Snapshot) -> Option<EntrySizing> {
    let entry = decision.entry.as_ref()?;
    let price = parse_decimal(&entry.limit_price).ok()?;
    let qty = parse_decimal(&entry.qty).ok()?;
    if price <= Decimal::ZERO || qty <= Decimal::ZERO {
        return None;
    }
    let notional = price.checked_mul(qty)?;
    let fee_bps = Decimal::from(snapshot.cost_inputs.taker_fee_bps.max(0));
    let fee = notional.checked_mul(fee_bps)? / Decimal::from(10_000);
    Some(EntrySizing {
        notional,
        required_quote: notional + fee,
    })
}

/// Pre-trade risk gate
#[derive(Debug)]
pub struct RiskEngine {
    cfg: RiskConfig,
    monitor: Arc<ActivityMonitor>,
}

impl RiskEngine {
    /// Gate over `cfg`, reading rolling counts from `monitor`
    pub fn new(cfg: RiskConfig, monitor: Arc<ActivityMonitor>) -> RiskResult<Self> {
        validate_config(&cfg)?;
        info!(
            min_edge_bps = cfg.min_edge_bps,
            max_trades_day = cfg.max_trades_day,
            daily_loss_limit = %cfg.daily_loss_limit_usdt,
            "Risk engine ready"
        );
        Ok(Self { cfg, monitor })
    }

    /// Limits in force
    #[must_use]
    pub const fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Shared activity counters
    #[must_use]
    pub fn monitor(&self) -> &Arc<ActivityMonitor> {
        &self.monitor
    }

    /// Verdict for `decision` against `snapshot` and the account at `now_ms`
    ///
    /// Non-entry intents reduce risk and are passed through with
    /// `RISK_NOT_ENTRY`.
    #[must_use]
    pub fn evaluate(
        &self,
        decision: &Decision,
        snapshot: &Snapshot,
        account: &AccountState,
        now_ms: i64,
    ) -> RiskVerdict {
        let cfg = &self.cfg;
        let edge = adaptive_min_edge(cfg, snapshot);
        let counts = self.monitor.counts(&decision.symbol, now_ms);
        let position = account.positions.get(&decision.symbol).cloned().unwrap_or_default();
        let sizing = entry_sizing(decision, snapshot);
        let notional = sizing.as_ref().map_or(Decimal::ZERO, |s| s.notional);
        let required = sizing.as_ref().map_or(Decimal::ZERO, |s| s.required_quote);
        let available = account.available_quote();

        let limits = ActiveLimits {
            base_min_edge_bps: edge.base_bps,
            min_edge_multiplier_x10000: edge.multiplier_x10000,
            adjusted_min_edge_bps: edge.adjusted_bps,
            trades_in_window: counts.trades_in_window,
            trades_today: counts.trades_today,
            open_orders: account.open_orders,
            symbol_exposure_after: format_plain(position.exposure + notional),
            total_exposure_after: format_plain(account.total_exposure + notional),
            required_quote: format_plain(required),
            available_quote: format_plain(available),
        };

        if decision.intent != DecisionIntent::Entry {
            return RiskVerdict {
                verdict: RiskOutcome::Allow,
                reasons: vec![ReasonCode::RiskNotEntry],
                limits,
                cost_inputs: snapshot.cost_inputs.clone(),
            };
        }

        let mut reasons = Vec::new();
        let mut block = |code| push_unique(&mut reasons, code);

        if !snapshot.cost_inputs.is_valid() || sizing.is_none() {
            block(ReasonCode::StratInputInvalid);
        }
        if decision.expected_edge_bps < edge.adjusted_bps {
            block(ReasonCode::StratEdgeBelowMin);
        }

        if position.position_open {
            block(ReasonCode::RiskPositionAlreadyOpen);
        }
        if position.entry_pending {
            block(ReasonCode::RiskEntryAlreadyPending);
        }

        let health = &snapshot.health;
        let rejects = counts.rejects_last_hour.max(health.recent_rejects);
        if health.quarantine_until_ms > now_ms
            || health.symbol_status != STATUS_TRADING
            || rejects >= cfg.max_rejects_per_hour
            || !health.filters_ok
        {
            block(ReasonCode::SymbolQuarantined);
        }
        if now_ms < counts.cooldown_until_ms {
            block(ReasonCode::RiskCooldownActive);
        }

        if counts.trades_in_window >= cfg.max_trades_window {
            block(ReasonCode::RiskMaxTradesWindow);
        }
        if counts.trades_today >= cfg.max_trades_day {
            block(ReasonCode::RiskMaxTradesDay);
        }
        if account.open_orders >= cfg.max_open_orders {
            block(ReasonCode::RiskMaxOpenOrders);
        }
        if counts.consecutive_losses >= cfg.max_consecutive_losses {
            block(ReasonCode::RiskSymbolLossStreak);
        }
        if account.ws_latency_ms >= cfg.max_ws_latency_ms {
            block(ReasonCode::WsOooEvent);
        }
        if counts.churn_last_hour >= cfg.max_churn_per_hour {
            block(ReasonCode::RiskChurnLimitHit);
        }
        if counts.cancel_replace_last_hour >= cfg.max_cancel_replace_per_hour {
            block(ReasonCode::RiskCancelReplaceLimitHit);
        }
        if account.unfilled_orders >= cfg.max_unfilled_orders {
            block(ReasonCode::RiskUnfilledOrderCountRisk);
        }

        let pnl = account.realized_pnl_today + account.unrealized_pnl;
        if pnl <= cfg.daily_loss_limit_usdt {
            block(ReasonCode::RiskDailyLossLimit);
        }
        if account.peak_equity - account.equity() >= cfg.max_drawdown_usdt {
            block(ReasonCode::RiskDrawdownLimit);
        }
        if position.exposure + notional > cfg.max_symbol_exposure_usdt
            || account.total_exposure + notional > cfg.max_total_exposure_usdt
        {
            block(ReasonCode::RiskExposureLimit);
        }
        if required > available {
            block(ReasonCode::RiskInsufficientFreeBalance);
        }
        if sizing.is_some() && below_min_notional(notional, &decision.constraints.min_notional) {
            block(ReasonCode::ProtectionInvalidMinNotional);
        }

        let verdict = if reasons.is_empty() {
            reasons.push(ReasonCode::RiskAllow);
            debug!(symbol = %decision.symbol, decision_id = %decision.decision_id, "Risk allow");
            RiskOutcome::Allow
        } else {
            warn!(
                symbol = %decision.symbol,
                decision_id = %decision.decision_id,
                reasons = ?reasons,
                "Risk block"
            );
            RiskOutcome::Block
        };

        RiskVerdict {
            verdict,
            reasons,
            limits,
            cost_inputs: snapshot.cost_inputs.clone(),
        }
    }
}

fn below_min_notional(notional: Decimal, min_notional: &str) -> bool {
    // An unparsable floor is a filter problem, not a sizing one
    parse_decimal(min_notional).is_ok_and(|min| notional < min)
}

fn validate_config(cfg: &RiskConfig) -> RiskResult<()> {
    let invalid = |field: &'static str, detail: &str| -> RiskResult<()> {
        Err(RiskError::InvalidLimit {
            field,
            detail: detail.to_string(),
        })
    };
    if cfg.min_edge_bps < 0 {
        return invalid("min_edge_bps", "must be non-negative");
    }
    if cfg.adaptive_max_multiplier_x10000 < limits::UNIT_X10000 {
        return invalid("adaptive_max_multiplier_x10000", "must be at least 10000");
    }
    if cfg.trades_window_ms <= 0 {
        return invalid("trades_window_ms", "must be positive");
    }
    if cfg.daily_loss_limit_usdt > Decimal::ZERO {
        return invalid("daily_loss_limit_usdt", "must be zero or negative");
    }
    if cfg.max_drawdown_usdt <= Decimal::ZERO {
        return invalid("max_drawdown_usdt", "must be positive");
    }
    if cfg.max_symbol_exposure_usdt <= Decimal::ZERO || cfg.max_total_exposure_usdt <= Decimal::ZERO {
        return invalid("max_symbol_exposure_usdt", "exposure caps must be positive");
    }
    if cfg.cooldown_ms_after_loss < 0 {
        return invalid("cooldown_ms_after_loss", "must be non-negative");
    }
    Ok(())
}
