//! Agent configuration
//!
//! A single TOML document grouped by concern. Every section has defaults so a
//! partial file is valid; secrets come from the environment and are never
//! serialized, logged or hashed.

use crate::canonical::canonical_hash;
use crate::error::{CommonError, CommonResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable holding the exchange API key
pub const ENV_API_KEY: &str = "SPOT_AGENT_API_KEY";
/// Environment variable holding the exchange API secret
pub const ENV_API_SECRET: &str = "SPOT_AGENT_API_SECRET";
/// Environment variable holding the advisory model bearer token
pub const ENV_AIGATE_KEY: &str = "SPOT_AGENT_AIGATE_KEY";

const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Configuration failures; all map to config-invalid
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Cannot read config {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML did not parse into the schema
    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is missing or out of range
    #[error("Invalid config {field}: {detail}")]
    Invalid {
        /// Dotted field path
        field: &'static str,
        /// Constraint that failed
        detail: String,
    },
}

fn invalid(field: &'static str, detail: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        detail: detail.into(),
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Process-level settings
    pub runtime: RuntimeConfig,
    /// Exchange endpoints and credentials
    pub exchange: ExchangeConfig,
    /// Universe eligibility
    pub universe: UniverseConfig,
    /// Top-N ranking
    pub rank: RankConfig,
    /// Deep scan filters and weights
    pub deep: DeepConfig,
    /// Correlation-aware top-K
    pub topk: TopKConfig,
    /// Entry proposer
    pub strategy: StrategyConfig,
    /// Entry risk gate
    pub risk: RiskConfig,
    /// Advisory model gate
    pub aigate: AiGateConfig,
    /// Order executor
    pub executor: ExecutorConfig,
    /// Health supervisor thresholds
    pub health: HealthConfig,
    /// Reconciler
    pub reconcile: ReconcileConfig,
    /// Audit writer
    pub audit: AuditConfig,
    /// Redaction policy
    pub redaction: RedactionConfig,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run mode; only "LIVE" is accepted
    pub mode: String,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Symbols allow-list; empty means every TRADING symbol in the quote asset
    pub symbols: Vec<String>,
    /// Pause between cycles
    pub cycle_interval_ms: u64,
    /// Address for `/metrics` and `/healthz`; disabled when absent
    pub metrics_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: crate::MODE_LIVE.to_string(),
            db_path: PathBuf::from("data/agent.db"),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            cycle_interval_ms: 60_000,
            metrics_addr: None,
        }
    }
}

/// Exchange endpoints and credentials
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// REST base URL
    pub rest_base_url: String,
    /// WebSocket base URL
    pub ws_base_url: String,
    /// API key, from the environment
    #[serde(skip_serializing)]
    pub api_key: String,
    /// API secret, from the environment
    #[serde(skip_serializing)]
    pub api_secret: String,
    /// Signed request `recvWindow`; also the future-timestamp budget
    pub time_sync_recv_window_ms: i64,
    /// Per-request timeout for REST calls
    pub request_timeout_ms: u64,
    /// Quote asset of the traded universe
    pub quote_asset: String,
    /// Maker fee in bps
    pub maker_fee_bps: i64,
    /// Taker fee in bps
    pub taker_fee_bps: i64,
    /// Exchange request-weight budget per minute
    pub weight_limit_1m: u32,
    /// Exchange order budget per ten seconds
    pub order_limit_10s: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:9443".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            time_sync_recv_window_ms: 5_000,
            request_timeout_ms: 10_000,
            quote_asset: "USDT".to_string(),
            maker_fee_bps: 10,
            taker_fee_bps: 10,
            weight_limit_1m: 6_000,
            order_limit_10s: 100,
        }
    }
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("rest_base_url", &self.rest_base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("api_key", &redacted(&self.api_key))
            .field("api_secret", &redacted(&self.api_secret))
            .field("time_sync_recv_window_ms", &self.time_sync_recv_window_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("quote_asset", &self.quote_asset)
            .finish_non_exhaustive()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

/// Universe eligibility floors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    /// Minimum 24h quote volume
    pub min_quote_volume_24h: Decimal,
    /// Minimum 24h trade count
    pub min_trade_count_24h: u64,
    /// Minimum 24h price change in bps
    pub min_price_change_bps: i64,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            min_quote_volume_24h: Decimal::new(10_000_000, 0),
            min_trade_count_24h: 10_000,
            min_price_change_bps: -10_000,
        }
    }
}

/// Top-N ranking weights; the three weights sum to exactly 1.0
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    /// Keep this many after ranking
    pub top_n: usize,
    /// Weight of normalized quote volume
    pub weight_liquidity: f64,
    /// Weight of normalized price change
    pub weight_momentum: f64,
    /// Weight of inverted normalized spread
    pub weight_spread: f64,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            top_n: 20,
            weight_liquidity: 0.5,
            weight_momentum: 0.3,
            weight_spread: 0.2,
        }
    }
}

/// Deep-scan filters and score weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepConfig {
    /// Maximum current spread
    pub deep_max_spread_bps: i64,
    /// Minimum 10s bid/ask imbalance
    pub deep_min_imbalance_x10000: i64,
    /// Minimum ATR-minus-costs edge estimate
    pub deep_min_edge_bps: i64,
    /// Weight of the edge component
    pub weight_edge: f64,
    /// Weight of the regime component
    pub weight_regime: f64,
    /// Weight of the micro-structure component
    pub weight_micro: f64,
    /// Weight of the volatility component
    pub weight_volatility: f64,
    /// ATR normalizer for the volatility component
    pub normal_atr_bps: i64,
}

impl Default for DeepConfig {
    fn default() -> Self {
        Self {
            deep_max_spread_bps: 15,
            deep_min_imbalance_x10000: 3_000,
            deep_min_edge_bps: 5,
            weight_edge: 0.4,
            weight_regime: 0.3,
            weight_micro: 0.2,
            weight_volatility: 0.1,
            normal_atr_bps: 80,
        }
    }
}

/// Correlation-aware selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopKConfig {
    /// Selection size
    pub k: usize,
    /// Pairwise |corr| ceiling
    pub corr_max_x10000: i64,
    /// Returns used for correlation
    pub corr_window_points: usize,
    /// Returns carried by every snapshot
    pub window_points: usize,
    /// Previous selection stays preferred for this many cycles
    pub churn_guard_min_cycles: u64,
    /// Score band within which a previous member beats a newcomer
    pub churn_guard_min_score_delta_x10000: i64,
}

impl Default for TopKConfig {
    fn default() -> Self {
        Self {
            k: 5,
            corr_max_x10000: 8_500,
            corr_window_points: 36,
            window_points: 36,
            churn_guard_min_cycles: 3,
            churn_guard_min_score_delta_x10000: 500,
        }
    }
}

/// Entry proposer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Trend score a TREND regime needs
    pub trend_threshold_x10000: i64,
    /// Range score a RANGE regime needs
    pub range_threshold_x10000: i64,
    /// EMA period on 5m closes
    pub ema_period: usize,
    /// Pullback band lower edge
    pub pullback_min_bps: i64,
    /// Pullback band upper edge
    pub pullback_max_bps: i64,
    /// Spread ceiling at entry
    pub max_spread_entry_bps: i64,
    /// Spread widening ceiling over 10s
    pub max_delta_spread_bps_10s: i64,
    /// Bid-side imbalance floor for BUY
    pub min_imbalance_buy_x10000: i64,
    /// Current 5m volume over trailing mean
    pub min_volume_ratio: f64,
    /// Candles in the volume ratio window, current one included
    pub volume_lookback: usize,
    /// Stop multiple of ATR in TREND
    pub trend_sl_atr_mult: f64,
    /// Target multiple of ATR in TREND
    pub trend_tp_atr_mult: f64,
    /// Trailing multiple of ATR in TREND
    pub trend_trailing_atr_mult: f64,
    /// Stop multiple of ATR in RANGE
    pub range_sl_atr_mult: f64,
    /// Target multiple of ATR in RANGE
    pub range_tp_atr_mult: f64,
    /// Trailing multiple of ATR in RANGE
    pub range_trailing_atr_mult: f64,
    /// Minimum expected edge (1.5x in RANGE)
    pub min_edge_bps: i64,
    /// Quote risked per trade
    pub risk_per_trade_usdt: Decimal,
    /// Maker order time-to-live
    pub maker_ttl_ms: i64,
    /// Interval between maker reprices
    pub maker_reprice_ms: i64,
    /// Maker reprice budget
    pub max_reprices: i64,
    /// Spread ceiling for enabling fallback
    pub fallback_max_spread_bps: i64,
    /// Slippage ceiling for enabling fallback
    pub fallback_max_slippage_bps: i64,
    /// Edge floor for enabling fallback
    pub fallback_min_edge_bps: i64,
    /// Trend score needed to arm trailing
    pub trailing_min_trend_score_x10000: i64,
    /// Spread ceiling to arm trailing
    pub trailing_max_spread_bps: i64,
    /// Profit in bps at which trailing activates
    pub trailing_enable_profit_bps: i64,
    /// Use exchange-native trailing instead of virtual
    pub trailing_native: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trend_threshold_x10000: 7_000,
            range_threshold_x10000: 6_000,
            ema_period: 20,
            pullback_min_bps: 5,
            pullback_max_bps: 80,
            max_spread_entry_bps: 10,
            max_delta_spread_bps_10s: 5,
            min_imbalance_buy_x10000: 4_000,
            min_volume_ratio: 0.8,
            volume_lookback: 20,
            trend_sl_atr_mult: 1.0,
            trend_tp_atr_mult: 2.0,
            trend_trailing_atr_mult: 0.8,
            range_sl_atr_mult: 0.8,
            range_tp_atr_mult: 1.2,
            range_trailing_atr_mult: 0.5,
            min_edge_bps: 20,
            risk_per_trade_usdt: Decimal::new(10, 0),
            maker_ttl_ms: 15_000,
            maker_reprice_ms: 5_000,
            max_reprices: 2,
            fallback_max_spread_bps: 8,
            fallback_max_slippage_bps: 5,
            fallback_min_edge_bps: 40,
            trailing_min_trend_score_x10000: 7_500,
            trailing_max_spread_bps: 6,
            trailing_enable_profit_bps: 50,
            trailing_native: false,
        }
    }
}

/// Entry risk gate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Base minimum edge before adaptive scaling
    pub min_edge_bps: i64,
    /// Spread trigger as a multiple of p50 (x10000)
    pub adaptive_spread_factor_x10000: i64,
    /// Volatility trigger as a multiple of normal ATR (x10000)
    pub adaptive_vol_factor_x10000: i64,
    /// Reference ATR for the volatility trigger
    pub normal_atr_bps: i64,
    /// Imbalance below which liquidity is thin
    pub adaptive_liquidity_floor_x10000: i64,
    /// Multiplier ceiling
    pub adaptive_max_multiplier_x10000: i64,
    /// Rejects per hour that quarantine a symbol
    pub max_rejects_per_hour: u32,
    /// Trades allowed per rolling window
    pub max_trades_window: u32,
    /// Rolling window length
    pub trades_window_ms: i64,
    /// Trades allowed per UTC day
    pub max_trades_day: u32,
    /// Open orders allowed
    pub max_open_orders: u32,
    /// Consecutive losses that stop a symbol
    pub max_consecutive_losses: u32,
    /// WebSocket latency ceiling
    pub max_ws_latency_ms: i64,
    /// Entry churn per hour
    pub max_churn_per_hour: u32,
    /// Cancel-replaces per hour
    pub max_cancel_replace_per_hour: u32,
    /// Unfilled open entries allowed
    pub max_unfilled_orders: u32,
    /// Daily PnL floor (negative)
    pub daily_loss_limit_usdt: Decimal,
    /// Peak-to-equity drawdown ceiling
    pub max_drawdown_usdt: Decimal,
    /// Exposure cap per symbol
    pub max_symbol_exposure_usdt: Decimal,
    /// Exposure cap across symbols
    pub max_total_exposure_usdt: Decimal,
    /// Cooldown after a losing exit
    pub cooldown_ms_after_loss: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_edge_bps: 20,
            adaptive_spread_factor_x10000: 15_000,
            adaptive_vol_factor_x10000: 15_000,
            normal_atr_bps: 80,
            adaptive_liquidity_floor_x10000: 3_000,
            adaptive_max_multiplier_x10000: 20_000,
            max_rejects_per_hour: 5,
            max_trades_window: 4,
            trades_window_ms: 3_600_000,
            max_trades_day: 20,
            max_open_orders: 10,
            max_consecutive_losses: 3,
            max_ws_latency_ms: 2_000,
            max_churn_per_hour: 6,
            max_cancel_replace_per_hour: 20,
            max_unfilled_orders: 5,
            daily_loss_limit_usdt: Decimal::new(-50, 0),
            max_drawdown_usdt: Decimal::new(100, 0),
            max_symbol_exposure_usdt: Decimal::new(500, 0),
            max_total_exposure_usdt: Decimal::new(1_500, 0),
            cooldown_ms_after_loss: 900_000,
        }
    }
}

/// Advisory model gate
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiGateConfig {
    /// Consult the model at all
    pub enabled: bool,
    /// API base; `/chat/completions` is appended
    pub base_url: String,
    /// Model name sent in the request
    pub model: String,
    /// Bearer token, from the environment
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Hard deadline for one call
    pub aigate_timeout_ms: u64,
    /// Directory with `system.txt` and `schema.json`; built-ins when absent
    pub prompt_dir: Option<PathBuf>,
}

impl Default for AiGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            aigate_timeout_ms: 8_000,
            prompt_dir: None,
        }
    }
}

impl fmt::Debug for AiGateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiGateConfig")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redacted(&self.api_key))
            .field("aigate_timeout_ms", &self.aigate_timeout_ms)
            .field("prompt_dir", &self.prompt_dir)
            .finish()
    }
}

/// Order executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Lookups before a SENT_UNKNOWN intent may be declared NOT_FOUND
    pub intent_max_rest_queries: u32,
    /// Deadline of each lookup
    pub intent_rest_query_timeout_ms: u64,
    /// Deadline of a submit call
    pub submit_timeout_ms: u64,
    /// Concurrent SENT_UNKNOWN resolutions
    pub resolver_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            intent_max_rest_queries: 3,
            intent_rest_query_timeout_ms: 2_000,
            submit_timeout_ms: 5_000,
            resolver_concurrency: 4,
        }
    }
}

/// Health supervisor thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Evaluation period
    pub tick_interval_ms: u64,
    /// Cycle loop silence before DEGRADE
    pub loop_stuck_ms_degrade: i64,
    /// Cycle loop silence before PAUSE
    pub loop_stuck_ms_pause: i64,
    /// WebSocket silence before DEGRADE
    pub ws_stale_ms_degrade: i64,
    /// WebSocket silence before PAUSE
    pub ws_stale_ms_pause: i64,
    /// REST silence before DEGRADE
    pub rest_stale_ms_degrade: i64,
    /// REST silence before PAUSE; also the snapshot age budget
    pub rest_stale_ms_pause: i64,
    /// Free disk at or below which to DEGRADE
    pub disk_free_degrade_bytes: u64,
    /// Free disk at or below which to PAUSE
    pub disk_free_pause_bytes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            loop_stuck_ms_degrade: 180_000,
            loop_stuck_ms_pause: 600_000,
            ws_stale_ms_degrade: 10_000,
            ws_stale_ms_pause: 60_000,
            rest_stale_ms_degrade: 120_000,
            rest_stale_ms_pause: 300_000,
            disk_free_degrade_bytes: 2 * 1024 * 1024 * 1024,
            disk_free_pause_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Period between REST reconciliations
    pub reconcile_rest_interval_ms: u64,
    /// Drift score that degrades
    pub reconcile_drift_degrade_score_x10000: i64,
    /// Drift score that pauses
    pub reconcile_drift_pause_score_x10000: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reconcile_rest_interval_ms: 30_000,
            reconcile_drift_degrade_score_x10000: 40_000,
            reconcile_drift_pause_score_x10000: 120_000,
        }
    }
}

/// Audit writer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory of the daily files
    pub dir: PathBuf,
    /// Bounded queue size
    pub audit_writer_queue_capacity: usize,
    /// Occupancy at which health degrades
    pub audit_writer_queue_hi_watermark: usize,
    /// Writer lag at which health degrades; also the SQLite busy timeout
    pub audit_writer_max_lag_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/audit"),
            audit_writer_queue_capacity: 4_096,
            audit_writer_queue_hi_watermark: 3_072,
            audit_writer_max_lag_ms: 2_000,
        }
    }
}

/// What to strip from JSON bound for audit storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Keys dropped outright (lowercase exact match)
    pub remove_keys: Vec<String>,
    /// Substrings that abort redaction when found in a key or value
    pub reject_substrings: Vec<String>,
    /// Keys stripped before identity hashing
    pub volatile_keys: Vec<String>,
    /// Canonical size above which the payload is truncated
    pub max_bytes: usize,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            remove_keys: ["api_key", "apikey", "secret", "signature", "authorization", "x-mbx-apikey"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            reject_substrings: ["bearer ", "sk-proj-", "-----begin", "private_key"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            volatile_keys: ["ts_ms", "timestamp", "nonce", "created_at_ms", "latency_ms"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_bytes: 16 * 1024,
        }
    }
}

#[derive(Serialize)]
struct RankProjection<'a> {
    universe: &'a UniverseConfig,
    rank: &'a RankConfig,
    deep: &'a DeepConfig,
    topk: &'a TopKConfig,
}

#[derive(Serialize)]
struct ThresholdsProjection<'a> {
    strategy: &'a StrategyConfig,
    risk: &'a RiskConfig,
    health: &'a HealthConfig,
}

impl AgentConfig {
    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read, parse, overlay secrets from the process environment and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Overlay secrets from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_API_KEY) {
            self.exchange.api_key = v;
        }
        if let Some(v) = lookup(ENV_API_SECRET) {
            self.exchange.api_secret = v;
        }
        if let Some(v) = lookup(ENV_AIGATE_KEY) {
            self.aigate.api_key = v;
        }
    }

    /// Range and consistency checks
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.mode != crate::MODE_LIVE {
            return Err(invalid("runtime.mode", format!("must be LIVE, got {:?}", self.runtime.mode)));
        }
        if self.runtime.cycle_interval_ms == 0 {
            return Err(invalid("runtime.cycle_interval_ms", "must be positive"));
        }
        for symbol in &self.runtime.symbols {
            if symbol.is_empty() || !symbol.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
                return Err(invalid("runtime.symbols", format!("bad symbol {symbol:?}")));
            }
        }

        if self.exchange.time_sync_recv_window_ms <= 0 || self.exchange.time_sync_recv_window_ms > 60_000 {
            return Err(invalid("exchange.time_sync_recv_window_ms", "must be in 1..=60000"));
        }
        if self.exchange.request_timeout_ms == 0 {
            return Err(invalid("exchange.request_timeout_ms", "must be positive"));
        }
        if self.exchange.maker_fee_bps < 0 || self.exchange.taker_fee_bps < 0 {
            return Err(invalid("exchange.fees", "must be non-negative"));
        }

        check_weights(
            "rank.weights",
            &[self.rank.weight_liquidity, self.rank.weight_momentum, self.rank.weight_spread],
        )?;
        if self.rank.top_n == 0 {
            return Err(invalid("rank.top_n", "must be positive"));
        }
        check_weights(
            "deep.weights",
            &[
                self.deep.weight_edge,
                self.deep.weight_regime,
                self.deep.weight_micro,
                self.deep.weight_volatility,
            ],
        )?;
        if self.deep.normal_atr_bps <= 0 {
            return Err(invalid("deep.normal_atr_bps", "must be positive"));
        }

        if self.topk.k == 0 {
            return Err(invalid("topk.k", "must be positive"));
        }
        if !(1..=10_000).contains(&self.topk.corr_max_x10000) {
            return Err(invalid("topk.corr_max_x10000", "must be in 1..=10000"));
        }
        if self.topk.corr_window_points < 2 || self.topk.corr_window_points > self.topk.window_points {
            return Err(invalid("topk.corr_window_points", "must be in 2..=window_points"));
        }

        let s = &self.strategy;
        if s.pullback_min_bps > s.pullback_max_bps {
            return Err(invalid("strategy.pullback", "min must not exceed max"));
        }
        if s.ema_period < 2 || s.volume_lookback < 2 {
            return Err(invalid("strategy.ema_period", "periods must be at least 2"));
        }
        if s.trend_tp_atr_mult <= s.trend_sl_atr_mult || s.trend_sl_atr_mult <= 0.0 {
            return Err(invalid("strategy.trend_atr_mult", "require tp > sl > 0"));
        }
        if s.range_tp_atr_mult <= s.range_sl_atr_mult || s.range_sl_atr_mult <= 0.0 {
            return Err(invalid("strategy.range_atr_mult", "require tp > sl > 0"));
        }
        if s.risk_per_trade_usdt <= Decimal::ZERO {
            return Err(invalid("strategy.risk_per_trade_usdt", "must be positive"));
        }
        if s.maker_ttl_ms <= 0 || s.max_reprices < 1 || s.maker_reprice_ms <= 0 {
            return Err(invalid("strategy.maker", "ttl, reprice interval and max_reprices must be positive"));
        }

        let r = &self.risk;
        if r.adaptive_max_multiplier_x10000 < 10_000 {
            return Err(invalid("risk.adaptive_max_multiplier_x10000", "must be at least 10000"));
        }
        if r.daily_loss_limit_usdt >= Decimal::ZERO {
            return Err(invalid("risk.daily_loss_limit_usdt", "must be negative"));
        }
        if r.max_total_exposure_usdt < r.max_symbol_exposure_usdt {
            return Err(invalid("risk.max_total_exposure_usdt", "must cover the per-symbol cap"));
        }

        if self.aigate.enabled && self.aigate.aigate_timeout_ms == 0 {
            return Err(invalid("aigate.aigate_timeout_ms", "must be positive"));
        }

        let e = &self.executor;
        if e.intent_max_rest_queries == 0 || e.intent_rest_query_timeout_ms == 0 || e.submit_timeout_ms == 0 {
            return Err(invalid("executor", "lookup count and timeouts must be positive"));
        }
        if e.resolver_concurrency == 0 {
            return Err(invalid("executor.resolver_concurrency", "must be positive"));
        }

        let h = &self.health;
        if h.tick_interval_ms == 0 {
            return Err(invalid("health.tick_interval_ms", "must be positive"));
        }
        for (field, degrade, pause) in [
            ("health.loop_stuck_ms", h.loop_stuck_ms_degrade, h.loop_stuck_ms_pause),
            ("health.ws_stale_ms", h.ws_stale_ms_degrade, h.ws_stale_ms_pause),
            ("health.rest_stale_ms", h.rest_stale_ms_degrade, h.rest_stale_ms_pause),
        ] {
            if degrade <= 0 || degrade >= pause {
                return Err(invalid(field, "require 0 < degrade < pause"));
            }
        }
        if h.disk_free_degrade_bytes <= h.disk_free_pause_bytes {
            return Err(invalid("health.disk_free_bytes", "degrade floor must exceed pause floor"));
        }

        let rc = &self.reconcile;
        if rc.reconcile_rest_interval_ms == 0 {
            return Err(invalid("reconcile.reconcile_rest_interval_ms", "must be positive"));
        }
        if rc.reconcile_drift_degrade_score_x10000 <= 0
            || rc.reconcile_drift_degrade_score_x10000 >= rc.reconcile_drift_pause_score_x10000
        {
            return Err(invalid("reconcile.drift_scores", "require 0 < degrade < pause"));
        }

        let a = &self.audit;
        if a.audit_writer_queue_hi_watermark == 0
            || a.audit_writer_queue_capacity < a.audit_writer_queue_hi_watermark
        {
            return Err(invalid("audit.queue", "require capacity >= hi_watermark > 0"));
        }
        if a.audit_writer_max_lag_ms == 0 {
            return Err(invalid("audit.audit_writer_max_lag_ms", "must be positive"));
        }

        if self.redaction.max_bytes < 64 {
            return Err(invalid("redaction.max_bytes", "must be at least 64"));
        }
        Ok(())
    }

    /// Hash of the non-secret configuration
    pub fn config_hash(&self) -> CommonResult<String> {
        canonical_hash(self)
    }

    /// Hash of the selection parameters (universe, rank, deep, top-K)
    pub fn rank_hash(&self) -> CommonResult<String> {
        canonical_hash(&RankProjection {
            universe: &self.universe,
            rank: &self.rank,
            deep: &self.deep,
            topk: &self.topk,
        })
    }

    /// Hash of the decision thresholds (strategy, risk, health)
    pub fn thresholds_hash(&self) -> CommonResult<String> {
        canonical_hash(&ThresholdsProjection {
            strategy: &self.strategy,
            risk: &self.risk,
            health: &self.health,
        })
    }
}

fn check_weights(field: &'static str, weights: &[f64]) -> Result<(), ConfigError> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(invalid(field, "weights must be finite and non-negative"));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(invalid(field, format!("weights must sum to 1.0, got {sum}")));
    }
    Ok(())
}

impl From<ConfigError> for CommonError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
