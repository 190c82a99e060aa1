//! Shared handles of one agent process

use common::{AgentConfig, Clock, SystemModeCell};
use feeds::{BookTickerStore, ExchangeRest};
use monitoring::{AgentMetrics, Heartbeats};
use std::sync::Arc;
use storage::{AuditWriter, Store};

/// Everything the stages share, cloned into each task that needs it
#[derive(Clone)]
pub struct AgentContext {
    /// Validated configuration
    pub cfg: Arc<AgentConfig>,
    /// SQLite store
    pub store: Store,
    /// Audit writer
    pub audit: Arc<AuditWriter>,
    /// Exchange REST client
    pub exchange: Arc<dyn ExchangeRest>,
    /// Book-ticker samples from the WebSocket
    pub books: Arc<BookTickerStore>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Liveness signals read by the health supervisor
    pub heartbeats: Arc<Heartbeats>,
    /// Mode published by the health supervisor
    pub mode: Arc<SystemModeCell>,
    /// Exported metrics, when enabled
    pub metrics: Option<AgentMetrics>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("db_path", &self.cfg.runtime.db_path)
            .field("mode", &self.mode.get())
            .finish_non_exhaustive()
    }
}
