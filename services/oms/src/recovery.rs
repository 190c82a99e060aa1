//! Settling intents whose outcome is unknown
//!
//! Runs at startup (STARTUP_RECOVER) and after any cycle that left intents
//! SENT_UNKNOWN. Resolution only ever queries by client order id; nothing is
//! resent from here.

use crate::error::OmsResult;
use crate::executor::Executor;
use common::ReasonCode;
use common::model::{IntentState, OrderIntent};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use storage::TransitionUpdate;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Outcome counts of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Intents loaded in CREATED or SENT_UNKNOWN
    pub inspected: u32,
    /// CREATED intents moved to SENT_UNKNOWN before probing
    pub created_marked_unknown: u32,
    /// Settled as CONFIRMED
    pub confirmed: u32,
    /// Settled as NOT_FOUND
    pub not_found: u32,
    /// Left SENT_UNKNOWN for a later pass
    pub still_unknown: u32,
    /// Resolution failed on the ledger or audit trail
    pub errors: u32,
    /// Wall time of the pass
    pub elapsed_ms: u64,
}

impl RecoveryStats {
    fn count(&mut self, result: &OmsResult<OrderIntent>) {
        match result {
            Ok(intent) => match intent.state {
                IntentState::Confirmed => self.confirmed += 1,
                IntentState::NotFound => self.not_found += 1,
                _ => self.still_unknown += 1,
            },
            Err(_) => self.errors += 1,
        }
    }
}

/// Resolves SENT_UNKNOWN intents, at most `concurrency` at a time
#[derive(Debug, Clone)]
pub struct ResolverPool {
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
}

impl ResolverPool {
    /// Pool over `executor`, allowing `executor.config().resolver_concurrency` lookups in flight
    #[must_use]
    pub fn new(executor: Arc<Executor>) -> Self {
        let concurrency = executor.config().resolver_concurrency.max(1);
        Self {
            executor,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Executor the pool resolves through
    #[must_use]
    pub const fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Resolve each intent; results are in input order
    pub async fn resolve_many(&self, intents: &[OrderIntent]) -> Vec<OmsResult<OrderIntent>> {
        let tasks = intents.iter().map(|intent| async move {
            let Ok(_permit) = self.permits.acquire().await else {
                return Ok(intent.clone());
            };
            self.executor.resolve_sent_unknown(intent).await
        });
        join_all(tasks).await
    }

    /// Resolve every intent the ledger holds in SENT_UNKNOWN
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn resolve_pending(&self) -> OmsResult<RecoveryStats> {
        let started = Instant::now();
        let pending = self
            .executor
            .journal()
            .ledger()
            .list_by_states(&[IntentState::SentUnknown])
            .await?;
        let mut stats = RecoveryStats {
            inspected: u32::try_from(pending.len()).unwrap_or(u32::MAX),
            ..RecoveryStats::default()
        };
        for result in self.resolve_many(&pending).await {
            stats.count(&result);
        }
        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(stats)
    }
}

/// Startup pass over every intent a previous run left open
#[derive(Debug, Clone)]
pub struct StartupRecovery {
    pool: ResolverPool,
}

impl StartupRecovery {
    /// Recovery resolving through `pool`
    #[must_use]
    pub const fn new(pool: ResolverPool) -> Self {
        Self { pool }
    }

    /// Settle every CREATED and SENT_UNKNOWN intent
    ///
    /// A CREATED intent may have been sent just before the crash, so it is
    /// first marked SENT_UNKNOWN and then queried like any other.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn recover(&self) -> OmsResult<RecoveryStats> {
        let started = Instant::now();
        let journal = self.pool.executor().journal();
        let open = journal
            .ledger()
            .list_by_states(&[IntentState::Created, IntentState::SentUnknown])
            .await?;
        let mut stats = RecoveryStats {
            inspected: u32::try_from(open.len()).unwrap_or(u32::MAX),
            ..RecoveryStats::default()
        };
        info!(open = open.len(), "recovering open intents");

        let mut pending = Vec::with_capacity(open.len());
        for intent in open {
            if intent.state != IntentState::Created {
                pending.push(intent);
                continue;
            }
            let update = TransitionUpdate::error("RESTART", "intent found CREATED at startup");
            match journal
                .advance(&intent, IntentState::SentUnknown, &update, ReasonCode::RecoveryResolved)
                .await
            {
                Ok(Some(marked)) => {
                    stats.created_marked_unknown += 1;
                    pending.push(marked);
                }
                Ok(None) => pending.push(intent),
                Err(e) => {
                    warn!(order_intent_id = %intent.order_intent_id, error = %e, "could not mark created intent");
                    stats.errors += 1;
                }
            }
        }

        for result in self.pool.resolve_many(&pending).await {
            if let Err(e) = &result {
                warn!(error = %e, "intent resolution failed");
            }
            stats.count(&result);
        }
        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            confirmed = stats.confirmed,
            not_found = stats.not_found,
            still_unknown = stats.still_unknown,
            errors = stats.errors,
            elapsed_ms = stats.elapsed_ms,
            "startup recovery done"
        );
        Ok(stats)
    }
}
