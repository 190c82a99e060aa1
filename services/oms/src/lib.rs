//! Order Management System (OMS)
//!
//! Exactly-once order execution for the spot agent. A remote mutation is
//! always ledgered as an order intent before it is sent, and its exchange
//! client id is derived from the intent id, so a retry can never produce a
//! second order.
//!
//! Features:
//! - Filter quantization of prices and quantities ([`quantize`])
//! - Content-addressed entry, cancel, cancel-replace and OCO intents ([`order`])
//! - Ledger-first state changes with an audit record each ([`persistence`])
//! - Submit, resolve-by-lookup and protection install ([`executor`])
//! - Reprice, cancel and protect working entries ([`lifecycle`])
//! - Startup recovery over a bounded resolver pool ([`recovery`])

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod order;
pub mod persistence;
pub mod quantize;
pub mod recovery;

pub use error::{OmsError, OmsResult};
pub use executor::{Execution, Executor, PROTECTION_INSTALL_FAILED};
pub use lifecycle::{EntryAction, EntryManager, ManagedEntry};
pub use order::{EntryTiming, IntentPayload, IntentScope, entry_intent, entry_request, oco_intent, oco_request};
pub use persistence::{IntentJournal, stage_for};
pub use quantize::{QuantizeRequest, Quantized, quantize_order};
pub use recovery::{RecoveryStats, ResolverPool, StartupRecovery};
