//! Error types for order execution

use common::{CommonError, ErrorKind, ReasonCode};
use feeds::ExchangeError;
use storage::{AuditError, StoreError};
use thiserror::Error;

/// OMS-specific error types
#[derive(Error, Debug)]
pub enum OmsError {
    /// Order does not fit the exchange filters
    #[error("Order violates filters ({reason}): {detail}")]
    Quantize {
        /// `PROTECTION_INVALID_FILTER` or `PROTECTION_INVALID_MIN_NOTIONAL`
        reason: ReasonCode,
        /// Which bound failed
        detail: String,
    },

    /// The mutation may or may not have reached the exchange
    #[error("Outcome of intent {order_intent_id} is unknown")]
    SentUnknown {
        /// Intent left in SENT_UNKNOWN
        order_intent_id: String,
    },

    /// The exchange refused the mutation
    #[error("Intent {order_intent_id} rejected: {code} {detail}")]
    Rejected {
        /// Intent moved to FAILED_TERMINAL
        order_intent_id: String,
        /// Exchange error code or order status
        code: String,
        /// Exchange message
        detail: String,
    },

    /// Intent is in a state the operation cannot start from
    #[error("Intent {order_intent_id} cannot be {operation} in state {state}")]
    InvalidIntentState {
        /// Intent
        order_intent_id: String,
        /// Attempted operation
        operation: &'static str,
        /// Stored state
        state: String,
    },

    /// Decision or payload lacks what the operation needs
    #[error("Invalid order input: {0}")]
    InvalidInput(String),

    /// Exchange call failure outside a ledgered mutation
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Intent ledger failure
    #[error("Intent ledger error: {0}")]
    Store(#[from] StoreError),

    /// Audit trail failure
    #[error("Audit trail error: {0}")]
    Audit(#[from] AuditError),

    /// Shared model error
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl OmsError {
    /// Taxonomy bucket
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Quantize { .. } | Self::InvalidInput(_) | Self::InvalidIntentState { .. } => ErrorKind::SchemaInvalid,
            Self::SentUnknown { .. } => ErrorKind::TransientIo,
            Self::Rejected { .. } => ErrorKind::ExchangeReject,
            Self::Exchange(e) => e.kind(),
            Self::Store(_) | Self::Audit(_) => ErrorKind::Durability,
            Self::Common(e) => e.kind(),
        }
    }
}

/// Type alias for OMS results
pub type OmsResult<T> = Result<T, OmsError>;
