//! Engine errors

use common::decimal::DecimalError;
use common::{CommonError, ErrorKind};
use thiserror::Error;

/// Failures while building a snapshot or a proposal
#[derive(Error, Debug)]
pub enum EngineError {
    /// Shared model error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Decimal discipline violation
    #[error(transparent)]
    Decimal(#[from] DecimalError),

    /// Not enough history to compute an indicator
    #[error("Insufficient {what}: need {need}, got {got}")]
    InsufficientData {
        /// Series
        what: &'static str,
        /// Required points
        need: usize,
        /// Available points
        got: usize,
    },

    /// No book sample inside the micro window
    #[error("No book samples for {symbol}")]
    NoBook {
        /// Symbol
        symbol: String,
    },
}

impl EngineError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Common(e) => e.kind(),
            Self::Decimal(_) | Self::InsufficientData { .. } | Self::NoBook { .. } => {
                ErrorKind::SchemaInvalid
            }
        }
    }
}

/// Engine result
pub type EngineResult<T> = Result<T, EngineError>;
