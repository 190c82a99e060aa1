//! Error types shared across the workspace

use crate::decimal::DecimalError;
use crate::registry::UnknownCode;
use thiserror::Error;

/// Error taxonomy every crate maps its failures onto.
///
/// The kind decides propagation: `SchemaInvalid` is never retried,
/// `TransientIo` is retried per policy, `Exit` is irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or out-of-range configuration
    ConfigInvalid,
    /// Canonical-JSON, registry or model validation failure
    SchemaInvalid,
    /// Network or timeout failure
    TransientIo,
    /// Exchange-reported saturation
    RateLimited,
    /// Exchange rejected a mutation
    ExchangeReject,
    /// Relational store or audit file write failure
    Durability,
    /// Local and remote state disagree beyond threshold
    Drift,
    /// Forced or cascading terminal state
    Exit,
}

impl ErrorKind {
    /// Upper-case label used in audit payloads
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::TransientIo => "TRANSIENT_IO",
            Self::RateLimited => "RATE_LIMITED",
            Self::ExchangeReject => "EXCHANGE_REJECT",
            Self::Durability => "DURABILITY",
            Self::Drift => "DRIFT",
            Self::Exit => "EXIT",
        }
    }
}

/// Errors raised by the common crate
#[derive(Error, Debug)]
pub enum CommonError {
    /// Value could not be turned into JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// NaN or infinity has no canonical JSON form
    #[error("Non-finite number cannot be canonicalized")]
    NonFiniteNumber,

    /// Closed-set value outside its registry
    #[error(transparent)]
    UnknownCode(#[from] UnknownCode),

    /// Decimal string discipline violated
    #[error(transparent)]
    Decimal(#[from] DecimalError),

    /// Model validation failed
    #[error("Schema invalid: {field}: {detail}")]
    Schema {
        /// Offending field path
        field: String,
        /// What was wrong with it
        detail: String,
    },

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timestamp outside the representable calendar
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

impl CommonError {
    /// Shorthand for a schema failure on `field`
    pub fn schema(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Schema {
            field: field.into(),
            detail: detail.into(),
        }
    }

    /// Taxonomy bucket for this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::ConfigInvalid,
            _ => ErrorKind::SchemaInvalid,
        }
    }
}

/// Result alias for the common crate
pub type CommonResult<T> = Result<T, CommonError>;
