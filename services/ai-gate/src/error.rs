//! Advisory gate errors

use common::{CommonError, ErrorKind, ReasonCode};
use thiserror::Error;

/// Failures of one advisory call; each maps to the reason on the synthesized ERROR verdict
#[derive(Error, Debug)]
pub enum AiGateError {
    /// No answer within `aigate_timeout_ms`
    #[error("Advisory call timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// Connection failure or non-success status
    #[error("Advisory HTTP error: {0}")]
    Http(String),

    /// Body or message content is not JSON of the expected envelope
    #[error("Cannot parse advisory response: {0}")]
    Parse(String),

    /// Content is JSON but violates the result schema
    #[error("Advisory response violates schema: {0}")]
    Schema(String),

    /// A reason outside the closed registry
    #[error("Advisory response carries unknown reason {0:?}")]
    UnknownReason(String),

    /// MODIFY breaks a monotone rule
    #[error("Advisory modification rejected: {0}")]
    ModifyInvalid(String),

    /// Prompt assets missing or malformed
    #[error("Prompt assets invalid: {0}")]
    Prompt(String),

    /// Shared model error
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl AiGateError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } | Self::Http(_) => ErrorKind::TransientIo,
            Self::Prompt(_) => ErrorKind::ConfigInvalid,
            Self::Common(e) => e.kind(),
            Self::Parse(_) | Self::Schema(_) | Self::UnknownReason(_) | Self::ModifyInvalid(_) => {
                ErrorKind::SchemaInvalid
            }
        }
    }

    /// Reason recorded on the ERROR verdict
    #[must_use]
    pub const fn reason(&self) -> ReasonCode {
        match self {
            Self::Timeout { .. } => ReasonCode::AigateTimeout,
            Self::Http(_) => ReasonCode::AigateHttpError,
            Self::Parse(_) => ReasonCode::AigateParseFail,
            Self::UnknownReason(_) => ReasonCode::AigateReasonUnknown,
            Self::ModifyInvalid(_) => ReasonCode::AigateModifyInvalid,
            Self::Schema(_) | Self::Prompt(_) | Self::Common(_) => ReasonCode::AigateSchemaInvalid,
        }
    }
}

impl From<reqwest::Error> for AiGateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Advisory gate result alias
pub type GateResult<T> = Result<T, AiGateError>;
