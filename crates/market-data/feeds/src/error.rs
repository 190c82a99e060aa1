//! Exchange error types

use common::ErrorKind;
use thiserror::Error;

/// Binance: timestamp outside `recvWindow`
pub const CODE_TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;
/// Binance: too many requests
pub const CODE_TOO_MANY_REQUESTS: i64 = -1003;
/// Binance: too many new orders
pub const CODE_TOO_MANY_ORDERS: i64 = -1015;
/// Binance: order does not exist
pub const CODE_NO_SUCH_ORDER: i64 = -2013;
/// Binance: unknown order on cancel
pub const CODE_CANCEL_UNKNOWN_ORDER: i64 = -2011;

/// Exchange call failures
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The call did not complete within its deadline
    #[error("Exchange call timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// Connection or transport failure before a response arrived
    #[error("Exchange transport error: {0}")]
    Transport(String),

    /// The exchange answered with an error body
    #[error("Exchange error {code} (HTTP {status}): {msg}")]
    Api {
        /// HTTP status
        status: u16,
        /// Exchange error code
        code: i64,
        /// Exchange message
        msg: String,
    },

    /// Response body did not match the expected shape
    #[error("Cannot decode exchange response: {0}")]
    Decode(String),

    /// Request could not be built
    #[error("Invalid exchange request: {0}")]
    InvalidRequest(String),

    /// WebSocket failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl ExchangeError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::WebSocket(_) => ErrorKind::TransientIo,
            Self::Api { status, code, .. } => {
                if *status == 429 || *status == 418 || *code == CODE_TOO_MANY_REQUESTS || *code == CODE_TOO_MANY_ORDERS {
                    ErrorKind::RateLimited
                } else if *status >= 500 {
                    ErrorKind::TransientIo
                } else {
                    ErrorKind::ExchangeReject
                }
            }
            Self::Decode(_) | Self::InvalidRequest(_) => ErrorKind::SchemaInvalid,
        }
    }

    /// Outcome of the call on the exchange is unknown
    ///
    /// A mutation failing this way may or may not have reached the matching
    /// engine, so its intent must be queried rather than marked failed.
    #[must_use]
    pub const fn is_outcome_unknown(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Api { status, code, .. } => *status >= 500 || *code == CODE_TIMESTAMP_OUTSIDE_WINDOW,
            _ => false,
        }
    }

    /// Timestamp rejected as outside `recvWindow`
    #[must_use]
    pub const fn is_timestamp_outside_window(&self) -> bool {
        matches!(self, Self::Api { code: CODE_TIMESTAMP_OUTSIDE_WINDOW, .. })
    }

    /// Order is unknown to the exchange
    #[must_use]
    pub const fn is_unknown_order(&self) -> bool {
        matches!(
            self,
            Self::Api {
                code: CODE_NO_SUCH_ORDER | CODE_CANCEL_UNKNOWN_ORDER,
                ..
            }
        )
    }

    /// Exchange error code, if any
    #[must_use]
    pub const fn code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Short label stored as `last_error_code`
    #[must_use]
    pub fn error_code(&self) -> String {
        match self {
            Self::Api { code, .. } => code.to_string(),
            Self::Timeout { .. } => "TIMEOUT".to_string(),
            Self::Transport(_) => "TRANSPORT".to_string(),
            Self::Decode(_) => "DECODE".to_string(),
            Self::InvalidRequest(_) => "INVALID_REQUEST".to_string(),
            Self::WebSocket(_) => "WEBSOCKET".to_string(),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { timeout_ms: 0 }
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Result alias for exchange calls
pub type ExchangeResult<T> = Result<T, ExchangeError>;
