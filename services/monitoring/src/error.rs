//! Monitoring errors

use common::ErrorKind;
use thiserror::Error;

/// Failures of metrics export and health sampling
#[derive(Error, Debug)]
pub enum MonitoringError {
    /// Metric registration or encoding
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Exposition was not UTF-8
    #[error("Metrics exposition is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Disk sampling or listener I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitoringError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Prometheus(_) | Self::Utf8(_) => ErrorKind::SchemaInvalid,
            Self::Io(_) => ErrorKind::TransientIo,
        }
    }
}

/// Type alias for monitoring results
pub type MonitoringResult<T> = Result<T, MonitoringError>;
