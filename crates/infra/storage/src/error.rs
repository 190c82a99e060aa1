//! Storage error types

use common::{CommonError, ErrorKind};
use thiserror::Error;

/// Relational store failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite reported an error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration step failed
    #[error("Migration {version} failed: {detail}")]
    Migration {
        /// Migration version
        version: i64,
        /// What went wrong
        detail: String,
    },

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value failed model validation
    #[error(transparent)]
    Model(#[from] CommonError),

    /// Row content is not a valid registry value
    #[error("Invalid row in {table}: {detail}")]
    InvalidRow {
        /// Table
        table: &'static str,
        /// Offending content
        detail: String,
    },
}

impl StoreError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) | Self::Migration { .. } => ErrorKind::Durability,
            Self::Serialization(_) | Self::Model(_) | Self::InvalidRow { .. } => ErrorKind::SchemaInvalid,
        }
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Redaction refused the input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedactionError {
    /// A key looks like it carries a secret
    #[error("Key {key:?} contains forbidden substring {needle:?}")]
    ForbiddenKey {
        /// Offending key
        key: String,
        /// Matched substring
        needle: String,
    },

    /// A value looks like a secret
    #[error("Value under {key:?} contains forbidden substring {needle:?}")]
    ForbiddenValue {
        /// Key holding the value
        key: String,
        /// Matched substring
        needle: String,
    },

    /// Canonicalization of the redacted value failed
    #[error("Cannot canonicalize redacted value: {0}")]
    Canonical(String),
}

/// Audit writer failures
#[derive(Error, Debug)]
pub enum AuditError {
    /// Bounded queue saturated; the producer is not blocked
    #[error("Audit queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity
        capacity: usize,
    },

    /// Writer has shut down
    #[error("Audit writer closed")]
    WriterClosed,

    /// Payload key collides with an envelope field
    #[error("Payload key {0:?} is reserved for the envelope")]
    ReservedKey(String),

    /// Envelope failed validation
    #[error("Invalid audit envelope: {0}")]
    InvalidEnvelope(#[from] CommonError),

    /// Relational insert failed; nothing was written to the day file
    #[error("Audit insert failed: {0}")]
    Store(#[from] StoreError),

    /// Day-file append failed after a successful insert
    #[error("Audit file write failed: {0}")]
    FileWrite(#[from] std::io::Error),
}

impl AuditError {
    /// Taxonomy bucket
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ReservedKey(_) | Self::InvalidEnvelope(_) => ErrorKind::SchemaInvalid,
            Self::QueueFull { .. } | Self::WriterClosed | Self::Store(_) | Self::FileWrite(_) => {
                ErrorKind::Durability
            }
        }
    }
}
