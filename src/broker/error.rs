//! Errors surfaced by broker and key-value implementations.

use thiserror::Error;

use crate::error::Error;

/// # Errors produced by the broker layer.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// A fetch deadline elapsed without a delivery. Not a failure; the
    /// consumer loop treats it as an empty poll.
    #[error("no messages")]
    NoMessages,

    /// No stream's subject filter covers the published subject.
    #[error("no stream bound to subject {subject:?}")]
    StreamNotFound { subject: String },

    /// Create-if-absent hit an existing key.
    #[error("key {key:?} already exists")]
    KeyExists { key: String },

    /// The key does not exist (or was tombstoned).
    #[error("key {key:?} not found")]
    KeyNotFound { key: String },

    /// Compare-and-swap failed: the key moved past the expected revision.
    #[error("wrong revision for {key:?}: expected {expected}, current {current}")]
    WrongRevision {
        key: String,
        expected: u64,
        current: u64,
    },

    /// The broker rejected or could not complete the operation.
    #[error("broker unavailable: {reason}")]
    Unavailable { reason: String },
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::NoMessages => "no_messages",
            BrokerError::StreamNotFound { .. } => "stream_not_found",
            BrokerError::KeyExists { .. } => "key_exists",
            BrokerError::KeyNotFound { .. } => "key_not_found",
            BrokerError::WrongRevision { .. } => "wrong_revision",
            BrokerError::Unavailable { .. } => "unavailable",
        }
    }

    /// Returns `true` when the condition is an empty poll rather than a fault.
    pub fn is_no_messages(&self) -> bool {
        matches!(self, BrokerError::NoMessages)
    }
}

impl From<BrokerError> for Error {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::KeyExists { key } => Error::AlreadyExists { name: key },
            BrokerError::KeyNotFound { key } => Error::NotFound { name: key },
            BrokerError::WrongRevision { key, .. } => Error::Conflict { name: key },
            BrokerError::NoMessages => Error::DeadlineExceeded,
            other => Error::BrokerUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
