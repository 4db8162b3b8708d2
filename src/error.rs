//! # Error taxonomy for the platform core.
//!
//! This module defines the domain-level [`Error`] enum shared by the record
//! store, the publishers, the gateway service, and the agent runtime.
//!
//! The enum provides:
//! - `as_label()` a short stable snake_case label for logs/metrics.
//! - `status()` the mapping onto the external status surface; the transport
//!   layer translates these one-to-one into its own status codes.
//! - `is_retryable()` whether the caller may retry the operation as-is.
//!
//! Broker-level failures live in [`crate::broker::BrokerError`] and convert
//! into this enum at the repository boundary.

use thiserror::Error;

/// External status surface the transport layer maps onto.
///
/// Kept transport-agnostic: a gRPC front-end maps these to its status codes,
/// an HTTP front-end to response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    ResourceExhausted,
    Unavailable,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

/// # Errors produced by the platform core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: bad resource name, bad page token, bad parameters.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The referenced record does not exist.
    #[error("task {name:?} not found")]
    NotFound { name: String },

    /// Create-if-absent hit an existing key.
    #[error("task {name:?} already exists")]
    AlreadyExists { name: String },

    /// Compare-and-swap lost: the record moved under the caller.
    #[error("revision conflict on {name:?}")]
    Conflict { name: String },

    /// The record is in a state the operation does not recognize.
    #[error("invalid task state")]
    InvalidState,

    /// The record already reached a terminal state.
    #[error("task already completed")]
    AlreadyCompleted,

    /// Cancel lost its CAS race; the record changed while canceling.
    #[error("cannot cancel task in current state")]
    CannotCancel,

    /// Transition requires the `pending` state.
    #[error("task is not in pending state")]
    NotPending,

    /// Transition requires the `processing` state.
    #[error("task is not in processing state")]
    NotProcessing,

    /// A terminal result is already recorded.
    #[error("task result already set")]
    ResultAlreadySet,

    /// The result value violates the result invariant (empty payload, wrong variant).
    #[error("invalid task result: {reason}")]
    InvalidResult { reason: String },

    /// The result discriminator is not one of the known variants.
    #[error("unknown result type: {kind:?}")]
    UnknownResultType { kind: String },

    /// The instance pool is at its configured cap.
    #[error("max instances reached: {max}")]
    CapacityExceeded { max: usize },

    /// Transient broker failure; safe to retry.
    #[error("broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    /// The governing context was canceled.
    #[error("context canceled")]
    Canceled,

    /// The operation ran past its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Anything else.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidArgument { .. } => "invalid_argument",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Conflict { .. } => "conflict",
            Error::InvalidState => "invalid_state",
            Error::AlreadyCompleted => "already_completed",
            Error::CannotCancel => "cannot_cancel",
            Error::NotPending => "not_pending",
            Error::NotProcessing => "not_processing",
            Error::ResultAlreadySet => "result_already_set",
            Error::InvalidResult { .. } => "invalid_result",
            Error::UnknownResultType { .. } => "unknown_result_type",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::BrokerUnavailable { .. } => "broker_unavailable",
            Error::Canceled => "canceled",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Internal { .. } => "internal",
        }
    }

    /// Maps the error kind onto the external status surface.
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidArgument { .. } => Status::InvalidArgument,
            Error::NotFound { .. } => Status::NotFound,
            Error::AlreadyExists { .. } => Status::AlreadyExists,
            Error::Conflict { .. } => Status::Aborted,
            Error::InvalidState
            | Error::AlreadyCompleted
            | Error::CannotCancel
            | Error::NotPending
            | Error::NotProcessing
            | Error::ResultAlreadySet
            | Error::InvalidResult { .. }
            | Error::UnknownResultType { .. } => Status::FailedPrecondition,
            Error::CapacityExceeded { .. } => Status::ResourceExhausted,
            Error::BrokerUnavailable { .. } => Status::Unavailable,
            Error::Canceled => Status::Cancelled,
            Error::DeadlineExceeded => Status::DeadlineExceeded,
            Error::Internal { .. } => Status::Internal,
        }
    }

    /// Indicates whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BrokerUnavailable { .. } | Error::CapacityExceeded { .. }
        )
    }

    /// Shorthand for an [`Error::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`Error::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::invalid_argument("x").status(),
            Status::InvalidArgument
        );
        assert_eq!(Error::AlreadyCompleted.status(), Status::FailedPrecondition);
        assert_eq!(
            Error::CapacityExceeded { max: 1 }.status(),
            Status::ResourceExhausted
        );
        assert_eq!(
            Error::Conflict {
                name: "tasks/x".into()
            }
            .status(),
            Status::Aborted
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(Error::BrokerUnavailable { reason: "x".into() }.is_retryable());
        assert!(Error::CapacityExceeded { max: 2 }.is_retryable());
        assert!(!Error::NotPending.is_retryable());
        assert!(!Error::Canceled.is_retryable());
    }
}
