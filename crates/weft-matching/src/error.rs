// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching error type.

use thiserror::Error;

use weft_persistence::StoreError;

/// Result type using MatchingError.
pub type Result<T> = std::result::Result<T, MatchingError>;

/// Errors raised by the matching subsystem.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum MatchingError {
    /// The partition lease moved to another owner; the partition unloads.
    #[error("partition ownership lost")]
    OwnershipLost,

    /// The partition has been unloaded.
    #[error("partition unloaded")]
    Unloaded,

    /// No poller showed up within the long-poll window.
    #[error("no task available before the poll deadline")]
    PollTimeout,

    /// A versioning rule change failed validation.
    #[error("invalid versioning rule: {0}")]
    InvalidRule(String),

    /// A user-data write lost its version CAS; re-read and retry.
    #[error("task queue user data version conflict: {0}")]
    UserDataConflict(String),

    /// A request field failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Retryable store failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Unclassified failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<StoreError> for MatchingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed(_) => MatchingError::OwnershipLost,
            err if err.is_retryable() => MatchingError::Unavailable(err.to_string()),
            err => MatchingError::Internal(err.to_string()),
        }
    }
}
