// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication error type.

use thiserror::Error;

use weft_persistence::StoreError;

/// Result type using ReplicationError.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised by the replication stream and appliers.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ReplicationError {
    /// The task references events not yet present locally.
    #[error("events ({event_id}, {version}) missing for apply")]
    MissingEvents {
        /// First missing event id.
        event_id: i64,
        /// Version of the missing events.
        version: i64,
    },

    /// The peer link is down.
    #[error("stream disconnected: {0}")]
    StreamClosed(String),

    /// Applying a task failed terminally.
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// Retryable store or transport failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled by shutdown.
    #[error("canceled")]
    Canceled,

    /// Unclassified failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Whether a retry of the same task may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::MissingEvents { .. }
                | ReplicationError::Unavailable(_)
                | ReplicationError::StreamClosed(_)
        )
    }
}

impl From<StoreError> for ReplicationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Canceled => ReplicationError::Canceled,
            err if err.is_retryable() => ReplicationError::Unavailable(err.to_string()),
            err => ReplicationError::Internal(err.to_string()),
        }
    }
}
