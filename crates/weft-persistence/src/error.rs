// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store failure taxonomy.
//!
//! Drivers translate their native errors into these kinds at the boundary;
//! nothing above this crate sees a driver error type.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by store operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic check on a non-workflow row failed.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// The current-run pointer moved under the caller.
    #[error("current workflow condition failed: {0}")]
    CurrentWorkflowConditionFailed(String),

    /// The workflow row's record version moved under the caller.
    #[error("workflow condition failed: {0}")]
    WorkflowConditionFailed(String),

    /// A unique key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The shard lease was taken by another owner.
    #[error("shard {shard_id} ownership lost, held range_id {range_id}")]
    ShardOwnershipLost {
        /// Affected shard.
        shard_id: i32,
        /// The range id the caller believed it held.
        range_id: i64,
    },

    /// The store throttled the request.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The store is temporarily unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The per-call deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A blob could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(String),

    /// The operation was cancelled by the caller.
    #[error("canceled")]
    Canceled,

    /// Unclassified driver failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether a bounded retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ResourceExhausted(_)
                | StoreError::Unavailable(_)
                | StoreError::Timeout(_)
                | StoreError::Internal(_)
        )
    }

    /// Whether the error is one of the optimistic-conflict kinds.
    pub fn is_condition_failure(&self) -> bool {
        matches!(
            self,
            StoreError::ConditionFailed(_)
                | StoreError::CurrentWorkflowConditionFailed(_)
                | StoreError::WorkflowConditionFailed(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut => StoreError::Timeout(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(StoreError::Unavailable("x".into()).is_retryable());
        assert!(StoreError::ResourceExhausted("x".into()).is_retryable());
        assert!(StoreError::Timeout("x".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(!StoreError::ShardOwnershipLost {
            shard_id: 1,
            range_id: 2
        }
        .is_retryable());
    }

    #[test]
    fn condition_failure_kinds() {
        assert!(StoreError::ConditionFailed("x".into()).is_condition_failure());
        assert!(StoreError::WorkflowConditionFailed("x".into()).is_condition_failure());
        assert!(StoreError::CurrentWorkflowConditionFailed("x".into()).is_condition_failure());
        assert!(!StoreError::AlreadyExists("x".into()).is_condition_failure());
    }
}
