// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine error type.

use thiserror::Error;

use weft_common::tasks::WorkflowKey;
use weft_persistence::StoreError;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the shard execution engine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The workflow run does not exist.
    #[error("workflow run {0} not found")]
    WorkflowNotFound(WorkflowKey),

    /// A workflow with the id is already started and running.
    #[error("workflow '{workflow_id}' already started with run {run_id}")]
    WorkflowAlreadyStarted {
        /// The workflow id.
        workflow_id: String,
        /// The current run.
        run_id: uuid::Uuid,
    },

    /// The shard lease was lost; the shard is unloading.
    #[error("shard {0} ownership lost")]
    ShardOwnershipLost(i32),

    /// The shard is closed (unloaded or shutting down).
    #[error("shard {0} is closed")]
    ShardClosed(i32),

    /// An optimistic check failed; the caller should reload and retry.
    #[error("workflow state conflict: {0}")]
    Conflict(String),

    /// The request contradicts the current workflow state.
    #[error("invalid workflow state: {0}")]
    InvalidState(String),

    /// A request field failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Per-namespace or per-run limit exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// The per-run lock could not be taken within the caller's budget.
    #[error("workflow lock acquisition timed out for {0}")]
    LockTimeout(WorkflowKey),

    /// The operation was cancelled (shard unload, shutdown).
    #[error("canceled")]
    Canceled,

    /// Retryable store failure; bounded retry upstream.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Unclassified failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether retrying the operation against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_) | EngineError::Unavailable(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => EngineError::Internal(format!("row missing: {message}")),
            StoreError::ShardOwnershipLost { shard_id, .. } => {
                EngineError::ShardOwnershipLost(shard_id)
            }
            StoreError::Canceled => EngineError::Canceled,
            err if err.is_condition_failure() => EngineError::Conflict(err.to_string()),
            err if err.is_retryable() => EngineError::Unavailable(err.to_string()),
            err => EngineError::Internal(err.to_string()),
        }
    }
}
