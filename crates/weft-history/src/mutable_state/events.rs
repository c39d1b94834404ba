// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History events.
//!
//! Events are the durable record of everything that happened to a run. The
//! engine treats attributes as structured but opaque data; only ids, types
//! and versions drive engine logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Event types the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum EventType {
    /// Run started.
    WorkflowExecutionStarted,
    /// Run completed successfully.
    WorkflowExecutionCompleted,
    /// Run failed.
    WorkflowExecutionFailed,
    /// Run canceled.
    WorkflowExecutionCanceled,
    /// Run terminated by operator.
    WorkflowExecutionTerminated,
    /// Run timed out.
    WorkflowExecutionTimedOut,
    /// Run continued as a new run.
    WorkflowExecutionContinuedAsNew,
    /// Signal delivered.
    WorkflowExecutionSignaled,
    /// Cancel requested.
    WorkflowExecutionCancelRequested,
    /// Update accepted by the worker.
    WorkflowExecutionUpdateAccepted,
    /// Update completed.
    WorkflowExecutionUpdateCompleted,
    /// Workflow task scheduled.
    WorkflowTaskScheduled,
    /// Workflow task picked up by a worker.
    WorkflowTaskStarted,
    /// Workflow task completed; commands follow.
    WorkflowTaskCompleted,
    /// Workflow task failed.
    WorkflowTaskFailed,
    /// Workflow task timed out.
    WorkflowTaskTimedOut,
    /// Activity scheduled.
    ActivityTaskScheduled,
    /// Activity picked up by a worker.
    ActivityTaskStarted,
    /// Activity completed.
    ActivityTaskCompleted,
    /// Activity failed.
    ActivityTaskFailed,
    /// Activity canceled.
    ActivityTaskCanceled,
    /// Activity timed out.
    ActivityTaskTimedOut,
    /// User timer started.
    TimerStarted,
    /// User timer fired.
    TimerFired,
    /// User timer canceled.
    TimerCanceled,
    /// Child workflow initiated.
    StartChildWorkflowExecutionInitiated,
    /// Child workflow started.
    ChildWorkflowExecutionStarted,
    /// Child workflow closed.
    ChildWorkflowExecutionCompleted,
    /// External cancel initiated.
    RequestCancelExternalWorkflowExecutionInitiated,
    /// External signal initiated.
    SignalExternalWorkflowExecutionInitiated,
}

/// One history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Event id, dense and increasing within a branch.
    pub event_id: i64,
    /// Event type.
    pub event_type: EventType,
    /// Namespace failover version at write time.
    pub version: i64,
    /// When the event was generated.
    pub event_time: DateTime<Utc>,
    /// Type-specific attributes.
    pub attributes: serde_json::Value,
}

impl HistoryEvent {
    /// Estimated encoded size in bytes, used for buffer accounting.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(256)
    }
}
