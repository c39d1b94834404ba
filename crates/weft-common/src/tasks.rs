// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The internal task model.
//!
//! Every mutation of a workflow may enqueue tasks into per-shard,
//! per-category queues. A task is addressed by its [`TaskKey`]: immediate
//! categories order by task id alone, the timer category orders by
//! `(fire_time, task_id)`. Task ids are allocated monotonically within a
//! shard lease, so within one shard and category keys are strictly
//! increasing.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    /// Owning namespace id.
    pub namespace_id: Uuid,
    /// User-chosen workflow id.
    pub workflow_id: String,
    /// Run id, unique per attempt chain.
    pub run_id: Uuid,
}

impl WorkflowKey {
    /// Build a key.
    pub fn new(namespace_id: Uuid, workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl std::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

/// Task category. One ordered queue exists per shard and category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum TaskCategory {
    /// Dispatch activities, child workflows, cancels; push to matching.
    Transfer,
    /// Fire timers and timeouts; retention cleanup.
    Timer,
    /// Update the visibility store.
    Visibility,
    /// Side-effect calls to external destinations.
    Outbound,
    /// Ship closed workflows to archival.
    Archival,
    /// Emit to the cross-cluster replication stream.
    Replication,
}

/// How a category orders and schedules its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryKind {
    /// Ordered and processed by task id as soon as loaded.
    Immediate,
    /// Ordered by `(fire_time, task_id)` and held until the fire time.
    Scheduled,
}

impl TaskCategory {
    /// The scheduling kind of this category.
    pub fn kind(&self) -> CategoryKind {
        match self {
            TaskCategory::Timer => CategoryKind::Scheduled,
            _ => CategoryKind::Immediate,
        }
    }
}

/// Ordering key of a task within its category queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    /// Fire time; the Unix epoch for immediate categories.
    pub fire_time: DateTime<Utc>,
    /// Shard-monotonic task id.
    pub task_id: i64,
}

impl TaskKey {
    /// Key for an immediate task.
    pub fn immediate(task_id: i64) -> Self {
        Self {
            fire_time: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            task_id,
        }
    }

    /// Key for a scheduled task.
    pub fn scheduled(fire_time: DateTime<Utc>, task_id: i64) -> Self {
        Self { fire_time, task_id }
    }

    /// Smallest possible key.
    pub fn minimum() -> Self {
        Self {
            fire_time: DateTime::<Utc>::MIN_UTC,
            task_id: 0,
        }
    }

    /// Largest possible key.
    pub fn maximum() -> Self {
        Self {
            fire_time: DateTime::<Utc>::MAX_UTC,
            task_id: i64::MAX,
        }
    }

    /// The immediately following key.
    pub fn next(&self) -> Self {
        Self {
            fire_time: self.fire_time,
            task_id: self.task_id.saturating_add(1),
        }
    }
}

/// Category-specific payload of an internal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskAttributes {
    /// Push an activity task to matching.
    DispatchActivity {
        /// Target task queue.
        task_queue: String,
        /// Scheduled event id of the activity.
        scheduled_event_id: i64,
    },
    /// Push a workflow task to matching.
    DispatchWorkflowTask {
        /// Target task queue.
        task_queue: String,
        /// Scheduled event id of the workflow task.
        scheduled_event_id: i64,
    },
    /// Start a child workflow.
    StartChildWorkflow {
        /// Child namespace id.
        target_namespace_id: Uuid,
        /// Child workflow id.
        target_workflow_id: String,
        /// Initiating event id.
        initiated_event_id: i64,
    },
    /// Request cancellation of an external workflow.
    CancelExternalWorkflow {
        /// Target namespace id.
        target_namespace_id: Uuid,
        /// Target workflow id.
        target_workflow_id: String,
        /// Initiating event id.
        initiated_event_id: i64,
    },
    /// A user timer fired.
    UserTimer {
        /// Started event id of the timer.
        started_event_id: i64,
    },
    /// Workflow run / execution timeout.
    WorkflowTimeout,
    /// Activity schedule-to-start / start-to-close / heartbeat timeout.
    ActivityTimeout {
        /// Scheduled event id of the activity.
        scheduled_event_id: i64,
        /// Attempt the timeout was armed for.
        attempt: i32,
    },
    /// Retry backoff elapsed; reschedule the activity.
    ActivityRetryTimer {
        /// Scheduled event id of the activity.
        scheduled_event_id: i64,
        /// Attempt to schedule next.
        attempt: i32,
    },
    /// Retention elapsed; delete the closed run.
    DeleteHistory,
    /// Upsert the run into the visibility store.
    UpsertVisibility,
    /// Close the run in the visibility store.
    CloseVisibility,
    /// Invoke an external destination (callback, service call).
    OutboundInvocation {
        /// Opaque request blob, content type alongside.
        request: Vec<u8>,
        /// MIME-ish content type of `request`.
        content_type: String,
    },
    /// Send the closed run to the archival backend.
    ArchiveHistory,
    /// Replicate recent history to peer clusters.
    SyncWorkflowState {
        /// First event id of the replicated batch.
        first_event_id: i64,
        /// One past the last event id of the replicated batch.
        next_event_id: i64,
        /// Failover version of the batch.
        version: i64,
    },
    /// Replicate activity heartbeat/completion state.
    SyncActivityState {
        /// Scheduled event id of the activity.
        scheduled_event_id: i64,
        /// Failover version observed at emission.
        version: i64,
    },
}

impl TaskAttributes {
    /// The category a payload belongs to.
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskAttributes::DispatchActivity { .. }
            | TaskAttributes::DispatchWorkflowTask { .. }
            | TaskAttributes::StartChildWorkflow { .. }
            | TaskAttributes::CancelExternalWorkflow { .. } => TaskCategory::Transfer,
            TaskAttributes::UserTimer { .. }
            | TaskAttributes::WorkflowTimeout
            | TaskAttributes::ActivityTimeout { .. }
            | TaskAttributes::ActivityRetryTimer { .. }
            | TaskAttributes::DeleteHistory => TaskCategory::Timer,
            TaskAttributes::UpsertVisibility | TaskAttributes::CloseVisibility => {
                TaskCategory::Visibility
            }
            TaskAttributes::OutboundInvocation { .. } => TaskCategory::Outbound,
            TaskAttributes::ArchiveHistory => TaskCategory::Archival,
            TaskAttributes::SyncWorkflowState { .. } | TaskAttributes::SyncActivityState { .. } => {
                TaskCategory::Replication
            }
        }
    }
}

/// An internal task as stored in and read from a shard queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Owning shard.
    pub shard_id: i32,
    /// Ordering key.
    pub key: TaskKey,
    /// Workflow run the task belongs to.
    pub workflow_key: WorkflowKey,
    /// Namespace failover version at emission, used by standby validation.
    pub version: i64,
    /// Destination for outbound tasks; empty otherwise.
    pub destination: Option<String>,
    /// Category payload.
    pub attributes: TaskAttributes,
}

impl Task {
    /// The task's category, derived from its payload.
    pub fn category(&self) -> TaskCategory {
        self.attributes.category()
    }
}
