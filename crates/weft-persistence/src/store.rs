// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The store traits.
//!
//! One trait per row family. A driver implements all of them on one struct;
//! [`Store`] is the convenience supertrait the assembly code passes around.
//!
//! Writes that belong to a shard carry the caller's `range_id`; a driver must
//! reject the write with [`StoreError::ShardOwnershipLost`] when the stored
//! lease no longer matches.

use async_trait::async_trait;
use uuid::Uuid;

use weft_common::tasks::{Task, TaskCategory, TaskKey, WorkflowKey};

use crate::error::Result;
use crate::types::*;

/// Namespace metadata operations.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read the global metadata notification version.
    async fn get_metadata(&self) -> Result<MetadataInfo>;

    /// Page through namespace records.
    async fn list_namespaces(&self, request: ListNamespacesRequest)
        -> Result<ListNamespacesResponse>;

    /// Read one namespace by name.
    async fn get_namespace_by_name(&self, name: &str) -> Result<NamespaceRecord>;

    /// Read one namespace by id.
    async fn get_namespace_by_id(&self, id: Uuid) -> Result<NamespaceRecord>;

    /// Create a namespace. Fails with `AlreadyExists` on a name or id clash.
    /// Bumps and stamps the metadata notification version.
    async fn create_namespace(&self, record: NamespaceRecord) -> Result<()>;

    /// Update a namespace. `expected_notification_version` is CASed against
    /// the stored row; on mismatch the update fails with `ConditionFailed`.
    async fn update_namespace(
        &self,
        record: NamespaceRecord,
        expected_notification_version: i64,
    ) -> Result<()>;

    /// Remove a namespace row entirely.
    async fn delete_namespace(&self, id: Uuid) -> Result<()>;
}

/// Shard row operations.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Read the shard row, creating a fresh one when absent.
    async fn get_or_create_shard(&self, shard_id: i32, owner: &str) -> Result<ShardInfo>;

    /// Write the shard row. `expected_range_id` is CASed against the stored
    /// lease; on mismatch the write fails with `ShardOwnershipLost`.
    async fn update_shard(&self, info: ShardInfo, expected_range_id: i64) -> Result<()>;

    /// Verify the caller still owns the shard at `range_id`.
    async fn assert_shard_ownership(&self, shard_id: i32, range_id: i64) -> Result<()>;
}

/// Workflow execution row operations.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create a run (and maybe take the current-run pointer) atomically with
    /// its first history batches and tasks.
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Apply a mutation (and maybe a successor snapshot) atomically with new
    /// history batches and tasks.
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Replace a run's blob set wholesale after reset/conflict resolution.
    async fn conflict_resolve_workflow_execution(
        &self,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Read a run's blob set.
    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
    ) -> Result<GetWorkflowExecutionResponse>;

    /// Overwrite a run's blob set without touching current-run state.
    /// Used by rebuild paths; CAS on the record version.
    async fn set_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
        snapshot: WorkflowSnapshot,
        expected_record_version: i64,
    ) -> Result<()>;

    /// Delete a run's blob set.
    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
    ) -> Result<()>;

    /// Delete the current-run pointer when it still names `run_id`.
    async fn delete_current_workflow_execution(
        &self,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<()>;

    /// Read the current-run pointer for a workflow id.
    async fn get_current_execution(
        &self,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<CurrentExecution>;

    /// Enumerate run keys on a shard (admin/scavenger surface).
    async fn list_concrete_executions(
        &self,
        shard_id: i32,
        page_size: usize,
        next_page_token: Option<Vec<u8>>,
    ) -> Result<(Vec<WorkflowKey>, Option<Vec<u8>>)>;
}

/// History event tree operations.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one serialized batch to a branch.
    async fn append_history_nodes(&self, write: HistoryNodeWrite) -> Result<()>;

    /// Read a branch in node order, following ancestry.
    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse>;

    /// Fork a new branch off `source` at `fork_node_id` (exclusive upper end
    /// of inherited nodes). Returns the new branch token.
    async fn fork_history_branch(&self, source: &[u8], fork_node_id: i64) -> Result<Vec<u8>>;

    /// Delete a branch and any nodes not shared with survivors.
    async fn delete_history_branch(&self, branch_token: &[u8]) -> Result<()>;

    /// Remove nodes past `(node_id, transaction_id)` left by aborted writes.
    async fn trim_history_branch(
        &self,
        branch_token: &[u8],
        node_id: i64,
        transaction_id: i64,
    ) -> Result<()>;
}

/// Internal (history) task queue operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Enqueue tasks onto their category queues. CAS on the shard lease.
    async fn add_history_tasks(&self, shard_id: i32, range_id: i64, tasks: Vec<Task>)
        -> Result<()>;

    /// Read a key range of one category queue.
    async fn get_history_tasks(
        &self,
        request: GetHistoryTasksRequest,
    ) -> Result<GetHistoryTasksResponse>;

    /// Delete one task.
    async fn complete_history_task(
        &self,
        shard_id: i32,
        category: TaskCategory,
        key: TaskKey,
    ) -> Result<()>;

    /// Delete every task with `min <= key < max`.
    async fn range_complete_history_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_min_key: TaskKey,
        exclusive_max_key: TaskKey,
    ) -> Result<()>;
}

/// Queue v2 (generic message log) operations.
#[async_trait]
pub trait QueueV2Store: Send + Sync {
    /// Create a queue; idempotent.
    async fn create_queue(&self, kind: QueueV2Kind, name: &str) -> Result<()>;

    /// Append a message; returns its id.
    async fn enqueue_message(&self, kind: QueueV2Kind, name: &str, payload: Blob) -> Result<i64>;

    /// Read messages with `id >= min_message_id` in id order.
    async fn read_messages(
        &self,
        kind: QueueV2Kind,
        name: &str,
        min_message_id: i64,
        page_size: usize,
    ) -> Result<ReadQueueMessagesResponse>;

    /// Delete every message with `id <= inclusive_max_message_id`.
    async fn range_delete_messages(
        &self,
        kind: QueueV2Kind,
        name: &str,
        inclusive_max_message_id: i64,
    ) -> Result<()>;

    /// List queue names of a kind.
    async fn list_queues(&self, kind: QueueV2Kind) -> Result<Vec<String>>;
}

/// Matching task queue operations.
#[async_trait]
pub trait MatchingTaskStore: Send + Sync {
    /// Take (or renew) the partition lease by bumping range_id by one.
    /// Returns the row after renewal.
    async fn lease_task_queue(&self, key: &TaskQueueKey, owner: &str) -> Result<TaskQueueInfo>;

    /// Write the partition row. CAS on `expected_range_id`; mismatch fails
    /// with `ConditionFailed`.
    async fn update_task_queue(&self, info: TaskQueueInfo, expected_range_id: i64) -> Result<()>;

    /// Spool a batch of tasks. CAS on the partition lease.
    async fn create_tasks(
        &self,
        key: &TaskQueueKey,
        range_id: i64,
        tasks: Vec<MatchingTask>,
    ) -> Result<()>;

    /// Read tasks with `min_task_id < id <= max_task_id` in id order.
    async fn get_tasks(
        &self,
        key: &TaskQueueKey,
        exclusive_min_task_id: i64,
        inclusive_max_task_id: i64,
        batch_size: usize,
    ) -> Result<Vec<MatchingTask>>;

    /// Delete every task with `id <= ack_level`.
    async fn complete_tasks_less_than(&self, key: &TaskQueueKey, ack_level: i64) -> Result<()>;

    /// Read the versioned user data of a family (partition 0 row).
    async fn get_task_queue_user_data(
        &self,
        namespace_id: Uuid,
        name: &str,
        task_type: TaskQueueType,
    ) -> Result<TaskQueueUserData>;

    /// Write user data. CAS on `expected_version`; mismatch fails with
    /// `ConditionFailed`.
    async fn update_task_queue_user_data(
        &self,
        namespace_id: Uuid,
        name: &str,
        task_type: TaskQueueType,
        data: TaskQueueUserData,
        expected_version: i64,
    ) -> Result<()>;
}

/// The full store surface.
pub trait Store:
    MetadataStore
    + ShardStore
    + ExecutionStore
    + HistoryStore
    + TaskStore
    + QueueV2Store
    + MatchingTaskStore
{
}

impl<T> Store for T where
    T: MetadataStore
        + ShardStore
        + ExecutionStore
        + HistoryStore
        + TaskStore
        + QueueV2Store
        + MatchingTaskStore
{
}
