// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records, requests and responses exchanged with the store.
//!
//! Nested workflow structures are carried as discrete [`Blob`]s so a driver
//! can update them independently. The store never interprets blob contents;
//! encoding is recorded next to the bytes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_common::tasks::{Task, TaskCategory, TaskKey, WorkflowKey};

// ============================================================================
// Blobs
// ============================================================================

/// An opaque serialized value plus its encoding tag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blob {
    /// Encoded bytes.
    pub data: Vec<u8>,
    /// Encoding tag, e.g. `json/plain`.
    pub encoding: String,
}

impl Blob {
    /// Encode a serde value as a `json/plain` blob.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::to_vec(value)?,
            encoding: "json/plain".to_string(),
        })
    }

    /// Decode a `json/plain` blob.
    pub fn to_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Size of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// Namespace metadata
// ============================================================================

/// Namespace lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceState {
    /// Active and serving.
    Registered,
    /// No new workflows may start.
    Deprecated,
    /// Deleted; retained for replication convergence.
    Deleted,
    /// Mid active-cluster migration.
    Handover,
}

/// Archival toggle for history or visibility records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchivalState {
    /// Never configured.
    Disabled,
    /// Configured and on.
    Enabled,
    /// Configured but paused.
    Paused,
}

/// Replication state of a global namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// Normal operation.
    Normal,
    /// Active-cluster handover in progress; writes pause.
    Handover,
}

/// A poisoned worker binary marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadBinaryInfo {
    /// Operator-supplied reason.
    pub reason: String,
    /// Operator identity.
    pub operator: String,
    /// When the marker was created.
    pub create_time: DateTime<Utc>,
}

/// A namespace-scoped workflow rule with an expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRuleInfo {
    /// Rule identifier.
    pub rule_id: String,
    /// Opaque rule specification.
    pub spec: String,
    /// When the rule was created.
    pub create_time: DateTime<Utc>,
    /// When the rule lapses; `None` means no expiry.
    pub expiration_time: Option<DateTime<Utc>>,
}

/// One recorded failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverHistoryEntry {
    /// When the failover was written.
    pub failover_time: DateTime<Utc>,
    /// The failover version assigned.
    pub failover_version: i64,
}

/// Per-namespace operational configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Workflow retention after close.
    #[serde(with = "duration_secs")]
    pub retention: std::time::Duration,
    /// History archival toggle.
    pub history_archival_state: ArchivalState,
    /// History archival target.
    pub history_archival_uri: String,
    /// Visibility archival toggle.
    pub visibility_archival_state: ArchivalState,
    /// Visibility archival target.
    pub visibility_archival_uri: String,
    /// Poisoned binaries, bounded per namespace.
    pub bad_binaries: HashMap<String, BadBinaryInfo>,
    /// Workflow rules, bounded per namespace.
    pub workflow_rules: HashMap<String, WorkflowRuleInfo>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Replication configuration of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceReplicationConfig {
    /// The single active (writer) cluster.
    pub active_cluster: String,
    /// All clusters the namespace is present in; includes the active one.
    pub clusters: Vec<String>,
    /// Normal or handover.
    pub replication_state: ReplicationState,
    /// Bounded, ordered record of past failovers.
    pub failover_history: Vec<FailoverHistoryEntry>,
}

/// The persisted namespace row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Immutable id.
    pub id: Uuid,
    /// Unique name.
    pub name: String,
    /// Lifecycle state.
    pub state: NamespaceState,
    /// Operator description.
    pub description: String,
    /// Operator contact.
    pub owner_email: String,
    /// Free-form key/value data.
    pub data: HashMap<String, String>,
    /// Operational configuration.
    pub config: NamespaceConfig,
    /// Replication configuration.
    pub replication_config: NamespaceReplicationConfig,
    /// Whether the namespace is replicated across clusters.
    pub is_global: bool,
    /// Bumped on every config/data change.
    pub config_version: i64,
    /// Bumped on every failover; 0 for local namespaces.
    pub failover_version: i64,
    /// Metadata notification version at the last replicated write.
    pub failover_notification_version: i64,
    /// Optimistic-lock token for metadata writes.
    pub notification_version: i64,
}

/// Response of `get_metadata`.
#[derive(Debug, Clone, Copy)]
pub struct MetadataInfo {
    /// Monotone version bumped on every namespace write.
    pub notification_version: i64,
}

/// Request for `list_namespaces`.
#[derive(Debug, Clone, Default)]
pub struct ListNamespacesRequest {
    /// Maximum records per page.
    pub page_size: usize,
    /// Continuation token from the previous page.
    pub next_page_token: Option<Vec<u8>>,
    /// Include namespaces in the `Deleted` state.
    pub include_deleted: bool,
}

/// Response of `list_namespaces`.
#[derive(Debug, Clone, Default)]
pub struct ListNamespacesResponse {
    /// Records in this page.
    pub namespaces: Vec<NamespaceRecord>,
    /// Continuation token; `None` when exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

// ============================================================================
// Shard
// ============================================================================

/// The shard row: the ownership lease plus queue progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard id, `0..num_history_shards`.
    pub shard_id: i32,
    /// Current owner host identity, informational.
    pub owner: String,
    /// Lease token; every write CASes against it.
    pub range_id: i64,
    /// Exclusive ack level per task category.
    pub queue_ack_levels: HashMap<TaskCategory, TaskKey>,
    /// Serialized reader/cursor state per category.
    pub queue_states: HashMap<TaskCategory, serde_json::Value>,
    /// Last time the lease was renewed or stolen.
    pub updated_at: DateTime<Utc>,
}

impl ShardInfo {
    /// A fresh shard row with range 0 and empty progress.
    pub fn new(shard_id: i32, owner: impl Into<String>) -> Self {
        Self {
            shard_id,
            owner: owner.into(),
            range_id: 0,
            queue_ack_levels: HashMap::new(),
            queue_states: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Workflow execution
// ============================================================================

/// Workflow execution lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Created but first workflow task not yet scheduled.
    Created,
    /// Actively running.
    Running,
    /// Closed; terminal status is set.
    Completed,
    /// A zombie row not reachable through the current-run pointer.
    Zombie,
    /// Never meaningfully created (aborted create).
    Corrupted,
}

/// Terminal (or running) status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Still open.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Canceled.
    Canceled,
    /// Terminated by operator.
    Terminated,
    /// Continued as a new run.
    ContinuedAsNew,
    /// Timed out.
    TimedOut,
}

impl WorkflowStatus {
    /// Whether the status closes the execution.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

/// The full blob set of one workflow run, as written to the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Execution info blob (start time, timeouts, version histories, ...).
    pub execution_info: Blob,
    /// Execution state blob (state/status/create_request_id).
    pub execution_state: Blob,
    /// Denormalized state for current-run maintenance.
    pub state: WorkflowState,
    /// Denormalized status for current-run maintenance.
    pub status: WorkflowStatus,
    /// Id the next appended event will take.
    pub next_event_id: i64,
    /// Last write version of the run, for current-run CAS.
    pub last_write_version: i64,
    /// Activity infos keyed by scheduled event id.
    pub activity_infos: HashMap<i64, Blob>,
    /// Timer infos keyed by timer id.
    pub timer_infos: HashMap<String, Blob>,
    /// Child execution infos keyed by initiated event id.
    pub child_execution_infos: HashMap<i64, Blob>,
    /// Request-cancel infos keyed by initiated event id.
    pub request_cancel_infos: HashMap<i64, Blob>,
    /// Signal infos keyed by initiated event id.
    pub signal_infos: HashMap<i64, Blob>,
    /// Deduplication ids of received signals.
    pub signal_requested_ids: HashSet<String>,
    /// Events received while a workflow task was in flight.
    pub buffered_events: Vec<Blob>,
    /// Chasm node tree keyed by path.
    pub chasm_nodes: HashMap<String, Blob>,
    /// Checksum over the serialized mutable state.
    pub checksum: Blob,
}

/// A partial update of one workflow run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowMutation {
    /// Replacement execution info blob.
    pub execution_info: Blob,
    /// Replacement execution state blob.
    pub execution_state: Blob,
    /// Denormalized state.
    pub state: WorkflowState,
    /// Denormalized status.
    pub status: WorkflowStatus,
    /// Id the next appended event will take.
    pub next_event_id: i64,
    /// Last write version after this mutation.
    pub last_write_version: i64,
    /// Activity infos to upsert.
    pub upsert_activity_infos: HashMap<i64, Blob>,
    /// Activity infos to delete.
    pub delete_activity_infos: HashSet<i64>,
    /// Timer infos to upsert.
    pub upsert_timer_infos: HashMap<String, Blob>,
    /// Timer infos to delete.
    pub delete_timer_infos: HashSet<String>,
    /// Child infos to upsert.
    pub upsert_child_infos: HashMap<i64, Blob>,
    /// Child infos to delete.
    pub delete_child_infos: HashSet<i64>,
    /// Request-cancel infos to upsert.
    pub upsert_request_cancel_infos: HashMap<i64, Blob>,
    /// Request-cancel infos to delete.
    pub delete_request_cancel_infos: HashSet<i64>,
    /// Signal infos to upsert.
    pub upsert_signal_infos: HashMap<i64, Blob>,
    /// Signal infos to delete.
    pub delete_signal_infos: HashSet<i64>,
    /// Signal-requested ids to add.
    pub upsert_signal_requested_ids: HashSet<String>,
    /// Signal-requested ids to remove.
    pub delete_signal_requested_ids: HashSet<String>,
    /// Buffered events to append.
    pub new_buffered_events: Vec<Blob>,
    /// Drop all buffered events (flush happened).
    pub clear_buffered_events: bool,
    /// Chasm nodes to upsert.
    pub upsert_chasm_nodes: HashMap<String, Blob>,
    /// Chasm nodes to delete.
    pub delete_chasm_nodes: HashSet<String>,
    /// Replacement checksum.
    pub checksum: Blob,
}

impl WorkflowMutation {
    /// Apply this mutation to a stored snapshot. Drivers share this so the
    /// partial-update semantics cannot drift between them.
    pub fn apply_to(&self, snapshot: &mut WorkflowSnapshot) {
        snapshot.execution_info = self.execution_info.clone();
        snapshot.execution_state = self.execution_state.clone();
        snapshot.state = self.state;
        snapshot.status = self.status;
        snapshot.next_event_id = self.next_event_id;
        snapshot.last_write_version = self.last_write_version;
        snapshot.checksum = self.checksum.clone();

        for (k, v) in &self.upsert_activity_infos {
            snapshot.activity_infos.insert(*k, v.clone());
        }
        for k in &self.delete_activity_infos {
            snapshot.activity_infos.remove(k);
        }
        for (k, v) in &self.upsert_timer_infos {
            snapshot.timer_infos.insert(k.clone(), v.clone());
        }
        for k in &self.delete_timer_infos {
            snapshot.timer_infos.remove(k);
        }
        for (k, v) in &self.upsert_child_infos {
            snapshot.child_execution_infos.insert(*k, v.clone());
        }
        for k in &self.delete_child_infos {
            snapshot.child_execution_infos.remove(k);
        }
        for (k, v) in &self.upsert_request_cancel_infos {
            snapshot.request_cancel_infos.insert(*k, v.clone());
        }
        for k in &self.delete_request_cancel_infos {
            snapshot.request_cancel_infos.remove(k);
        }
        for (k, v) in &self.upsert_signal_infos {
            snapshot.signal_infos.insert(*k, v.clone());
        }
        for k in &self.delete_signal_infos {
            snapshot.signal_infos.remove(k);
        }
        for k in &self.upsert_signal_requested_ids {
            snapshot.signal_requested_ids.insert(k.clone());
        }
        for k in &self.delete_signal_requested_ids {
            snapshot.signal_requested_ids.remove(k);
        }
        if self.clear_buffered_events {
            snapshot.buffered_events.clear();
        }
        snapshot
            .buffered_events
            .extend(self.new_buffered_events.iter().cloned());
        for (k, v) in &self.upsert_chasm_nodes {
            snapshot.chasm_nodes.insert(k.clone(), v.clone());
        }
        for k in &self.delete_chasm_nodes {
            snapshot.chasm_nodes.remove(k);
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        WorkflowState::Created
    }
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        WorkflowStatus::Running
    }
}

/// Creation mode for `create_workflow_execution`.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateWorkflowMode {
    /// No current run may exist for the workflow id.
    BrandNew,
    /// Replace the closed current run identified by the pair.
    WorkflowIdReuse {
        /// The run id expected to be current.
        prev_run_id: Uuid,
        /// Its expected last write version.
        prev_last_write_version: i64,
    },
    /// Write the run without touching the current-run pointer.
    Zombie,
}

/// Update mode for `update_workflow_execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateWorkflowMode {
    /// The mutated run must be the current run.
    UpdateCurrent,
    /// Mutate without consulting the current-run pointer (standby/zombie).
    BypassCurrent,
}

/// Conflict-resolve mode for `conflict_resolve_workflow_execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolveMode {
    /// The reset run becomes (or stays) current.
    ResetCurrent,
    /// Leave the current-run pointer alone.
    BypassCurrent,
}

/// One serialized event batch destined for the history tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryNodeWrite {
    /// Target branch.
    pub branch_token: Vec<u8>,
    /// Event id of the first event in the batch.
    pub node_id: i64,
    /// Transaction id, monotone per branch; highest wins on re-read.
    pub transaction_id: i64,
    /// Transaction id of the previous write on the branch.
    pub prev_transaction_id: i64,
    /// The serialized events.
    pub events: Blob,
    /// Number of events inside `events`.
    pub event_count: i64,
    /// Whether this write creates the branch.
    pub is_new_branch: bool,
}

/// Request for `create_workflow_execution`.
#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    /// Owning shard.
    pub shard_id: i32,
    /// Caller's lease token.
    pub range_id: i64,
    /// Creation mode.
    pub mode: CreateWorkflowMode,
    /// Run identity.
    pub workflow_key: WorkflowKey,
    /// The full blob set.
    pub snapshot: WorkflowSnapshot,
    /// First-write record version for the new row.
    pub record_version: i64,
    /// Internal tasks to enqueue atomically.
    pub tasks: Vec<Task>,
    /// History batches to append atomically.
    pub new_events: Vec<HistoryNodeWrite>,
}

/// Request for `update_workflow_execution`.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    /// Owning shard.
    pub shard_id: i32,
    /// Caller's lease token.
    pub range_id: i64,
    /// Update mode.
    pub mode: UpdateWorkflowMode,
    /// Run identity.
    pub workflow_key: WorkflowKey,
    /// The mutation to apply.
    pub mutation: WorkflowMutation,
    /// Record version the caller read; CAS against it.
    pub expected_record_version: i64,
    /// Snapshot of a successor run (continue-as-new), written atomically.
    pub new_snapshot: Option<(WorkflowKey, WorkflowSnapshot)>,
    /// Internal tasks to enqueue atomically.
    pub tasks: Vec<Task>,
    /// History batches to append atomically.
    pub new_events: Vec<HistoryNodeWrite>,
}

/// Request for `conflict_resolve_workflow_execution`.
#[derive(Debug, Clone)]
pub struct ConflictResolveWorkflowExecutionRequest {
    /// Owning shard.
    pub shard_id: i32,
    /// Caller's lease token.
    pub range_id: i64,
    /// Mode.
    pub mode: ConflictResolveMode,
    /// Run being reset.
    pub workflow_key: WorkflowKey,
    /// Full replacement blob set of the reset run.
    pub reset_snapshot: WorkflowSnapshot,
    /// Record version the caller read for the reset run.
    pub expected_record_version: i64,
    /// Optional brand-new run written alongside.
    pub new_snapshot: Option<(WorkflowKey, WorkflowSnapshot)>,
    /// Optional mutation of the previously-current run.
    pub current_mutation: Option<(WorkflowKey, WorkflowMutation, i64)>,
    /// Internal tasks to enqueue atomically.
    pub tasks: Vec<Task>,
    /// History batches to append atomically.
    pub new_events: Vec<HistoryNodeWrite>,
}

/// Response of `get_workflow_execution`.
#[derive(Debug, Clone)]
pub struct GetWorkflowExecutionResponse {
    /// The stored blob set.
    pub snapshot: WorkflowSnapshot,
    /// Record version for subsequent CAS.
    pub record_version: i64,
}

/// The current-run pointer row.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentExecution {
    /// Current run id.
    pub run_id: Uuid,
    /// Denormalized state.
    pub state: WorkflowState,
    /// Denormalized status.
    pub status: WorkflowStatus,
    /// Last write version of the current run.
    pub last_write_version: i64,
}

// ============================================================================
// History tree
// ============================================================================

/// A branch identity plus its ancestry, serialized into branch tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Tree id; one tree per workflow run chain.
    pub tree_id: Uuid,
    /// Branch id within the tree.
    pub branch_id: Uuid,
    /// Ancestor ranges, oldest first.
    pub ancestors: Vec<BranchRange>,
}

/// A borrowed range of an ancestor branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRange {
    /// The ancestor branch.
    pub branch_id: Uuid,
    /// First node id taken from the ancestor.
    pub begin_node_id: i64,
    /// One past the last node id taken.
    pub end_node_id: i64,
}

impl BranchInfo {
    /// Create a root branch of a new tree.
    pub fn new_tree() -> Self {
        Self {
            tree_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            ancestors: Vec::new(),
        }
    }

    /// Serialize to a branch token.
    pub fn to_token(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a branch token.
    pub fn from_token(token: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(token)
    }
}

/// One node read back from a branch.
#[derive(Debug, Clone)]
pub struct HistoryNode {
    /// Event id of the first event in the batch.
    pub node_id: i64,
    /// Winning transaction id.
    pub transaction_id: i64,
    /// The serialized events.
    pub events: Blob,
    /// Number of events inside.
    pub event_count: i64,
}

/// Request for `read_history_branch`.
#[derive(Debug, Clone)]
pub struct ReadHistoryBranchRequest {
    /// Branch to read.
    pub branch_token: Vec<u8>,
    /// Inclusive minimum node id.
    pub min_node_id: i64,
    /// Exclusive maximum node id.
    pub max_node_id: i64,
    /// Maximum nodes per page.
    pub page_size: usize,
    /// Continuation token.
    pub next_page_token: Option<Vec<u8>>,
}

/// Response of `read_history_branch`.
#[derive(Debug, Clone, Default)]
pub struct ReadHistoryBranchResponse {
    /// Nodes, linearized across the branch ancestry.
    pub nodes: Vec<HistoryNode>,
    /// Continuation token; `None` when exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

// ============================================================================
// History tasks
// ============================================================================

/// Request for `get_history_tasks`.
#[derive(Debug, Clone)]
pub struct GetHistoryTasksRequest {
    /// Shard to read.
    pub shard_id: i32,
    /// Category queue to read.
    pub category: TaskCategory,
    /// Inclusive minimum key.
    pub inclusive_min_key: TaskKey,
    /// Exclusive maximum key.
    pub exclusive_max_key: TaskKey,
    /// Maximum tasks per page.
    pub batch_size: usize,
    /// Continuation token.
    pub next_page_token: Option<Vec<u8>>,
}

/// Response of `get_history_tasks`.
#[derive(Debug, Clone, Default)]
pub struct GetHistoryTasksResponse {
    /// Tasks in key order.
    pub tasks: Vec<Task>,
    /// Continuation token; `None` when exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

// ============================================================================
// Queue v2
// ============================================================================

/// Queue v2 queue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueV2Kind {
    /// Per-source-cluster replication dead letters.
    ReplicationDlq,
    /// Namespace metadata replication.
    NamespaceReplication,
}

/// A message in a v2 queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueV2Message {
    /// Message id, monotone per queue.
    pub id: i64,
    /// Opaque payload.
    pub payload: Blob,
    /// When the message was enqueued.
    pub enqueue_time: DateTime<Utc>,
}

/// Response of `read_messages`.
#[derive(Debug, Clone, Default)]
pub struct ReadQueueMessagesResponse {
    /// Messages in id order.
    pub messages: Vec<QueueV2Message>,
    /// Continuation token; `None` when exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

// ============================================================================
// Matching task queues
// ============================================================================

/// Task queue family type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskQueueType {
    /// Workflow tasks.
    Workflow,
    /// Activity tasks.
    Activity,
    /// Nexus tasks.
    Nexus,
}

/// Identity of one physical matching partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskQueueKey {
    /// Owning namespace.
    pub namespace_id: Uuid,
    /// Family name.
    pub name: String,
    /// Family type.
    pub task_type: TaskQueueType,
    /// Partition index; 0 is the root.
    pub partition: i32,
}

impl std::fmt::Display for TaskQueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{:?}/{}",
            self.namespace_id, self.name, self.task_type, self.partition
        )
    }
}

/// The matching partition row.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQueueInfo {
    /// Partition identity.
    pub key: TaskQueueKey,
    /// Ownership lease token.
    pub range_id: i64,
    /// Highest acked task id (all below are complete).
    pub ack_level: i64,
    /// Last update time, used by idle sweeps.
    pub updated_at: DateTime<Utc>,
}

/// A spooled matching task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingTask {
    /// Task id within the partition, allocated from the owner's block.
    pub task_id: i64,
    /// Workflow run the task belongs to.
    pub workflow_key: WorkflowKey,
    /// Scheduled event id back in the owning shard.
    pub scheduled_event_id: i64,
    /// Drop the task if read after this time.
    pub expiry: Option<DateTime<Utc>>,
    /// Build id stamped by assignment rules, if any.
    pub assigned_build_id: Option<String>,
}

/// Versioned user data attached to a task queue family (versioning rules,
/// deployment data). Opaque to the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskQueueUserData {
    /// CAS version.
    pub version: i64,
    /// Opaque payload.
    pub data: Blob,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_json_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            a: i32,
            b: String,
        }
        let value = Payload {
            a: 7,
            b: "x".into(),
        };
        let blob = Blob::from_json(&value).unwrap();
        assert_eq!(blob.encoding, "json/plain");
        let back: Payload = blob.to_json().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn branch_token_round_trip() {
        let info = BranchInfo {
            tree_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            ancestors: vec![BranchRange {
                branch_id: Uuid::new_v4(),
                begin_node_id: 1,
                end_node_id: 17,
            }],
        };
        let token = info.to_token().unwrap();
        assert_eq!(BranchInfo::from_token(&token).unwrap(), info);
    }

    #[test]
    fn terminal_status() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::ContinuedAsNew.is_terminal());
    }
}
