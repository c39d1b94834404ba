// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow transaction write path.
//!
//! Every durable change to a run goes through one of three transactions:
//! create, update, or conflict-resolve. The path is the same for all three:
//!
//! 1. Validate the mode against current state and the state/status pair
//!    against the legal table.
//! 2. Serialize the mutable state into its discrete-blob snapshot, assemble
//!    the event batches into history-node writes, and compute the size/count
//!    statistics that feed the per-run history caps.
//! 3. Call the store under the shard IO timeout.
//! 4. On success, put the fresh event blobs into the cross-region cache so
//!    standby clusters can fetch recent events without touching history
//!    storage.
//! 5. On an optimistic-conflict failure the write never committed: invalidate
//!    the in-memory state upstream and best-effort trim the dangling nodes
//!    past the last committed transaction on the current branch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use weft_common::tasks::{Task, WorkflowKey};
use weft_persistence::store::{ExecutionStore, HistoryStore};
use weft_persistence::types::{
    Blob, ConflictResolveMode, ConflictResolveWorkflowExecutionRequest, CreateWorkflowMode,
    CreateWorkflowExecutionRequest, HistoryNodeWrite, UpdateWorkflowMode,
    UpdateWorkflowExecutionRequest, WorkflowMutation, WorkflowSnapshot, WorkflowState,
    WorkflowStatus,
};

use crate::error::{EngineError, Result};
use crate::mutable_state::events::HistoryEvent;
use crate::mutable_state::MutableState;
use crate::shard::ShardContext;

/// Size and count of the events written by one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStatistics {
    /// Encoded bytes appended.
    pub size_bytes: usize,
    /// Events appended.
    pub event_count: usize,
}

/// One batch of events destined for a branch. `events` must be contiguous
/// and start at the batch's node id.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// Target branch token.
    pub branch_token: Vec<u8>,
    /// The events, in id order.
    pub events: Vec<HistoryEvent>,
    /// Whether this batch creates the branch.
    pub is_new_branch: bool,
}

/// Key of the cross-region event blob cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventBlobKey {
    /// Run identity.
    pub workflow_key: WorkflowKey,
    /// First event id of the batch.
    pub first_event_id: i64,
    /// Version of the first event.
    pub first_event_version: i64,
}

#[derive(Default)]
struct EventBlobCacheInner {
    blobs: HashMap<EventBlobKey, Blob>,
    order: VecDeque<EventBlobKey>,
    total_bytes: usize,
}

/// Bounded cache of recently written event blobs, consulted by the
/// replication sender before reading history storage.
pub struct EventBlobCache {
    max_bytes: usize,
    inner: Mutex<EventBlobCacheInner>,
}

impl EventBlobCache {
    /// Create a cache bounded to `max_bytes` of blob payload.
    pub fn new(max_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            max_bytes,
            inner: Mutex::new(EventBlobCacheInner::default()),
        })
    }

    /// Insert a blob, evicting oldest entries past the byte bound.
    pub fn put(&self, key: EventBlobKey, blob: Blob) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.blobs.insert(key.clone(), blob.clone()) {
            inner.total_bytes -= old.len();
        } else {
            inner.order.push_back(key);
        }
        inner.total_bytes += blob.len();
        while inner.total_bytes > self.max_bytes {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(removed) = inner.blobs.remove(&oldest) {
                inner.total_bytes -= removed.len();
            }
        }
    }

    /// Look up a blob.
    pub fn get(&self, key: &EventBlobKey) -> Option<Blob> {
        self.inner.lock().blobs.get(key).cloned()
    }

    /// Number of cached blobs.
    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deletions to apply alongside an update (completed activities, fired
/// timers, resolved children, and so on).
#[derive(Debug, Clone, Default)]
pub struct MutationDeletions {
    /// Activity scheduled event ids to drop.
    pub activities: Vec<i64>,
    /// Timer ids to drop.
    pub timers: Vec<String>,
    /// Child initiated event ids to drop.
    pub children: Vec<i64>,
    /// Cancel-request initiated event ids to drop.
    pub request_cancels: Vec<i64>,
    /// Signal initiated event ids to drop.
    pub signals: Vec<i64>,
    /// Signal-requested ids to drop.
    pub signal_requested_ids: Vec<String>,
    /// Chasm node paths to drop.
    pub chasm_nodes: Vec<String>,
    /// Whether buffered events were flushed by this transaction.
    pub clear_buffered: bool,
}

/// Executes workflow transactions against one shard.
pub struct WorkflowTransaction {
    shard: Arc<ShardContext>,
    xdc_cache: Arc<EventBlobCache>,
}

impl WorkflowTransaction {
    /// Create a transaction runner for a shard.
    pub fn new(shard: Arc<ShardContext>, xdc_cache: Arc<EventBlobCache>) -> Self {
        Self { shard, xdc_cache }
    }

    /// The shard this runner writes through.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a run with its first event batches and tasks.
    pub async fn create_workflow(
        &self,
        state: &MutableState,
        mode: CreateWorkflowMode,
        batches: Vec<EventBatch>,
        mut tasks: Vec<Task>,
    ) -> Result<HistoryStatistics> {
        validate_state_status(state.execution_state.state, state.execution_state.status)?;
        let snapshot = state.to_snapshot()?;
        let (writes, stats) = self.assemble_node_writes(&batches).await?;
        self.shard.assign_task_keys(&mut tasks).await?;

        let request = CreateWorkflowExecutionRequest {
            shard_id: self.shard.shard_id,
            range_id: self.shard.range_id(),
            mode,
            workflow_key: state.workflow_key.clone(),
            snapshot,
            record_version: 1,
            tasks,
            new_events: writes.clone(),
        };
        let result = self
            .shard
            .with_io_timeout(self.shard.store().create_workflow_execution(request))
            .await;
        self.finish(state, &batches, writes, result).await?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a mutation of an existing run.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_workflow(
        &self,
        state: &MutableState,
        deletions: MutationDeletions,
        expected_record_version: i64,
        mode: UpdateWorkflowMode,
        new_run: Option<(&MutableState, Vec<EventBatch>)>,
        batches: Vec<EventBatch>,
        mut tasks: Vec<Task>,
    ) -> Result<HistoryStatistics> {
        validate_state_status(state.execution_state.state, state.execution_state.status)?;
        let mutation = build_mutation(state, &deletions)?;

        let mut all_batches = batches.clone();
        let new_snapshot = match new_run {
            Some((new_state, new_batches)) => {
                validate_state_status(
                    new_state.execution_state.state,
                    new_state.execution_state.status,
                )?;
                all_batches.extend(new_batches);
                Some((new_state.workflow_key.clone(), new_state.to_snapshot()?))
            }
            None => None,
        };
        let (writes, stats) = self.assemble_node_writes(&all_batches).await?;
        self.shard.assign_task_keys(&mut tasks).await?;

        let request = UpdateWorkflowExecutionRequest {
            shard_id: self.shard.shard_id,
            range_id: self.shard.range_id(),
            mode,
            workflow_key: state.workflow_key.clone(),
            mutation,
            expected_record_version,
            new_snapshot,
            tasks,
            new_events: writes.clone(),
        };
        let result = self
            .shard
            .with_io_timeout(self.shard.store().update_workflow_execution(request))
            .await;
        self.finish(state, &all_batches, writes, result).await?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Conflict resolve
    // ------------------------------------------------------------------

    /// Replace a run's state wholesale after reset or cross-cluster conflict
    /// resolution.
    pub async fn conflict_resolve_workflow(
        &self,
        reset_state: &MutableState,
        expected_record_version: i64,
        mode: ConflictResolveMode,
        batches: Vec<EventBatch>,
        mut tasks: Vec<Task>,
    ) -> Result<HistoryStatistics> {
        validate_state_status(
            reset_state.execution_state.state,
            reset_state.execution_state.status,
        )?;
        let snapshot = reset_state.to_snapshot()?;
        let (writes, stats) = self.assemble_node_writes(&batches).await?;
        self.shard.assign_task_keys(&mut tasks).await?;

        let request = ConflictResolveWorkflowExecutionRequest {
            shard_id: self.shard.shard_id,
            range_id: self.shard.range_id(),
            mode,
            workflow_key: reset_state.workflow_key.clone(),
            reset_snapshot: snapshot,
            expected_record_version,
            new_snapshot: None,
            current_mutation: None,
            tasks,
            new_events: writes.clone(),
        };
        let result = self
            .shard
            .with_io_timeout(
                self.shard
                    .store()
                    .conflict_resolve_workflow_execution(request),
            )
            .await;
        self.finish(reset_state, &batches, writes, result).await?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    async fn assemble_node_writes(
        &self,
        batches: &[EventBatch],
    ) -> Result<(Vec<HistoryNodeWrite>, HistoryStatistics)> {
        let mut writes = Vec::with_capacity(batches.len());
        let mut stats = HistoryStatistics::default();
        for batch in batches {
            let Some(first) = batch.events.first() else {
                continue;
            };
            let blob = Blob::from_json(&batch.events)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            stats.size_bytes += blob.len();
            stats.event_count += batch.events.len();
            let transaction_id = self.shard.next_task_id().await?;
            writes.push(HistoryNodeWrite {
                branch_token: batch.branch_token.clone(),
                node_id: first.event_id,
                transaction_id,
                prev_transaction_id: 0,
                events: blob,
                event_count: batch.events.len() as i64,
                is_new_branch: batch.is_new_branch,
            });
        }
        Ok((writes, stats))
    }

    /// Handle the store result: populate the cross-region cache on success,
    /// trim dangling nodes on an optimistic conflict.
    async fn finish(
        &self,
        state: &MutableState,
        batches: &[EventBatch],
        writes: Vec<HistoryNodeWrite>,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                for (batch, write) in batches.iter().zip(writes.iter()) {
                    let Some(first) = batch.events.first() else {
                        continue;
                    };
                    self.xdc_cache.put(
                        EventBlobKey {
                            workflow_key: state.workflow_key.clone(),
                            first_event_id: first.event_id,
                            first_event_version: first.version,
                        },
                        write.events.clone(),
                    );
                }
                debug!(
                    workflow = %state.workflow_key,
                    batches = batches.len(),
                    "workflow transaction committed"
                );
                Ok(())
            }
            Err(err) if matches!(err, EngineError::Conflict(_)) => {
                // the write never committed; drop whatever nodes may have
                // landed before the condition check failed
                for write in &writes {
                    let trim = self
                        .shard
                        .store()
                        .trim_history_branch(
                            &write.branch_token,
                            write.node_id,
                            write.transaction_id - 1,
                        )
                        .await;
                    if let Err(trim_err) = trim {
                        warn!(
                            workflow = %state.workflow_key,
                            error = %trim_err,
                            "best-effort history trim failed"
                        );
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// The legal state/status table. A closed run must carry a terminal status;
/// an open one must not.
pub fn validate_state_status(state: WorkflowState, status: WorkflowStatus) -> Result<()> {
    let legal = match state {
        WorkflowState::Created | WorkflowState::Running | WorkflowState::Zombie => {
            status == WorkflowStatus::Running
        }
        WorkflowState::Completed => status.is_terminal(),
        WorkflowState::Corrupted => true,
    };
    if !legal {
        return Err(EngineError::InvalidState(format!(
            "state {state:?} is incompatible with status {status:?}"
        )));
    }
    Ok(())
}

fn build_mutation(state: &MutableState, deletions: &MutationDeletions) -> Result<WorkflowMutation> {
    let snapshot: WorkflowSnapshot = state.to_snapshot()?;
    Ok(WorkflowMutation {
        execution_info: snapshot.execution_info,
        execution_state: snapshot.execution_state,
        state: snapshot.state,
        status: snapshot.status,
        next_event_id: snapshot.next_event_id,
        last_write_version: snapshot.last_write_version,
        upsert_activity_infos: snapshot.activity_infos,
        delete_activity_infos: deletions.activities.iter().copied().collect(),
        upsert_timer_infos: snapshot.timer_infos,
        delete_timer_infos: deletions.timers.iter().cloned().collect(),
        upsert_child_infos: snapshot.child_execution_infos,
        delete_child_infos: deletions.children.iter().copied().collect(),
        upsert_request_cancel_infos: snapshot.request_cancel_infos,
        delete_request_cancel_infos: deletions.request_cancels.iter().copied().collect(),
        upsert_signal_infos: snapshot.signal_infos,
        delete_signal_infos: deletions.signals.iter().copied().collect(),
        upsert_signal_requested_ids: snapshot.signal_requested_ids,
        delete_signal_requested_ids: deletions.signal_requested_ids.iter().cloned().collect(),
        new_buffered_events: snapshot.buffered_events,
        clear_buffered_events: deletions.clear_buffered,
        upsert_chasm_nodes: snapshot.chasm_nodes,
        delete_chasm_nodes: deletions.chasm_nodes.iter().cloned().collect(),
        checksum: snapshot.checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use weft_common::config::DynamicConfig;
    use weft_common::tasks::TaskAttributes;
    use weft_persistence::store::Store;
    use weft_persistence::types::{BranchInfo, ReadHistoryBranchRequest};
    use weft_persistence::MemoryStore;

    use crate::config::HistoryConfig;
    use crate::mutable_state::events::EventType;

    async fn shard_fixture() -> (Arc<ShardContext>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let shard = ShardContext::acquire(
            dyn_store,
            HistoryConfig::new(DynamicConfig::new(), 4),
            1,
            "host-a",
        )
        .await
        .unwrap();
        (shard, store)
    }

    fn new_state(branch_token: Vec<u8>) -> MutableState {
        let key = WorkflowKey::new(Uuid::new_v4(), "wf-1", Uuid::new_v4());
        let mut state = MutableState::new_run(
            key,
            "req-1".into(),
            "queue".into(),
            branch_token,
            Utc::now(),
        );
        state.mark_running();
        state
    }

    fn start_batch(state: &mut MutableState, branch_token: Vec<u8>) -> EventBatch {
        let event = state
            .add_event(
                EventType::WorkflowExecutionStarted,
                serde_json::json!({}),
                1,
                Utc::now(),
            )
            .unwrap();
        EventBatch {
            branch_token,
            events: vec![event],
            is_new_branch: true,
        }
    }

    #[tokio::test]
    async fn create_commits_state_events_and_tasks() {
        let (shard, store) = shard_fixture().await;
        let branch = BranchInfo::new_tree().to_token().unwrap();
        let mut state = new_state(branch.clone());
        let batch = start_batch(&mut state, branch.clone());
        let txn = WorkflowTransaction::new(shard.clone(), EventBlobCache::new(1 << 20));

        let tasks = vec![Task {
            shard_id: 0,
            key: weft_common::tasks::TaskKey::immediate(0),
            workflow_key: state.workflow_key.clone(),
            version: 1,
            destination: None,
            attributes: TaskAttributes::DispatchWorkflowTask {
                task_queue: "queue".into(),
                scheduled_event_id: 2,
            },
        }];
        let stats = txn
            .create_workflow(&state, CreateWorkflowMode::BrandNew, vec![batch], tasks)
            .await
            .unwrap();
        assert_eq!(stats.event_count, 1);
        assert!(stats.size_bytes > 0);

        let stored = store
            .get_workflow_execution(1, &state.workflow_key)
            .await
            .unwrap();
        assert_eq!(stored.snapshot.next_event_id, 2);

        let read = store
            .read_history_branch(ReadHistoryBranchRequest {
                branch_token: branch,
                min_node_id: 0,
                max_node_id: i64::MAX,
                page_size: 10,
                next_page_token: None,
            })
            .await
            .unwrap();
        assert_eq!(read.nodes.len(), 1);
        assert_eq!(read.nodes[0].node_id, 1);
    }

    #[tokio::test]
    async fn success_populates_the_cross_region_cache() {
        let (shard, _store) = shard_fixture().await;
        let branch = BranchInfo::new_tree().to_token().unwrap();
        let mut state = new_state(branch.clone());
        let batch = start_batch(&mut state, branch.clone());
        let cache = EventBlobCache::new(1 << 20);
        let txn = WorkflowTransaction::new(shard, cache.clone());

        txn.create_workflow(&state, CreateWorkflowMode::BrandNew, vec![batch], vec![])
            .await
            .unwrap();

        let blob = cache.get(&EventBlobKey {
            workflow_key: state.workflow_key.clone(),
            first_event_id: 1,
            first_event_version: 1,
        });
        assert!(blob.is_some());
    }

    #[tokio::test]
    async fn conflict_trims_dangling_nodes() {
        let (shard, store) = shard_fixture().await;
        let branch = BranchInfo::new_tree().to_token().unwrap();
        let txn = WorkflowTransaction::new(shard.clone(), EventBlobCache::new(1 << 20));

        // first run takes the current pointer
        let mut first = new_state(branch.clone());
        let first_batch = start_batch(&mut first, branch.clone());
        txn.create_workflow(&first, CreateWorkflowMode::BrandNew, vec![first_batch], vec![])
            .await
            .unwrap();

        // a second brand-new create for the same workflow id must conflict
        let second_branch = BranchInfo::new_tree().to_token().unwrap();
        let second_key = WorkflowKey::new(
            first.workflow_key.namespace_id,
            first.workflow_key.workflow_id.clone(),
            Uuid::new_v4(),
        );
        let mut second = MutableState::new_run(
            second_key,
            "req-2".into(),
            "queue".into(),
            second_branch.clone(),
            Utc::now(),
        );
        second.mark_running();
        let second_batch = start_batch(&mut second, second_branch.clone());

        let err = txn
            .create_workflow(
                &second,
                CreateWorkflowMode::BrandNew,
                vec![second_batch],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // the dangling nodes on the second branch were trimmed
        let read = store
            .read_history_branch(ReadHistoryBranchRequest {
                branch_token: second_branch,
                min_node_id: 0,
                max_node_id: i64::MAX,
                page_size: 10,
                next_page_token: None,
            })
            .await
            .unwrap();
        assert!(read.nodes.is_empty());
    }

    #[tokio::test]
    async fn update_applies_mutation_and_deletions() {
        let (shard, store) = shard_fixture().await;
        let branch = BranchInfo::new_tree().to_token().unwrap();
        let mut state = new_state(branch.clone());
        let batch = start_batch(&mut state, branch.clone());
        let txn = WorkflowTransaction::new(shard, EventBlobCache::new(1 << 20));
        txn.create_workflow(&state, CreateWorkflowMode::BrandNew, vec![batch], vec![])
            .await
            .unwrap();

        // schedule an activity, then complete it in a second transaction
        state
            .add_activity(
                crate::mutable_state::ActivityInfo {
                    scheduled_event_id: 2,
                    started_event_id: 0,
                    activity_id: "a1".into(),
                    task_queue: "queue".into(),
                    attempt: 1,
                    last_heartbeat_time: None,
                    version: 1,
                },
                10,
            )
            .unwrap();
        let event = state
            .add_event(
                EventType::ActivityTaskScheduled,
                serde_json::json!({}),
                1,
                Utc::now(),
            )
            .unwrap();
        txn.update_workflow(
            &state,
            MutationDeletions::default(),
            1,
            UpdateWorkflowMode::UpdateCurrent,
            None,
            vec![EventBatch {
                branch_token: branch.clone(),
                events: vec![event],
                is_new_branch: false,
            }],
            vec![],
        )
        .await
        .unwrap();

        state.activity_infos.remove(&2);
        let completion = state
            .add_event(
                EventType::ActivityTaskCompleted,
                serde_json::json!({}),
                1,
                Utc::now(),
            )
            .unwrap();
        txn.update_workflow(
            &state,
            MutationDeletions {
                activities: vec![2],
                ..MutationDeletions::default()
            },
            2,
            UpdateWorkflowMode::UpdateCurrent,
            None,
            vec![EventBatch {
                branch_token: branch.clone(),
                events: vec![completion],
                is_new_branch: false,
            }],
            vec![],
        )
        .await
        .unwrap();

        let stored = store
            .get_workflow_execution(1, &state.workflow_key)
            .await
            .unwrap();
        assert!(stored.snapshot.activity_infos.is_empty());
        assert_eq!(stored.snapshot.next_event_id, 4);
        assert_eq!(stored.record_version, 3);
    }

    #[test]
    fn state_status_table() {
        assert!(validate_state_status(WorkflowState::Running, WorkflowStatus::Running).is_ok());
        assert!(validate_state_status(WorkflowState::Completed, WorkflowStatus::Completed).is_ok());
        assert!(validate_state_status(WorkflowState::Completed, WorkflowStatus::Running).is_err());
        assert!(validate_state_status(WorkflowState::Running, WorkflowStatus::Failed).is_err());
        assert!(validate_state_status(WorkflowState::Zombie, WorkflowStatus::Running).is_ok());
        assert!(validate_state_status(WorkflowState::Corrupted, WorkflowStatus::Failed).is_ok());
    }
}
