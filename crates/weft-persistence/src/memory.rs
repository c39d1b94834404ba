// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.
//!
//! Implements every store trait with the same CAS and conflict semantics as
//! the Postgres driver, including shard lease checks, current-run pointer
//! maintenance and record-version CAS. Tests across the workspace run against
//! this store; competing-owner scenarios are exercised by simply acquiring
//! the same lease from two callers.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use weft_common::tasks::{Task, TaskCategory, TaskKey, WorkflowKey};

use crate::error::{Result, StoreError};
use crate::store::*;
use crate::types::*;

#[derive(Default)]
struct QueueData {
    next_id: i64,
    messages: BTreeMap<i64, QueueV2Message>,
}

#[derive(Default)]
struct Inner {
    // metadata
    notification_version: i64,
    namespaces: HashMap<Uuid, NamespaceRecord>,
    namespace_names: HashMap<String, Uuid>,
    // shards
    shards: HashMap<i32, ShardInfo>,
    // executions
    executions: HashMap<(i32, WorkflowKey), (WorkflowSnapshot, i64)>,
    currents: HashMap<(i32, Uuid, String), CurrentExecution>,
    // history: branch -> (node_id, txn_id) -> (events, event_count)
    history: HashMap<(Uuid, Uuid), BTreeMap<(i64, i64), (Blob, i64)>>,
    // internal task queues
    tasks: HashMap<(i32, TaskCategory), BTreeMap<TaskKey, Task>>,
    // queue v2
    queues: HashMap<(QueueV2Kind, String), QueueData>,
    // matching
    task_queues: HashMap<TaskQueueKey, TaskQueueInfo>,
    matching_tasks: HashMap<TaskQueueKey, BTreeMap<i64, MatchingTask>>,
    user_data: HashMap<(Uuid, String, TaskQueueType), TaskQueueUserData>,
}

/// In-memory implementation of the full store surface.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_shard_lease(inner: &Inner, shard_id: i32, range_id: i64) -> Result<()> {
        match inner.shards.get(&shard_id) {
            Some(shard) if shard.range_id == range_id => Ok(()),
            Some(_) | None => Err(StoreError::ShardOwnershipLost { shard_id, range_id }),
        }
    }

    fn insert_tasks(inner: &mut Inner, shard_id: i32, tasks: Vec<Task>) {
        for task in tasks {
            inner
                .tasks
                .entry((shard_id, task.category()))
                .or_default()
                .insert(task.key, task);
        }
    }

    fn append_nodes(inner: &mut Inner, writes: &[HistoryNodeWrite]) -> Result<()> {
        for write in writes {
            Self::append_node(inner, write)?;
        }
        Ok(())
    }

    fn append_node(inner: &mut Inner, write: &HistoryNodeWrite) -> Result<()> {
        let info = BranchInfo::from_token(&write.branch_token)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let branch = inner
            .history
            .entry((info.tree_id, info.branch_id))
            .or_default();
        branch.insert(
            (write.node_id, write.transaction_id),
            (write.events.clone(), write.event_count),
        );
        Ok(())
    }

    fn current_of(snapshot: &WorkflowSnapshot, run_id: Uuid) -> CurrentExecution {
        CurrentExecution {
            run_id,
            state: snapshot.state,
            status: snapshot.status,
            last_write_version: snapshot.last_write_version,
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_metadata(&self) -> Result<MetadataInfo> {
        Ok(MetadataInfo {
            notification_version: self.inner.read().notification_version,
        })
    }

    async fn list_namespaces(
        &self,
        request: ListNamespacesRequest,
    ) -> Result<ListNamespacesResponse> {
        let inner = self.inner.read();
        let after: Option<String> = match &request.next_page_token {
            Some(token) => Some(
                String::from_utf8(token.clone())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let mut names: Vec<&String> = inner.namespace_names.keys().collect();
        names.sort();
        let page_size = if request.page_size == 0 {
            usize::MAX
        } else {
            request.page_size
        };

        let mut records = Vec::new();
        let mut last_name = None;
        for name in names {
            if let Some(after) = &after {
                if name <= after {
                    continue;
                }
            }
            let id = inner.namespace_names[name];
            let record = &inner.namespaces[&id];
            if record.state == NamespaceState::Deleted && !request.include_deleted {
                continue;
            }
            records.push(record.clone());
            last_name = Some(name.clone());
            if records.len() >= page_size {
                break;
            }
        }
        let next_page_token = if records.len() >= page_size {
            last_name.map(String::into_bytes)
        } else {
            None
        };
        Ok(ListNamespacesResponse {
            namespaces: records,
            next_page_token,
        })
    }

    async fn get_namespace_by_name(&self, name: &str) -> Result<NamespaceRecord> {
        let inner = self.inner.read();
        inner
            .namespace_names
            .get(name)
            .and_then(|id| inner.namespaces.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("namespace '{name}'")))
    }

    async fn get_namespace_by_id(&self, id: Uuid) -> Result<NamespaceRecord> {
        self.inner
            .read()
            .namespaces
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("namespace '{id}'")))
    }

    async fn create_namespace(&self, mut record: NamespaceRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.namespace_names.contains_key(&record.name) {
            return Err(StoreError::AlreadyExists(format!(
                "namespace '{}'",
                record.name
            )));
        }
        if inner.namespaces.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(format!("namespace '{}'", record.id)));
        }
        record.notification_version = inner.notification_version;
        inner.notification_version += 1;
        inner.namespace_names.insert(record.name.clone(), record.id);
        inner.namespaces.insert(record.id, record);
        Ok(())
    }

    async fn update_namespace(
        &self,
        mut record: NamespaceRecord,
        expected_notification_version: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let current = inner
            .namespaces
            .get(&record.id)
            .ok_or_else(|| StoreError::NotFound(format!("namespace '{}'", record.id)))?;
        if current.notification_version != expected_notification_version {
            return Err(StoreError::ConditionFailed(format!(
                "namespace '{}' notification version {} != expected {}",
                record.name, current.notification_version, expected_notification_version
            )));
        }
        record.notification_version = inner.notification_version;
        inner.notification_version += 1;
        inner.namespaces.insert(record.id, record);
        Ok(())
    }

    async fn delete_namespace(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .namespaces
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("namespace '{id}'")))?;
        inner.namespace_names.remove(&record.name);
        inner.notification_version += 1;
        Ok(())
    }
}

// ============================================================================
// Shard
// ============================================================================

#[async_trait]
impl ShardStore for MemoryStore {
    async fn get_or_create_shard(&self, shard_id: i32, owner: &str) -> Result<ShardInfo> {
        let mut inner = self.inner.write();
        Ok(inner
            .shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id, owner))
            .clone())
    }

    async fn update_shard(&self, mut info: ShardInfo, expected_range_id: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let shard_id = info.shard_id;
        let stored = inner
            .shards
            .get(&shard_id)
            .ok_or_else(|| StoreError::NotFound(format!("shard {shard_id}")))?;
        if stored.range_id != expected_range_id {
            return Err(StoreError::ShardOwnershipLost {
                shard_id,
                range_id: expected_range_id,
            });
        }
        info.updated_at = Utc::now();
        inner.shards.insert(shard_id, info);
        Ok(())
    }

    async fn assert_shard_ownership(&self, shard_id: i32, range_id: i64) -> Result<()> {
        Self::check_shard_lease(&self.inner.read(), shard_id, range_id)
    }
}

// ============================================================================
// Execution
// ============================================================================

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_shard_lease(&inner, request.shard_id, request.range_id)?;

        let exec_key = (request.shard_id, request.workflow_key.clone());
        if inner.executions.contains_key(&exec_key) {
            return Err(StoreError::AlreadyExists(format!(
                "workflow run {}",
                request.workflow_key
            )));
        }

        let current_key = (
            request.shard_id,
            request.workflow_key.namespace_id,
            request.workflow_key.workflow_id.clone(),
        );
        match &request.mode {
            CreateWorkflowMode::BrandNew => {
                if let Some(current) = inner.currents.get(&current_key) {
                    return Err(StoreError::CurrentWorkflowConditionFailed(format!(
                        "workflow '{}' already has current run {}",
                        request.workflow_key.workflow_id, current.run_id
                    )));
                }
            }
            CreateWorkflowMode::WorkflowIdReuse {
                prev_run_id,
                prev_last_write_version,
            } => {
                let current = inner.currents.get(&current_key).ok_or_else(|| {
                    StoreError::CurrentWorkflowConditionFailed(format!(
                        "workflow '{}' has no current run to reuse",
                        request.workflow_key.workflow_id
                    ))
                })?;
                if current.run_id != *prev_run_id
                    || current.last_write_version != *prev_last_write_version
                    || current.state != WorkflowState::Completed
                {
                    return Err(StoreError::CurrentWorkflowConditionFailed(format!(
                        "workflow '{}' current run moved",
                        request.workflow_key.workflow_id
                    )));
                }
            }
            CreateWorkflowMode::Zombie => {}
        }

        if !matches!(request.mode, CreateWorkflowMode::Zombie) {
            inner.currents.insert(
                current_key,
                Self::current_of(&request.snapshot, request.workflow_key.run_id),
            );
        }
        inner
            .executions
            .insert(exec_key, (request.snapshot, request.record_version));
        Self::append_nodes(&mut inner, &request.new_events)?;
        Self::insert_tasks(&mut inner, request.shard_id, request.tasks);
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_shard_lease(&inner, request.shard_id, request.range_id)?;

        let current_key = (
            request.shard_id,
            request.workflow_key.namespace_id,
            request.workflow_key.workflow_id.clone(),
        );
        if request.mode == UpdateWorkflowMode::UpdateCurrent {
            let current = inner.currents.get(&current_key).ok_or_else(|| {
                StoreError::CurrentWorkflowConditionFailed(format!(
                    "workflow '{}' has no current run",
                    request.workflow_key.workflow_id
                ))
            })?;
            if current.run_id != request.workflow_key.run_id {
                return Err(StoreError::CurrentWorkflowConditionFailed(format!(
                    "run {} is not current for workflow '{}'",
                    request.workflow_key.run_id, request.workflow_key.workflow_id
                )));
            }
        }

        let exec_key = (request.shard_id, request.workflow_key.clone());
        let (snapshot, record_version) = inner
            .executions
            .get_mut(&exec_key)
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {}", request.workflow_key)))?;
        if *record_version != request.expected_record_version {
            return Err(StoreError::WorkflowConditionFailed(format!(
                "run {} record version {} != expected {}",
                request.workflow_key, record_version, request.expected_record_version
            )));
        }
        request.mutation.apply_to(snapshot);
        *record_version += 1;
        let mutated = Self::current_of(snapshot, request.workflow_key.run_id);

        if let Some((new_key, new_snapshot)) = &request.new_snapshot {
            let new_exec_key = (request.shard_id, new_key.clone());
            let new_current = Self::current_of(new_snapshot, new_key.run_id);
            inner.executions.insert(new_exec_key, (new_snapshot.clone(), 1));
            if request.mode == UpdateWorkflowMode::UpdateCurrent {
                inner.currents.insert(current_key, new_current);
            }
        } else if request.mode == UpdateWorkflowMode::UpdateCurrent {
            inner.currents.insert(current_key, mutated);
        }

        Self::append_nodes(&mut inner, &request.new_events)?;
        Self::insert_tasks(&mut inner, request.shard_id, request.tasks);
        Ok(())
    }

    async fn conflict_resolve_workflow_execution(
        &self,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_shard_lease(&inner, request.shard_id, request.range_id)?;

        let exec_key = (request.shard_id, request.workflow_key.clone());
        let (snapshot, record_version) = inner
            .executions
            .get_mut(&exec_key)
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {}", request.workflow_key)))?;
        if *record_version != request.expected_record_version {
            return Err(StoreError::WorkflowConditionFailed(format!(
                "run {} record version {} != expected {}",
                request.workflow_key, record_version, request.expected_record_version
            )));
        }
        *snapshot = request.reset_snapshot.clone();
        *record_version += 1;

        if let Some((mutated_key, mutation, expected)) = &request.current_mutation {
            let mutated_exec_key = (request.shard_id, mutated_key.clone());
            let (mutated_snapshot, mutated_version) = inner
                .executions
                .get_mut(&mutated_exec_key)
                .ok_or_else(|| StoreError::NotFound(format!("workflow run {mutated_key}")))?;
            if *mutated_version != *expected {
                return Err(StoreError::WorkflowConditionFailed(format!(
                    "run {mutated_key} record version moved during conflict resolve"
                )));
            }
            mutation.apply_to(mutated_snapshot);
            *mutated_version += 1;
        }

        if let Some((new_key, new_snapshot)) = &request.new_snapshot {
            inner
                .executions
                .insert((request.shard_id, new_key.clone()), (new_snapshot.clone(), 1));
        }

        if request.mode == ConflictResolveMode::ResetCurrent {
            let current_key = (
                request.shard_id,
                request.workflow_key.namespace_id,
                request.workflow_key.workflow_id.clone(),
            );
            let (winner_key, winner_snapshot) = match &request.new_snapshot {
                Some((k, s)) => (k.clone(), s),
                None => (request.workflow_key.clone(), &request.reset_snapshot),
            };
            inner
                .currents
                .insert(current_key, Self::current_of(winner_snapshot, winner_key.run_id));
        }

        Self::append_nodes(&mut inner, &request.new_events)?;
        Self::insert_tasks(&mut inner, request.shard_id, request.tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
    ) -> Result<GetWorkflowExecutionResponse> {
        let inner = self.inner.read();
        let (snapshot, record_version) = inner
            .executions
            .get(&(shard_id, workflow_key.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {workflow_key}")))?;
        Ok(GetWorkflowExecutionResponse {
            snapshot: snapshot.clone(),
            record_version: *record_version,
        })
    }

    async fn set_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
        snapshot: WorkflowSnapshot,
        expected_record_version: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let (stored, record_version) = inner
            .executions
            .get_mut(&(shard_id, workflow_key.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {workflow_key}")))?;
        if *record_version != expected_record_version {
            return Err(StoreError::WorkflowConditionFailed(format!(
                "run {workflow_key} record version moved"
            )));
        }
        *stored = snapshot;
        *record_version += 1;
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        inner.executions.remove(&(shard_id, workflow_key.clone()));
        Ok(())
    }

    async fn delete_current_workflow_execution(
        &self,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (shard_id, namespace_id, workflow_id.to_string());
        if inner.currents.get(&key).is_some_and(|c| c.run_id == run_id) {
            inner.currents.remove(&key);
        }
        Ok(())
    }

    async fn get_current_execution(
        &self,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<CurrentExecution> {
        self.inner
            .read()
            .currents
            .get(&(shard_id, namespace_id, workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("current run of '{workflow_id}'")))
    }

    async fn list_concrete_executions(
        &self,
        shard_id: i32,
        page_size: usize,
        next_page_token: Option<Vec<u8>>,
    ) -> Result<(Vec<WorkflowKey>, Option<Vec<u8>>)> {
        let inner = self.inner.read();
        let after: Option<String> = match next_page_token {
            Some(t) => {
                Some(String::from_utf8(t).map_err(|e| StoreError::Serialization(e.to_string()))?)
            }
            None => None,
        };
        let mut keys: Vec<WorkflowKey> = inner
            .executions
            .keys()
            .filter(|(s, _)| *s == shard_id)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort_by_key(|k| k.to_string());
        let page: Vec<WorkflowKey> = keys
            .into_iter()
            .filter(|k| after.as_ref().is_none_or(|a| k.to_string() > *a))
            .take(page_size.max(1))
            .collect();
        let token = if page.len() >= page_size.max(1) {
            page.last().map(|k| k.to_string().into_bytes())
        } else {
            None
        };
        Ok((page, token))
    }
}

// ============================================================================
// History tree
// ============================================================================

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_history_nodes(&self, write: HistoryNodeWrite) -> Result<()> {
        let mut inner = self.inner.write();
        Self::append_node(&mut inner, &write)
    }

    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse> {
        let inner = self.inner.read();
        let info = BranchInfo::from_token(&request.branch_token)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Segments: ancestor ranges first, then the branch itself.
        let mut segments: Vec<(Uuid, i64, i64)> = info
            .ancestors
            .iter()
            .map(|r| (r.branch_id, r.begin_node_id, r.end_node_id))
            .collect();
        segments.push((info.branch_id, 0, i64::MAX));

        let start_after: Option<i64> = match &request.next_page_token {
            Some(t) => Some(
                serde_json::from_slice(t).map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        let mut nodes: Vec<HistoryNode> = Vec::new();
        for (branch_id, begin, end) in segments {
            let Some(branch) = inner.history.get(&(info.tree_id, branch_id)) else {
                continue;
            };
            // Highest transaction id wins per node.
            let mut per_node: BTreeMap<i64, (i64, Blob, i64)> = BTreeMap::new();
            for ((node_id, txn_id), (events, count)) in branch.range((begin, i64::MIN)..(end, i64::MAX))
            {
                if *node_id < request.min_node_id || *node_id >= request.max_node_id {
                    continue;
                }
                if let Some(after) = start_after {
                    if *node_id <= after {
                        continue;
                    }
                }
                let entry = per_node.entry(*node_id).or_insert((*txn_id, events.clone(), *count));
                if *txn_id >= entry.0 {
                    *entry = (*txn_id, events.clone(), *count);
                }
            }
            for (node_id, (txn_id, events, count)) in per_node {
                nodes.push(HistoryNode {
                    node_id,
                    transaction_id: txn_id,
                    events,
                    event_count: count,
                });
            }
        }
        nodes.sort_by_key(|n| n.node_id);

        let page_size = request.page_size.max(1);
        let next_page_token = if nodes.len() > page_size {
            nodes.truncate(page_size);
            nodes
                .last()
                .map(|n| serde_json::to_vec(&n.node_id))
                .transpose()?
        } else {
            None
        };
        Ok(ReadHistoryBranchResponse {
            nodes,
            next_page_token,
        })
    }

    async fn fork_history_branch(&self, source: &[u8], fork_node_id: i64) -> Result<Vec<u8>> {
        let info = BranchInfo::from_token(source)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut ancestors = info.ancestors.clone();
        // Keep only ancestor ranges below the fork point, then borrow from
        // the source branch itself.
        ancestors.retain(|r| r.begin_node_id < fork_node_id);
        if let Some(last) = ancestors.last_mut() {
            last.end_node_id = last.end_node_id.min(fork_node_id);
        }
        ancestors.push(BranchRange {
            branch_id: info.branch_id,
            begin_node_id: ancestors.last().map(|r| r.end_node_id).unwrap_or(1),
            end_node_id: fork_node_id,
        });
        let forked = BranchInfo {
            tree_id: info.tree_id,
            branch_id: Uuid::new_v4(),
            ancestors,
        };
        forked
            .to_token()
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn delete_history_branch(&self, branch_token: &[u8]) -> Result<()> {
        let info = BranchInfo::from_token(branch_token)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.inner
            .write()
            .history
            .remove(&(info.tree_id, info.branch_id));
        Ok(())
    }

    async fn trim_history_branch(
        &self,
        branch_token: &[u8],
        node_id: i64,
        transaction_id: i64,
    ) -> Result<()> {
        let info = BranchInfo::from_token(branch_token)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut inner = self.inner.write();
        if let Some(branch) = inner.history.get_mut(&(info.tree_id, info.branch_id)) {
            branch.retain(|(n, t), _| *n < node_id || (*n == node_id && *t <= transaction_id));
        }
        Ok(())
    }
}

// ============================================================================
// History tasks
// ============================================================================

#[async_trait]
impl TaskStore for MemoryStore {
    async fn add_history_tasks(
        &self,
        shard_id: i32,
        range_id: i64,
        tasks: Vec<Task>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_shard_lease(&inner, shard_id, range_id)?;
        Self::insert_tasks(&mut inner, shard_id, tasks);
        Ok(())
    }

    async fn get_history_tasks(
        &self,
        request: GetHistoryTasksRequest,
    ) -> Result<GetHistoryTasksResponse> {
        let inner = self.inner.read();
        let start: TaskKey = match &request.next_page_token {
            Some(t) => {
                serde_json::from_slice(t).map_err(|e| StoreError::Serialization(e.to_string()))?
            }
            None => request.inclusive_min_key,
        };
        let Some(queue) = inner.tasks.get(&(request.shard_id, request.category)) else {
            return Ok(GetHistoryTasksResponse::default());
        };
        let batch = request.batch_size.max(1);
        let mut tasks: Vec<Task> = queue
            .range(start..request.exclusive_max_key)
            .map(|(_, task)| task.clone())
            .take(batch + 1)
            .collect();
        let next_page_token = if tasks.len() > batch {
            tasks.truncate(batch);
            tasks
                .last()
                .map(|t| serde_json::to_vec(&t.key.next()))
                .transpose()?
        } else {
            None
        };
        Ok(GetHistoryTasksResponse {
            tasks,
            next_page_token,
        })
    }

    async fn complete_history_task(
        &self,
        shard_id: i32,
        category: TaskCategory,
        key: TaskKey,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(queue) = inner.tasks.get_mut(&(shard_id, category)) {
            queue.remove(&key);
        }
        Ok(())
    }

    async fn range_complete_history_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_min_key: TaskKey,
        exclusive_max_key: TaskKey,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(queue) = inner.tasks.get_mut(&(shard_id, category)) {
            let keys: Vec<TaskKey> = queue
                .range(inclusive_min_key..exclusive_max_key)
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                queue.remove(&key);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Queue v2
// ============================================================================

#[async_trait]
impl QueueV2Store for MemoryStore {
    async fn create_queue(&self, kind: QueueV2Kind, name: &str) -> Result<()> {
        self.inner
            .write()
            .queues
            .entry((kind, name.to_string()))
            .or_default();
        Ok(())
    }

    async fn enqueue_message(&self, kind: QueueV2Kind, name: &str, payload: Blob) -> Result<i64> {
        let mut inner = self.inner.write();
        let queue = inner
            .queues
            .get_mut(&(kind, name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("queue '{name}'")))?;
        let id = queue.next_id;
        queue.next_id += 1;
        queue.messages.insert(
            id,
            QueueV2Message {
                id,
                payload,
                enqueue_time: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn read_messages(
        &self,
        kind: QueueV2Kind,
        name: &str,
        min_message_id: i64,
        page_size: usize,
    ) -> Result<ReadQueueMessagesResponse> {
        let inner = self.inner.read();
        let queue = inner
            .queues
            .get(&(kind, name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("queue '{name}'")))?;
        let messages: Vec<QueueV2Message> = queue
            .messages
            .range(min_message_id..)
            .take(page_size.max(1))
            .map(|(_, m)| m.clone())
            .collect();
        Ok(ReadQueueMessagesResponse {
            messages,
            next_page_token: None,
        })
    }

    async fn range_delete_messages(
        &self,
        kind: QueueV2Kind,
        name: &str,
        inclusive_max_message_id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(queue) = inner.queues.get_mut(&(kind, name.to_string())) {
            let ids: Vec<i64> = queue
                .messages
                .range(..=inclusive_max_message_id)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                queue.messages.remove(&id);
            }
        }
        Ok(())
    }

    async fn list_queues(&self, kind: QueueV2Kind) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .queues
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// Matching
// ============================================================================

#[async_trait]
impl MatchingTaskStore for MemoryStore {
    async fn lease_task_queue(&self, key: &TaskQueueKey, _owner: &str) -> Result<TaskQueueInfo> {
        let mut inner = self.inner.write();
        let info = inner
            .task_queues
            .entry(key.clone())
            .or_insert_with(|| TaskQueueInfo {
                key: key.clone(),
                range_id: 0,
                ack_level: 0,
                updated_at: Utc::now(),
            });
        info.range_id += 1;
        info.updated_at = Utc::now();
        Ok(info.clone())
    }

    async fn update_task_queue(&self, mut info: TaskQueueInfo, expected_range_id: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .task_queues
            .get(&info.key)
            .ok_or_else(|| StoreError::NotFound(format!("task queue {}", info.key)))?;
        if stored.range_id != expected_range_id {
            return Err(StoreError::ConditionFailed(format!(
                "task queue {} range_id {} != expected {}",
                info.key, stored.range_id, expected_range_id
            )));
        }
        info.updated_at = Utc::now();
        let key = info.key.clone();
        inner.task_queues.insert(key, info);
        Ok(())
    }

    async fn create_tasks(
        &self,
        key: &TaskQueueKey,
        range_id: i64,
        tasks: Vec<MatchingTask>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .task_queues
            .get(key)
            .ok_or_else(|| StoreError::NotFound(format!("task queue {key}")))?;
        if stored.range_id != range_id {
            return Err(StoreError::ConditionFailed(format!(
                "task queue {key} range_id {} != expected {range_id}",
                stored.range_id
            )));
        }
        let queue = inner.matching_tasks.entry(key.clone()).or_default();
        for task in tasks {
            queue.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        key: &TaskQueueKey,
        exclusive_min_task_id: i64,
        inclusive_max_task_id: i64,
        batch_size: usize,
    ) -> Result<Vec<MatchingTask>> {
        let inner = self.inner.read();
        let Some(queue) = inner.matching_tasks.get(key) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .range(exclusive_min_task_id + 1..=inclusive_max_task_id)
            .take(batch_size.max(1))
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn complete_tasks_less_than(&self, key: &TaskQueueKey, ack_level: i64) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(queue) = inner.matching_tasks.get_mut(key) {
            let ids: Vec<i64> = queue.range(..=ack_level).map(|(id, _)| *id).collect();
            for id in ids {
                queue.remove(&id);
            }
        }
        Ok(())
    }

    async fn get_task_queue_user_data(
        &self,
        namespace_id: Uuid,
        name: &str,
        task_type: TaskQueueType,
    ) -> Result<TaskQueueUserData> {
        Ok(self
            .inner
            .read()
            .user_data
            .get(&(namespace_id, name.to_string(), task_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_task_queue_user_data(
        &self,
        namespace_id: Uuid,
        name: &str,
        task_type: TaskQueueType,
        mut data: TaskQueueUserData,
        expected_version: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (namespace_id, name.to_string(), task_type);
        let stored_version = inner.user_data.get(&key).map(|d| d.version).unwrap_or(0);
        if stored_version != expected_version {
            return Err(StoreError::ConditionFailed(format!(
                "task queue user data version {stored_version} != expected {expected_version}"
            )));
        }
        data.version = stored_version + 1;
        inner.user_data.insert(key, data);
        Ok(())
    }
}
