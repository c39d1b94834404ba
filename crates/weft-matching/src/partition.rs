// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The physical partition manager.
//!
//! One manager owns one partition at a time. Start leases the partition row;
//! a failed lease means another host owns it and the manager gives up
//! immediately. Any later write that loses the range-id CAS unloads the
//! manager, and an unloaded manager writes nothing further: the final
//! ack-level flush is attempted only while ownership is still held, and a
//! CAS failure there is silently skipped because the new owner supersedes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use weft_persistence::store::MatchingTaskStore;
use weft_persistence::types::{MatchingTask, TaskQueueInfo, TaskQueueKey};
use weft_persistence::StoreError;

use crate::backlog::{BacklogReader, BacklogStats};
use crate::config::MatchingConfig;
use crate::error::{MatchingError, Result};
use crate::forwarder::{parent_partition, ForwardDecisionInput, ForwardPolicy, ForwardTarget};
use crate::matcher::{MatchKind, MatchedTask, Matcher};
use crate::writer::TaskWriter;

/// How an added task was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTaskResult {
    /// Handed directly to a waiting poller; nothing persisted.
    SyncMatched,
    /// Forwarded to the parent partition.
    Forwarded,
    /// Written to the backlog.
    Spooled,
}

/// Manager of one physical task-queue partition.
pub struct PartitionManager {
    /// Partition identity.
    pub key: TaskQueueKey,
    store: Arc<dyn MatchingTaskStore>,
    config: MatchingConfig,
    namespace_name: String,
    matcher: Matcher,
    writer: TaskWriter,
    backlog: BacklogReader,
    forward_target: Option<Arc<dyn ForwardTarget>>,
    unloaded: AtomicBool,
    ownership_lost: AtomicBool,
    last_poller_at: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
}

impl PartitionManager {
    /// Lease the partition and build the manager. A lease failure gives up
    /// immediately.
    pub async fn start(
        store: Arc<dyn MatchingTaskStore>,
        config: MatchingConfig,
        key: TaskQueueKey,
        namespace_name: impl Into<String>,
        owner: &str,
        forward_target: Option<Arc<dyn ForwardTarget>>,
    ) -> Result<Arc<Self>> {
        let namespace_name = namespace_name.into();
        let info: TaskQueueInfo = store.lease_task_queue(&key, owner).await?;
        info!(partition = %key, range_id = info.range_id, "partition leased");

        let range_size = config.range_size(&namespace_name, &key.name);
        let max_batch = config.max_task_batch_size(&namespace_name, &key.name);
        let writer = TaskWriter::new(store.clone(), info.clone(), range_size, max_batch);
        let backlog = BacklogReader::new(
            key.clone(),
            store.clone(),
            info.ack_level,
            config.get_tasks_batch_size(),
            config.get_tasks_reload_at(),
        );
        Ok(Arc::new(Self {
            key,
            store,
            config,
            namespace_name,
            matcher: Matcher::new(),
            writer,
            backlog,
            forward_target,
            unloaded: AtomicBool::new(false),
            ownership_lost: AtomicBool::new(false),
            last_poller_at: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }))
    }

    /// Whether this manager still owns and serves the partition.
    pub fn is_active(&self) -> bool {
        !self.unloaded.load(Ordering::SeqCst)
    }

    /// Backlog statistics for scaling decisions and describe.
    pub fn backlog_stats(&self) -> BacklogStats {
        self.backlog.stats()
    }

    /// Number of currently parked pollers.
    pub fn waiting_pollers(&self) -> usize {
        self.matcher.waiting_pollers()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(MatchingError::Unloaded);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Add task
    // ------------------------------------------------------------------

    /// Dispatch a task: sync-match, then forward, then spool.
    pub async fn add_task(&self, task: MatchingTask) -> Result<AddTaskResult> {
        self.ensure_active()?;
        self.touch();
        self.backlog.note_task_added();

        // 1. sync-match a waiting poller
        let task = match self.matcher.offer(task, MatchKind::Sync) {
            None => return Ok(AddTaskResult::SyncMatched),
            Some(task) => task,
        };

        // 2. forward toward the root when policy and target allow
        if let Some(target) = &self.forward_target {
            let fan_out = self.config.forwarder_max_children_per_node();
            if let Some(parent) = parent_partition(self.key.partition, fan_out) {
                let policy = ForwardPolicy {
                    backlog_negligible_age: self.config.backlog_negligible_age(),
                    max_wait_for_poller: self.config.max_wait_for_poller_before_fwd(),
                };
                let stats = self.backlog.stats();
                let input = ForwardDecisionInput {
                    partition: self.key.partition,
                    backlog_age: (stats.approximate_count > 0).then_some(stats.approximate_age),
                    last_local_poller: *self.last_poller_at.lock(),
                };
                if policy.should_forward(&input) {
                    let parent_key = TaskQueueKey {
                        partition: parent,
                        ..self.key.clone()
                    };
                    match target.forward_task(parent_key, task.clone()).await {
                        Ok(true) => return Ok(AddTaskResult::Forwarded),
                        Ok(false) => {}
                        Err(e) => {
                            debug!(partition = %self.key, error = %e, "forward failed, spooling");
                        }
                    }
                }
            }
        }

        // 3. spool to the backlog
        match self.writer.spool(vec![task]).await {
            Ok(_) => Ok(AddTaskResult::Spooled),
            Err(MatchingError::OwnershipLost) => {
                self.note_ownership_lost();
                self.unload().await;
                Err(MatchingError::OwnershipLost)
            }
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Poll
    // ------------------------------------------------------------------

    /// Serve one poller: drain the backlog first, then park on the matcher
    /// up to `timeout`.
    pub async fn poll(&self, build_id: Option<String>, timeout: Duration) -> Result<MatchedTask> {
        self.ensure_active()?;
        self.touch();
        *self.last_poller_at.lock() = Some(Instant::now());

        if let Some(task) = self.backlog.next_task().await? {
            return Ok(MatchedTask {
                task,
                kind: MatchKind::Backlog,
            });
        }
        self.matcher.poll(build_id, timeout).await
    }

    /// Finish a backlog-delivered task, advancing the ack level.
    pub async fn complete_task(&self, task_id: i64) -> Result<()> {
        self.touch();
        self.backlog.complete_task(task_id).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn note_ownership_lost(&self) {
        self.ownership_lost.store(true, Ordering::SeqCst);
    }

    /// Unload the partition. The final ack-level flush is written only while
    /// ownership is still held; a CAS failure is skipped, the new owner
    /// supersedes it.
    pub async fn unload(&self) {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(partition = %self.key, "partition unloading");
        if self.ownership_lost.load(Ordering::SeqCst) {
            return;
        }
        let info = TaskQueueInfo {
            key: self.key.clone(),
            range_id: self.writer.range_id(),
            ack_level: self.backlog.acks.ack_level(),
            updated_at: chrono::Utc::now(),
        };
        match self
            .store
            .update_task_queue(info, self.writer.range_id())
            .await
        {
            Ok(()) => debug!(partition = %self.key, "final ack level written"),
            Err(StoreError::ConditionFailed(_)) => {
                warn!(partition = %self.key, "lease moved, skipping final ack update");
            }
            Err(e) => warn!(partition = %self.key, error = %e, "final ack update failed"),
        }
    }

    /// Unload when the partition has seen no pollers and no tasks for the
    /// idle window. Returns true when the partition unloaded.
    pub async fn idle_check(&self) -> bool {
        if !self.is_active() {
            return true;
        }
        let idle_for = self.last_activity.lock().elapsed();
        if idle_for >= self.config.max_task_queue_idle_time()
            && self.matcher.waiting_pollers() == 0
        {
            self.unload().await;
            return true;
        }
        false
    }

    /// The namespace name the partition belongs to.
    pub fn namespace_name(&self) -> &str {
        &self.namespace_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_common::config::{ConfigValue, Constraints, DynamicConfig};
    use weft_common::tasks::WorkflowKey;
    use weft_persistence::types::TaskQueueType;
    use weft_persistence::MemoryStore;

    fn queue_key(partition: i32) -> TaskQueueKey {
        TaskQueueKey {
            namespace_id: Uuid::new_v4(),
            name: "tq".into(),
            task_type: TaskQueueType::Workflow,
            partition,
        }
    }

    fn task() -> MatchingTask {
        MatchingTask {
            task_id: 0,
            workflow_key: WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4()),
            scheduled_event_id: 3,
            expiry: None,
            assigned_build_id: None,
        }
    }

    async fn manager(
        store: Arc<MemoryStore>,
        dyn_config: Arc<DynamicConfig>,
        partition: i32,
    ) -> Arc<PartitionManager> {
        PartitionManager::start(
            store,
            MatchingConfig::new(dyn_config),
            queue_key(partition),
            "ns1",
            "host-a",
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn add_without_pollers_spools() {
        let store = Arc::new(MemoryStore::new());
        let partition = manager(store.clone(), DynamicConfig::new(), 0).await;
        let result = partition.add_task(task()).await.unwrap();
        assert_eq!(result, AddTaskResult::Spooled);

        // the spooled task is served to the next poller from the backlog
        let matched = partition
            .poll(None, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(matched.kind, MatchKind::Backlog);
        partition.complete_task(matched.task.task_id).await.unwrap();
    }

    #[tokio::test]
    async fn add_with_parked_poller_sync_matches() {
        let store = Arc::new(MemoryStore::new());
        let partition = manager(store.clone(), DynamicConfig::new(), 0).await;

        let poller = {
            let partition = partition.clone();
            tokio::spawn(async move { partition.poll(None, Duration::from_secs(5)).await })
        };
        while partition.waiting_pollers() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let result = partition.add_task(task()).await.unwrap();
        assert_eq!(result, AddTaskResult::SyncMatched);
        let matched = poller.await.unwrap().unwrap();
        assert_eq!(matched.kind, MatchKind::Sync);

        // nothing was persisted
        let spooled = store
            .get_tasks(&partition.key, 0, i64::MAX, 10)
            .await
            .unwrap();
        assert!(spooled.is_empty());
    }

    #[tokio::test]
    async fn unloaded_partition_refuses_work() {
        let store = Arc::new(MemoryStore::new());
        let partition = manager(store, DynamicConfig::new(), 0).await;
        partition.unload().await;
        assert!(!partition.is_active());
        assert!(matches!(
            partition.add_task(task()).await,
            Err(MatchingError::Unloaded)
        ));
        assert!(matches!(
            partition.poll(None, Duration::from_millis(10)).await,
            Err(MatchingError::Unloaded)
        ));
    }

    #[tokio::test]
    async fn idle_partition_unloads_and_writes_final_ack() {
        let config = DynamicConfig::new();
        config.set(
            "matching.maxTaskQueueIdleTime",
            Constraints::default(),
            ConfigValue::Duration(Duration::from_millis(10)),
        );
        let store = Arc::new(MemoryStore::new());
        let partition = manager(store.clone(), config, 0).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(partition.idle_check().await);
        assert!(!partition.is_active());
    }
}
