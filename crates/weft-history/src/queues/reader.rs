// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue reader.
//!
//! One reader per shard and category. Each poll loads a batch from the store
//! past the read cursor, hands owned tasks to the caller for scheduling, and
//! advances the persisted ack level once tasks complete. Loading pauses when
//! pending work reaches the max count; a slice split is triggered at the
//! critical count.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use weft_common::tasks::{CategoryKind, Task, TaskCategory, TaskKey};
use weft_persistence::store::TaskStore;
use weft_persistence::types::GetHistoryTasksRequest;

use crate::error::Result;
use crate::queues::{PersistedReaderState, QueueSlice, TaskPredicate};
use crate::shard::ShardContext;

/// Reader over one category queue of one shard.
pub struct QueueReader {
    shard: Arc<ShardContext>,
    /// The category this reader drains.
    pub category: TaskCategory,
    state: Mutex<ReaderState>,
}

struct ReaderState {
    slices: Vec<QueueSlice>,
    last_persisted_ack: TaskKey,
}

impl QueueReader {
    /// Create a reader starting at the shard's persisted ack level.
    ///
    /// Restore is deliberately conservative: one universal cursor from the
    /// ack level. Split slices only drain tasks already loaded in memory, so
    /// a restored split would never be read again; re-reading from the ack
    /// reprocesses whatever a split still owned, which the at-least-once
    /// contract allows.
    pub fn new(shard: Arc<ShardContext>, category: TaskCategory) -> Self {
        let ack = shard.queue_ack_level(category);
        Self {
            shard,
            category,
            state: Mutex::new(ReaderState {
                slices: vec![QueueSlice::new(
                    ack,
                    TaskKey::maximum(),
                    TaskPredicate::Universal,
                )],
                last_persisted_ack: ack,
            }),
        }
    }

    /// Total loaded-but-unfinished tasks across slices.
    pub fn pending_count(&self) -> usize {
        self.state.lock().slices.iter().map(QueueSlice::pending_count).sum()
    }

    /// Number of live slices.
    pub fn slice_count(&self) -> usize {
        self.state.lock().slices.len()
    }

    /// Load one batch of tasks ready for scheduling.
    ///
    /// Expired scheduled tasks are dropped on read. Returns an empty batch
    /// when pending work is at the max count (back-pressure) or the store has
    /// nothing new.
    pub async fn poll_once(&self) -> Result<Vec<Task>> {
        let config = self.shard.config();
        if self.pending_count() >= config.queue_pending_tasks_max_count() {
            debug!(
                category = %self.category,
                "queue at max pending count, pausing loads"
            );
            return Ok(Vec::new());
        }

        let (cursor, max_key) = {
            let state = self.state.lock();
            // the primary slice (last one) drives store reads
            let Some(slice) = state.slices.last() else {
                return Ok(Vec::new());
            };
            (slice.read_cursor(), slice.max_key)
        };

        // scheduled tasks are only loaded once due
        let effective_max = match self.category.kind() {
            CategoryKind::Scheduled => {
                let now_bound = TaskKey::scheduled(Utc::now(), i64::MAX);
                if now_bound < max_key {
                    now_bound
                } else {
                    max_key
                }
            }
            CategoryKind::Immediate => max_key,
        };
        if cursor >= effective_max {
            return Ok(Vec::new());
        }

        let response = self
            .shard
            .with_io_timeout(self.shard.store().get_history_tasks(GetHistoryTasksRequest {
                shard_id: self.shard.shard_id,
                category: self.category,
                inclusive_min_key: cursor,
                exclusive_max_key: effective_max,
                batch_size: config.queue_batch_size(),
                next_page_token: None,
            }))
            .await?;

        // an empty read leaves the cursor alone; new tasks may still land at
        // or past it
        let new_cursor = response.tasks.last().map(|t| t.key.next()).unwrap_or(cursor);

        let mut owned = {
            let mut state = self.state.lock();
            let Some(slice) = state.slices.last_mut() else {
                return Ok(Vec::new());
            };
            slice.absorb(response.tasks, new_cursor)
        };

        // drop tasks whose expiry passed (scheduled retention of the store)
        owned.retain(|task| match task.category().kind() {
            CategoryKind::Scheduled => task.key.fire_time <= Utc::now(),
            CategoryKind::Immediate => true,
        });

        self.maybe_split();
        Ok(owned)
    }

    /// Mark one task finished, drop slices that retired with it, and advance
    /// the ack level when it moved.
    pub async fn complete_task(&self, key: TaskKey) -> Result<()> {
        {
            let mut state = self.state.lock();
            for slice in &mut state.slices {
                slice.complete(key);
            }
            Self::drop_retired_slices(&mut state);
        }
        self.advance_ack_level().await
    }

    /// Drop retired slices. The primary slice (last) always stays: its scope
    /// is open-ended, so it never retires while the queue lives.
    fn drop_retired_slices(state: &mut ReaderState) {
        if state.slices.len() <= 1 {
            return;
        }
        let primary_index = state.slices.len() - 1;
        let mut index = 0;
        state.slices.retain(|slice| {
            let keep = index == primary_index || !slice.is_retired();
            index += 1;
            keep
        });
    }

    fn live_ack_level(state: &ReaderState) -> TaskKey {
        state
            .slices
            .iter()
            .filter(|slice| !slice.is_retired())
            .map(QueueSlice::min_pending_key)
            .min()
            .unwrap_or(state.last_persisted_ack)
    }

    /// Exclusive ack level: the smallest key any live slice still has
    /// pending.
    pub fn ack_level(&self) -> TaskKey {
        Self::live_ack_level(&self.state.lock())
    }

    /// Persist the ack level and range-complete acked tasks in the store.
    async fn advance_ack_level(&self) -> Result<()> {
        let (ack, previous, persisted_state) = {
            let state = self.state.lock();
            let ack = Self::live_ack_level(&state);
            let persisted = PersistedReaderState {
                ack_level: ack,
                slices: state
                    .slices
                    .iter()
                    .filter(|slice| !slice.is_retired())
                    .map(|s| (s.min_pending_key(), s.max_key, s.predicate.clone()))
                    .collect(),
            };
            (ack, state.last_persisted_ack, persisted)
        };
        if ack <= previous {
            return Ok(());
        }

        self.shard
            .with_io_timeout(self.shard.store().range_complete_history_tasks(
                self.shard.shard_id,
                self.category,
                previous,
                ack,
            ))
            .await?;
        self.shard
            .update_queue_state(
                self.category,
                ack,
                serde_json::to_value(&persisted_state)
                    .map_err(|e| crate::error::EngineError::Internal(e.to_string()))?,
            )
            .await?;
        self.state.lock().last_persisted_ack = ack;
        debug!(category = %self.category, ack = ?ack, "queue ack level advanced");
        Ok(())
    }

    /// Split the heaviest namespace into its own slice when pending work
    /// passes the critical count.
    fn maybe_split(&self) {
        let config = self.shard.config();
        let critical = config.queue_pending_task_critical_count();
        let max_predicate = config.queue_max_predicate_size();

        let mut state = self.state.lock();
        let total: usize = state.slices.iter().map(QueueSlice::pending_count).sum();
        if total < critical {
            return;
        }
        let Some(primary) = state.slices.last_mut() else {
            return;
        };
        let heaviest: Option<Uuid> = primary
            .pending_by_namespace()
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(ns, _)| ns);
        let Some(heaviest) = heaviest else { return };

        let split = primary.split_namespaces(HashSet::from([heaviest]), max_predicate);
        info!(
            category = %self.category,
            namespace_id = %heaviest,
            moved = split.pending_count(),
            "queue slice split"
        );
        state.slices.insert(0, split);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::config::{ConfigValue, Constraints, DynamicConfig};
    use weft_common::tasks::{TaskAttributes, WorkflowKey};
    use weft_persistence::store::{Store, TaskStore};
    use weft_persistence::MemoryStore;

    use crate::config::HistoryConfig;

    async fn fixture(config: Arc<DynamicConfig>) -> (Arc<ShardContext>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let shard = ShardContext::acquire(dyn_store, HistoryConfig::new(config, 4), 1, "host-a")
            .await
            .unwrap();
        (shard, store)
    }

    fn visibility_task(ns: Uuid, id: i64) -> Task {
        Task {
            shard_id: 1,
            key: TaskKey::immediate(id),
            workflow_key: WorkflowKey::new(ns, "wf", Uuid::new_v4()),
            version: 1,
            destination: None,
            attributes: TaskAttributes::UpsertVisibility,
        }
    }

    #[tokio::test]
    async fn poll_returns_tasks_in_key_order() {
        let (shard, store) = fixture(DynamicConfig::new()).await;
        let ns = Uuid::new_v4();
        store
            .add_history_tasks(
                1,
                shard.range_id(),
                vec![visibility_task(ns, 30), visibility_task(ns, 10), visibility_task(ns, 20)],
            )
            .await
            .unwrap();

        let reader = QueueReader::new(shard, TaskCategory::Visibility);
        let tasks = reader.poll_once().await.unwrap();
        let ids: Vec<i64> = tasks.iter().map(|t| t.key.task_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(reader.pending_count(), 3);
    }

    #[tokio::test]
    async fn completion_advances_ack_and_range_completes() {
        let (shard, store) = fixture(DynamicConfig::new()).await;
        let ns = Uuid::new_v4();
        store
            .add_history_tasks(
                1,
                shard.range_id(),
                (1..=3).map(|id| visibility_task(ns, id)).collect(),
            )
            .await
            .unwrap();

        let reader = QueueReader::new(shard.clone(), TaskCategory::Visibility);
        reader.poll_once().await.unwrap();

        // completing out of order: ack stays below the still-pending task
        reader.complete_task(TaskKey::immediate(2)).await.unwrap();
        assert_eq!(reader.ack_level(), TaskKey::immediate(1));

        reader.complete_task(TaskKey::immediate(1)).await.unwrap();
        // tasks 1 and 2 are done; ack moved past them
        assert_eq!(reader.ack_level(), TaskKey::immediate(3));
        assert_eq!(shard.queue_ack_level(TaskCategory::Visibility), TaskKey::immediate(3));

        // the store no longer returns completed tasks below the ack level
        let remaining = store
            .get_history_tasks(GetHistoryTasksRequest {
                shard_id: 1,
                category: TaskCategory::Visibility,
                inclusive_min_key: TaskKey::minimum(),
                exclusive_max_key: TaskKey::maximum(),
                batch_size: 10,
                next_page_token: None,
            })
            .await
            .unwrap();
        let ids: Vec<i64> = remaining.tasks.iter().map(|t| t.key.task_id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn max_pending_count_pauses_loading() {
        let config = DynamicConfig::new();
        config.set(
            "history.queuePendingTasksMaxCount",
            Constraints::default(),
            ConfigValue::Int(2),
        );
        let (shard, store) = fixture(config).await;
        let ns = Uuid::new_v4();
        store
            .add_history_tasks(
                1,
                shard.range_id(),
                (1..=5).map(|id| visibility_task(ns, id)).collect(),
            )
            .await
            .unwrap();

        let reader = QueueReader::new(shard, TaskCategory::Visibility);
        let first = reader.poll_once().await.unwrap();
        assert!(!first.is_empty());
        // pending is at/over the cap now; next poll loads nothing
        let second = reader.poll_once().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn timers_are_not_loaded_before_fire_time() {
        let (shard, store) = fixture(DynamicConfig::new()).await;
        let ns = Uuid::new_v4();
        let future = Utc::now() + chrono::Duration::hours(1);
        let past = Utc::now() - chrono::Duration::seconds(5);
        store
            .add_history_tasks(
                1,
                shard.range_id(),
                vec![
                    Task {
                        shard_id: 1,
                        key: TaskKey::scheduled(past, 1),
                        workflow_key: WorkflowKey::new(ns, "wf", Uuid::new_v4()),
                        version: 1,
                        destination: None,
                        attributes: TaskAttributes::UserTimer { started_event_id: 5 },
                    },
                    Task {
                        shard_id: 1,
                        key: TaskKey::scheduled(future, 2),
                        workflow_key: WorkflowKey::new(ns, "wf", Uuid::new_v4()),
                        version: 1,
                        destination: None,
                        attributes: TaskAttributes::UserTimer { started_event_id: 7 },
                    },
                ],
            )
            .await
            .unwrap();

        let reader = QueueReader::new(shard, TaskCategory::Timer);
        let due = reader.poll_once().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key.task_id, 1);
    }

    #[tokio::test]
    async fn critical_count_triggers_slice_split() {
        let config = DynamicConfig::new();
        config.set(
            "history.queuePendingTaskCriticalCount",
            Constraints::default(),
            ConfigValue::Int(3),
        );
        config.set(
            "history.queueBatchSize",
            Constraints::default(),
            ConfigValue::Int(10),
        );
        let (shard, store) = fixture(config).await;
        let hot = Uuid::new_v4();
        let cold = Uuid::new_v4();
        store
            .add_history_tasks(
                1,
                shard.range_id(),
                vec![
                    visibility_task(hot, 1),
                    visibility_task(hot, 2),
                    visibility_task(hot, 3),
                    visibility_task(cold, 4),
                ],
            )
            .await
            .unwrap();

        let reader = QueueReader::new(shard, TaskCategory::Visibility);
        reader.poll_once().await.unwrap();
        assert_eq!(reader.slice_count(), 2);
    }

    #[tokio::test]
    async fn drained_split_slice_retires_and_releases_the_ack_level() {
        let config = DynamicConfig::new();
        config.set(
            "history.queuePendingTaskCriticalCount",
            Constraints::default(),
            ConfigValue::Int(3),
        );
        let (shard, store) = fixture(config).await;
        let hot = Uuid::new_v4();
        let cold = Uuid::new_v4();
        store
            .add_history_tasks(
                1,
                shard.range_id(),
                vec![
                    visibility_task(hot, 1),
                    visibility_task(hot, 2),
                    visibility_task(hot, 3),
                    visibility_task(cold, 4),
                ],
            )
            .await
            .unwrap();

        let reader = QueueReader::new(shard.clone(), TaskCategory::Visibility);
        reader.poll_once().await.unwrap();
        assert_eq!(reader.slice_count(), 2);

        // drain the moved (hot) tasks: the split slice retires and is
        // dropped instead of pinning the ack at its frozen cursor
        for id in 1..=3 {
            reader.complete_task(TaskKey::immediate(id)).await.unwrap();
        }
        assert_eq!(reader.slice_count(), 1);

        // the primary slice keeps draining; the ack level moves past every
        // completed task, not just past the split point
        reader.complete_task(TaskKey::immediate(4)).await.unwrap();
        assert_eq!(reader.ack_level(), TaskKey::immediate(5));
        assert_eq!(
            shard.queue_ack_level(TaskCategory::Visibility),
            TaskKey::immediate(5)
        );

        // everything acked was range-completed in the store
        let remaining = store
            .get_history_tasks(GetHistoryTasksRequest {
                shard_id: 1,
                category: TaskCategory::Visibility,
                inclusive_min_key: TaskKey::minimum(),
                exclusive_max_key: TaskKey::maximum(),
                batch_size: 10,
                next_page_token: None,
            })
            .await
            .unwrap();
        assert!(remaining.tasks.is_empty());

        // new work after the split still reaches the reader through the
        // primary slice, including the previously split namespace
        store
            .add_history_tasks(1, shard.range_id(), vec![visibility_task(hot, 6)])
            .await
            .unwrap();
        let tasks = reader.poll_once().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].key.task_id, 6);
        reader.complete_task(TaskKey::immediate(6)).await.unwrap();
        assert_eq!(reader.ack_level(), TaskKey::immediate(7));
    }
}
