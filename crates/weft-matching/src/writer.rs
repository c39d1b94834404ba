// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task writer.
//!
//! Spools tasks to the partition backlog. Ids come from blocks of
//! `range_size` reserved by the partition lease: holding range N means
//! owning ids `[N*range_size, (N+1)*range_size)`. Exhausting the block
//! renews the lease with a CAS on the partition row; a CAS failure means
//! another owner took the partition and the writer is dead.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use weft_persistence::store::MatchingTaskStore;
use weft_persistence::types::{MatchingTask, TaskQueueInfo};
use weft_persistence::StoreError;

use crate::error::{MatchingError, Result};

struct WriterState {
    info: TaskQueueInfo,
    next_id: i64,
    block_end: i64,
}

/// Allocates task ids and writes task batches for one partition.
pub struct TaskWriter {
    store: Arc<dyn MatchingTaskStore>,
    range_size: i64,
    max_batch: usize,
    state: Mutex<WriterState>,
}

impl TaskWriter {
    /// Create a writer from a freshly leased partition row.
    pub fn new(
        store: Arc<dyn MatchingTaskStore>,
        info: TaskQueueInfo,
        range_size: i64,
        max_batch: usize,
    ) -> Self {
        let next_id = info.range_id * range_size;
        let block_end = (info.range_id + 1) * range_size;
        Self {
            store,
            range_size,
            max_batch: max_batch.max(1),
            state: Mutex::new(WriterState {
                info,
                next_id,
                block_end,
            }),
        }
    }

    /// The lease token the writer currently holds.
    pub fn range_id(&self) -> i64 {
        self.state.lock().info.range_id
    }

    /// Spool tasks, assigning ids from the reserved block and renewing the
    /// lease when the block runs out. Returns the assigned task ids.
    ///
    /// A renewal CAS failure surfaces as [`MatchingError::OwnershipLost`];
    /// the partition must unload and write nothing further.
    pub async fn spool(&self, mut tasks: Vec<MatchingTask>) -> Result<Vec<i64>> {
        let mut assigned = Vec::with_capacity(tasks.len());
        while !tasks.is_empty() {
            let take = tasks.len().min(self.max_batch);
            let mut batch: Vec<MatchingTask> = tasks.drain(..take).collect();

            for task in &mut batch {
                task.task_id = self.next_id().await?;
                assigned.push(task.task_id);
            }

            let (key, range_id) = {
                let state = self.state.lock();
                (state.info.key.clone(), state.info.range_id)
            };
            match self.store.create_tasks(&key, range_id, batch).await {
                Ok(()) => {}
                Err(StoreError::ConditionFailed(_)) => return Err(MatchingError::OwnershipLost),
                Err(err) => return Err(err.into()),
            }
        }
        debug!(count = assigned.len(), "tasks spooled");
        Ok(assigned)
    }

    async fn next_id(&self) -> Result<i64> {
        {
            let mut state = self.state.lock();
            if state.next_id < state.block_end {
                let id = state.next_id;
                state.next_id += 1;
                return Ok(id);
            }
        }
        self.renew_block().await?;
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        Ok(id)
    }

    /// Renew the lease: bump the partition row's range id by CAS, reserving
    /// the next id block past the previously reserved end.
    async fn renew_block(&self) -> Result<()> {
        let (mut info, expected) = {
            let state = self.state.lock();
            (state.info.clone(), state.info.range_id)
        };
        info.range_id += 1;
        match self.store.update_task_queue(info.clone(), expected).await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.info = info;
                state.next_id = state.info.range_id * self.range_size;
                state.block_end = (state.info.range_id + 1) * self.range_size;
                info!(
                    partition = %state.info.key,
                    range_id = state.info.range_id,
                    "task id block renewed"
                );
                Ok(())
            }
            Err(StoreError::ConditionFailed(_)) => Err(MatchingError::OwnershipLost),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_common::tasks::WorkflowKey;
    use weft_persistence::types::{TaskQueueKey, TaskQueueType};
    use weft_persistence::MemoryStore;

    fn queue_key() -> TaskQueueKey {
        TaskQueueKey {
            namespace_id: Uuid::new_v4(),
            name: "tq".into(),
            task_type: TaskQueueType::Activity,
            partition: 0,
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

    async fn writer_fixture(range_size: i64) -> (TaskWriter, Arc<MemoryStore>, TaskQueueKey) {
        let store = Arc::new(MemoryStore::new());
        let key = queue_key();
        let info = store.lease_task_queue(&key, "host-a").await.unwrap();
        let writer = TaskWriter::new(store.clone(), info, range_size, 10);
        (writer, store, key)
    }

    #[tokio::test]
    async fn ids_are_contiguous_within_a_block() {
        let (writer, store, key) = writer_fixture(100).await;
        let ids = writer.spool(vec![task(), task(), task()]).await.unwrap();
        assert_eq!(ids, vec![100, 101, 102]);

        let stored = store.get_tasks(&key, 0, i64::MAX, 10).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn block_exhaustion_renews_past_reserved_end() {
        let (writer, _store, _key) = writer_fixture(2).await;
        // block for range 1 is [2, 4)
        let first = writer.spool(vec![task(), task()]).await.unwrap();
        assert_eq!(first, vec![2, 3]);
        // exhausted: renewal moves to range 2, block [4, 6)
        let second = writer.spool(vec![task()]).await.unwrap();
        assert_eq!(second, vec![4]);
        assert_eq!(writer.range_id(), 2);
    }

    #[tokio::test]
    async fn renewal_after_steal_is_ownership_loss() {
        let (writer, store, key) = writer_fixture(1).await;
        writer.spool(vec![task()]).await.unwrap();

        // a competing owner takes the lease
        store.lease_task_queue(&key, "host-b").await.unwrap();

        let err = writer.spool(vec![task()]).await.unwrap_err();
        assert!(matches!(err, MatchingError::OwnershipLost));
    }
}
