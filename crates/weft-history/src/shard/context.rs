// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-shard context.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use weft_common::tasks::{Task, TaskCategory, TaskKey};
use weft_persistence::store::{ShardStore, Store};
use weft_persistence::types::ShardInfo;
use weft_persistence::StoreError;

use crate::config::HistoryConfig;
use crate::error::{EngineError, Result};

struct LeaseState {
    info: ShardInfo,
    // next task id to hand out and the exclusive end of the reserved block
    task_id_cursor: i64,
    task_id_block_end: i64,
}

/// Owned handle to one shard.
///
/// All engine writes for the shard flow through this context: it carries the
/// lease token, allocates task ids, wraps every persistence call in the
/// shard IO timeout, and closes itself on ownership loss.
pub struct ShardContext {
    /// Shard id.
    pub shard_id: i32,
    store: Arc<dyn Store>,
    config: HistoryConfig,
    lease: Mutex<LeaseState>,
    closed_tx: watch::Sender<bool>,
}

impl ShardContext {
    /// Acquire the shard: read-or-create the row, bump `range_id` by CAS,
    /// and reserve the task-id block of the new range.
    pub async fn acquire(
        store: Arc<dyn Store>,
        config: HistoryConfig,
        shard_id: i32,
        owner: &str,
    ) -> Result<Arc<Self>> {
        let mut info = store.get_or_create_shard(shard_id, owner).await?;
        let previous_range = info.range_id;
        info.range_id += 1;
        info.owner = owner.to_string();
        info.updated_at = Utc::now();
        store.update_shard(info.clone(), previous_range).await?;

        let block_size = config.shard_task_id_block_size();
        let (closed_tx, _) = watch::channel(false);
        let context = Arc::new(Self {
            shard_id,
            store,
            config,
            lease: Mutex::new(LeaseState {
                task_id_cursor: info.range_id * block_size,
                task_id_block_end: (info.range_id + 1) * block_size,
                info,
            }),
            closed_tx,
        });
        info!(shard_id, range_id = context.range_id(), "shard acquired");
        Ok(context)
    }

    /// The lease token currently held.
    pub fn range_id(&self) -> i64 {
        self.lease.lock().info.range_id
    }

    /// Whether the context has been closed (ownership lost or unloaded).
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Receiver that flips to `true` when the shard closes. Long-running
    /// operations select on it to abort on unload.
    pub fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Close the shard. Idempotent. In-flight operations observe the closed
    /// signal and abort with `ShardClosed`/`Canceled`.
    pub fn close(&self) {
        if !self.is_closed() {
            warn!(shard_id = self.shard_id, "shard closing");
            let _ = self.closed_tx.send(true);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::ShardClosed(self.shard_id));
        }
        Ok(())
    }

    /// Run a store call under the shard IO timeout, translating ownership
    /// loss into a shard close.
    pub async fn with_io_timeout<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        self.ensure_open()?;
        let timeout = self.config.shard_io_timeout(self.shard_id);
        let result = match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "shard {} io timeout after {timeout:?}",
                self.shard_id
            ))),
        };
        match result {
            Err(StoreError::ShardOwnershipLost { .. }) => {
                self.close();
                Err(EngineError::ShardOwnershipLost(self.shard_id))
            }
            other => other.map_err(EngineError::from),
        }
    }

    // ------------------------------------------------------------------
    // Task id allocation
    // ------------------------------------------------------------------

    /// Allocate one task id, renewing the lease when the block is exhausted.
    pub async fn next_task_id(&self) -> Result<i64> {
        self.ensure_open()?;
        {
            let mut lease = self.lease.lock();
            if lease.task_id_cursor < lease.task_id_block_end {
                let id = lease.task_id_cursor;
                lease.task_id_cursor += 1;
                return Ok(id);
            }
        }
        self.renew_lease().await?;
        let mut lease = self.lease.lock();
        let id = lease.task_id_cursor;
        lease.task_id_cursor += 1;
        Ok(id)
    }

    /// Assign keys to a batch of tasks: monotone ids, fire time preserved
    /// for scheduled categories.
    pub async fn assign_task_keys(&self, tasks: &mut [Task]) -> Result<()> {
        for task in tasks.iter_mut() {
            let id = self.next_task_id().await?;
            task.shard_id = self.shard_id;
            task.key = match task.category().kind() {
                weft_common::tasks::CategoryKind::Scheduled => {
                    TaskKey::scheduled(task.key.fire_time, id)
                }
                weft_common::tasks::CategoryKind::Immediate => TaskKey::immediate(id),
            };
        }
        Ok(())
    }

    /// Renew the lease: bump `range_id` by CAS and move to the next task-id
    /// block. Ownership loss closes the shard.
    pub async fn renew_lease(&self) -> Result<()> {
        self.ensure_open()?;
        let (mut info, expected) = {
            let lease = self.lease.lock();
            (lease.info.clone(), lease.info.range_id)
        };
        info.range_id += 1;
        info.updated_at = Utc::now();

        let timeout = self.config.shard_io_timeout(self.shard_id);
        let result = match tokio::time::timeout(
            timeout,
            self.store.update_shard(info.clone(), expected),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout("lease renewal timed out".into())),
        };
        if let Err(err) = result {
            if matches!(err, StoreError::ShardOwnershipLost { .. }) {
                self.close();
                return Err(EngineError::ShardOwnershipLost(self.shard_id));
            }
            return Err(err.into());
        }

        let block_size = self.config.shard_task_id_block_size();
        let mut lease = self.lease.lock();
        lease.info = info;
        lease.task_id_cursor = lease.info.range_id * block_size;
        lease.task_id_block_end = (lease.info.range_id + 1) * block_size;
        info!(
            shard_id = self.shard_id,
            range_id = lease.info.range_id,
            "shard lease renewed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue progress
    // ------------------------------------------------------------------

    /// Exclusive ack level of a category queue.
    pub fn queue_ack_level(&self, category: TaskCategory) -> TaskKey {
        self.lease
            .lock()
            .info
            .queue_ack_levels
            .get(&category)
            .copied()
            .unwrap_or_else(TaskKey::minimum)
    }

    /// Persist a new ack level (and reader state) for a category queue.
    /// Ownership loss closes the shard and the update is not applied.
    pub async fn update_queue_state(
        &self,
        category: TaskCategory,
        ack_level: TaskKey,
        reader_state: serde_json::Value,
    ) -> Result<()> {
        self.ensure_open()?;
        let (mut info, expected) = {
            let lease = self.lease.lock();
            (lease.info.clone(), lease.info.range_id)
        };
        info.queue_ack_levels.insert(category, ack_level);
        info.queue_states.insert(category, reader_state);

        match self.store.update_shard(info.clone(), expected).await {
            Ok(()) => {
                self.lease.lock().info = info;
                Ok(())
            }
            Err(StoreError::ShardOwnershipLost { .. }) => {
                self.close();
                Err(EngineError::ShardOwnershipLost(self.shard_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stored reader state for a category, if any.
    pub fn queue_reader_state(&self, category: TaskCategory) -> Option<serde_json::Value> {
        self.lease.lock().info.queue_states.get(&category).cloned()
    }

    /// The store behind this shard.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Engine configuration.
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::config::DynamicConfig;
    use weft_common::tasks::{TaskAttributes, WorkflowKey};
    use weft_persistence::MemoryStore;

    fn config() -> HistoryConfig {
        HistoryConfig::new(DynamicConfig::new(), 4)
    }

    async fn acquire(store: &Arc<MemoryStore>, shard_id: i32) -> Arc<ShardContext> {
        let store: Arc<dyn Store> = store.clone();
        ShardContext::acquire(store, config(), shard_id, "host-a")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acquisition_bumps_range_id() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(&store, 1).await;
        assert_eq!(shard.range_id(), 1);

        // a competing host acquires; the stored range moves past ours
        let other = acquire(&store, 1).await;
        assert_eq!(other.range_id(), 2);
    }

    #[tokio::test]
    async fn task_ids_are_monotone_within_and_across_blocks() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(&store, 1).await;

        let block = shard.config().shard_task_id_block_size();
        let first = shard.next_task_id().await.unwrap();
        assert_eq!(first, shard.range_id() * block);
        let second = shard.next_task_id().await.unwrap();
        assert_eq!(second, first + 1);

        // exhaust the block; renewal moves past the previously reserved end
        {
            let mut lease = shard.lease.lock();
            lease.task_id_cursor = lease.task_id_block_end;
        }
        let after_renewal = shard.next_task_id().await.unwrap();
        assert!(after_renewal >= 2 * block);
        assert!(after_renewal > second);
    }

    #[tokio::test]
    async fn ownership_loss_closes_the_shard() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(&store, 1).await;
        // competing host takes the lease
        let _other = acquire(&store, 1).await;

        let err = shard.renew_lease().await.unwrap_err();
        assert!(matches!(err, EngineError::ShardOwnershipLost(1)));
        assert!(shard.is_closed());

        // closed shards refuse further work
        let err = shard.next_task_id().await.unwrap_err();
        assert!(matches!(err, EngineError::ShardClosed(1)));
    }

    #[tokio::test]
    async fn queue_state_survives_via_store() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(&store, 1).await;
        let ack = TaskKey::immediate(42);
        shard
            .update_queue_state(TaskCategory::Transfer, ack, serde_json::json!({"cursor": 42}))
            .await
            .unwrap();
        assert_eq!(shard.queue_ack_level(TaskCategory::Transfer), ack);

        // a new acquisition observes the persisted progress
        let reacquired = acquire(&store, 1).await;
        assert_eq!(reacquired.queue_ack_level(TaskCategory::Transfer), ack);
        assert_eq!(
            reacquired.queue_reader_state(TaskCategory::Transfer),
            Some(serde_json::json!({"cursor": 42}))
        );
    }

    #[tokio::test]
    async fn assign_task_keys_preserves_fire_time() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(&store, 1).await;
        let fire_time = Utc::now() + chrono::Duration::minutes(5);
        let mut tasks = vec![Task {
            shard_id: 0,
            key: TaskKey::scheduled(fire_time, 0),
            workflow_key: WorkflowKey::new(uuid::Uuid::new_v4(), "wf", uuid::Uuid::new_v4()),
            version: 1,
            destination: None,
            attributes: TaskAttributes::UserTimer { started_event_id: 5 },
        }];
        shard.assign_task_keys(&mut tasks).await.unwrap();
        assert_eq!(tasks[0].key.fire_time, fire_time);
        assert!(tasks[0].key.task_id > 0);
        assert_eq!(tasks[0].shard_id, 1);
    }
}
