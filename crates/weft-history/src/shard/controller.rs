// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The host shard controller.
//!
//! Periodically sweeps the shard space, acquiring every shard the membership
//! function assigns to this host and unloading shards it no longer owns.
//! Acquisition concurrency per sweep is bounded. A shard that lost its lease
//! may linger for a grace period before the slot is released, giving
//! in-flight work a chance to drain.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use weft_persistence::store::Store;

use crate::cache::MutableStateCache;
use crate::config::HistoryConfig;
use crate::error::Result;
use crate::shard::ShardContext;

/// Membership function: which shards belong to this host right now.
pub type ShardAssignment = Arc<dyn Fn(i32) -> bool + Send + Sync>;

/// Owns this host's shard slots.
pub struct ShardController {
    store: Arc<dyn Store>,
    config: HistoryConfig,
    owner: String,
    assignment: ShardAssignment,
    cache: Arc<MutableStateCache>,
    shards: Mutex<HashMap<i32, Arc<ShardContext>>>,
    shutdown: Arc<Notify>,
}

impl ShardController {
    /// Create a controller.
    pub fn new(
        store: Arc<dyn Store>,
        config: HistoryConfig,
        owner: impl Into<String>,
        assignment: ShardAssignment,
        cache: Arc<MutableStateCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            owner: owner.into(),
            assignment,
            cache,
            shards: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Handle used to stop the sweep loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// The context for a shard this host currently owns.
    pub fn shard(&self, shard_id: i32) -> Option<Arc<ShardContext>> {
        let shards = self.shards.lock();
        shards.get(&shard_id).filter(|s| !s.is_closed()).cloned()
    }

    /// Number of open shards.
    pub fn owned_shard_count(&self) -> usize {
        self.shards.lock().values().filter(|s| !s.is_closed()).count()
    }

    /// Spawn the acquisition sweep loop. Call on a clone of the controller
    /// handle.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(owner = %self.owner, "shard controller started");
            loop {
                self.sweep().await;
                let interval = self.config.acquire_shard_interval();
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        self.unload_all();
                        info!("shard controller stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    /// One sweep: acquire newly assigned shards, unload lost ones.
    pub async fn sweep(&self) {
        // drop shards the membership moved away or that closed themselves
        let to_unload: Vec<i32> = {
            let shards = self.shards.lock();
            shards
                .iter()
                .filter(|(id, shard)| !(self.assignment)(**id) || shard.is_closed())
                .map(|(id, _)| *id)
                .collect()
        };
        for shard_id in to_unload {
            self.unload_shard(shard_id);
        }

        // acquire what's missing, concurrency-bounded per chunk
        let missing: Vec<i32> = {
            let shards = self.shards.lock();
            (0..self.config.num_history_shards)
                .filter(|id| (self.assignment)(*id) && !shards.contains_key(id))
                .collect()
        };
        for chunk in missing.chunks(self.config.acquire_shard_concurrency()) {
            let acquisitions = chunk.iter().map(|shard_id| self.acquire_shard(*shard_id));
            for (shard_id, result) in chunk.iter().zip(futures::future::join_all(acquisitions).await)
            {
                if let Err(e) = result {
                    error!(shard_id, error = %e, "shard acquisition failed");
                }
            }
        }
    }

    async fn acquire_shard(&self, shard_id: i32) -> Result<()> {
        let context = ShardContext::acquire(
            self.store.clone(),
            self.config.clone(),
            shard_id,
            &self.owner,
        )
        .await?;
        self.shards.lock().insert(shard_id, context);
        Ok(())
    }

    /// Unload one shard: close it, drop its cached runs, release the slot.
    /// Lingers for the configured grace period when the shard closed on its
    /// own (lease loss) so in-flight work can observe the closed signal.
    pub fn unload_shard(&self, shard_id: i32) {
        let removed = self.shards.lock().remove(&shard_id);
        let Some(shard) = removed else { return };
        let linger = self.config.shard_linger_time_limit();
        let was_closed = shard.is_closed();
        shard.close();

        let cache = self.cache.clone();
        if was_closed && !linger.is_zero() {
            tokio::spawn(async move {
                tokio::time::sleep(linger).await;
                cache.invalidate_shard(shard_id);
            });
        } else {
            cache.invalidate_shard(shard_id);
        }
        info!(shard_id, "shard unloaded");
    }

    fn unload_all(&self) {
        let ids: Vec<i32> = self.shards.lock().keys().copied().collect();
        for shard_id in ids {
            self.unload_shard(shard_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::config::DynamicConfig;
    use weft_persistence::MemoryStore;

    fn controller_with(assignment: ShardAssignment) -> Arc<ShardController> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        ShardController::new(
            store,
            HistoryConfig::new(DynamicConfig::new(), 4),
            "host-a",
            assignment,
            Arc::new(MutableStateCache::new()),
        )
    }

    #[tokio::test]
    async fn sweep_acquires_assigned_shards() {
        let controller = controller_with(Arc::new(|id| id % 2 == 0));
        controller.sweep().await;
        assert_eq!(controller.owned_shard_count(), 2);
        assert!(controller.shard(0).is_some());
        assert!(controller.shard(1).is_none());
        assert!(controller.shard(2).is_some());
    }

    #[tokio::test]
    async fn sweep_unloads_unassigned_shards() {
        let assigned = Arc::new(parking_lot::Mutex::new(true));
        let flag = assigned.clone();
        let controller = controller_with(Arc::new(move |_| *flag.lock()));

        controller.sweep().await;
        assert_eq!(controller.owned_shard_count(), 4);

        *assigned.lock() = false;
        controller.sweep().await;
        assert_eq!(controller.owned_shard_count(), 0);
    }

    #[tokio::test]
    async fn closed_shards_are_reacquired_on_next_sweep() {
        let controller = controller_with(Arc::new(|_| true));
        controller.sweep().await;
        let shard = controller.shard(0).unwrap();
        let old_range = shard.range_id();
        shard.close();
        assert!(controller.shard(0).is_none());

        controller.sweep().await;
        let reacquired = controller.shard(0).unwrap();
        assert!(reacquired.range_id() > old_range);
    }
}
