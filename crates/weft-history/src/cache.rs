// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-level mutable-state cache.
//!
//! One LRU per host, keyed by `(shard_id, namespace_id, workflow_id,
//! run_id)`, bounded either by entry count or by estimated bytes. Each entry
//! is a [`WorkflowContext`] holding the per-run lock; every reader or writer
//! of a run's mutable state goes through that lock. User-facing callers wait
//! indefinitely; task processors and replication take the lock with a bounded
//! wait and abort on timeout so a stuck run cannot wedge a whole queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use weft_common::tasks::WorkflowKey;

use crate::error::{EngineError, Result};
use crate::mutable_state::MutableState;

/// Cache key: shard plus run identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Owning shard.
    pub shard_id: i32,
    /// Namespace id.
    pub namespace_id: Uuid,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: Uuid,
}

impl CacheKey {
    /// Build a key from a shard and workflow key.
    pub fn new(shard_id: i32, workflow_key: &WorkflowKey) -> Self {
        Self {
            shard_id,
            namespace_id: workflow_key.namespace_id,
            workflow_id: workflow_key.workflow_id.clone(),
            run_id: workflow_key.run_id,
        }
    }
}

/// Who is asking for the per-run lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerType {
    /// An end-user RPC; waits as long as its deadline allows.
    User,
    /// Task processing or replication; bounded wait, abort on timeout.
    NonUser,
}

/// Cache entry: the per-run lock around optional loaded state.
pub struct WorkflowContext {
    /// Run identity.
    pub workflow_key: WorkflowKey,
    state: Arc<tokio::sync::Mutex<Option<MutableState>>>,
}

impl WorkflowContext {
    fn new(workflow_key: WorkflowKey) -> Arc<Self> {
        Arc::new(Self {
            workflow_key,
            state: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Take the per-run lock. Non-user callers abort after `non_user_timeout`.
    pub async fn lock(
        &self,
        caller: CallerType,
        non_user_timeout: Duration,
    ) -> Result<OwnedMutexGuard<Option<MutableState>>> {
        match caller {
            CallerType::User => Ok(self.state.clone().lock_owned().await),
            CallerType::NonUser => {
                tokio::time::timeout(non_user_timeout, self.state.clone().lock_owned())
                    .await
                    .map_err(|_| EngineError::LockTimeout(self.workflow_key.clone()))
            }
        }
    }
}

/// Cache sizing and expiry settings, resolved once per operation.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Bound in entries (used when `size_based` is false).
    pub max_entries: usize,
    /// Bound in estimated bytes (used when `size_based` is true).
    pub max_bytes: usize,
    /// Whether to bound by bytes instead of entries.
    pub size_based: bool,
    /// Entry TTL.
    pub ttl: Duration,
}

struct Entry {
    context: Arc<WorkflowContext>,
    last_access: Instant,
    access_seq: u64,
    estimated_bytes: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    seq: u64,
    total_bytes: usize,
}

/// The host-level mutable-state cache.
pub struct MutableStateCache {
    inner: Mutex<Inner>,
}

impl Default for MutableStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MutableStateCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Get or create the context for a run, refreshing its LRU position and
    /// evicting expired or excess entries.
    pub fn get_or_create(&self, key: CacheKey, settings: &CacheSettings) -> Arc<WorkflowContext> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.seq += 1;
        let seq = inner.seq;

        Self::evict_expired(&mut inner, now, settings.ttl);

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_access = now;
            entry.access_seq = seq;
            return entry.context.clone();
        }

        let workflow_key = WorkflowKey::new(key.namespace_id, key.workflow_id.clone(), key.run_id);
        let context = WorkflowContext::new(workflow_key);
        inner.entries.insert(
            key,
            Entry {
                context: context.clone(),
                last_access: now,
                access_seq: seq,
                estimated_bytes: std::mem::size_of::<WorkflowContext>(),
            },
        );
        inner.total_bytes += std::mem::size_of::<WorkflowContext>();

        Self::evict_excess(&mut inner, settings);
        context
    }

    /// Record the estimated footprint of a loaded run so the size-based
    /// bound can account for it.
    pub fn note_size(&self, key: &CacheKey, estimated_bytes: usize) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            let old = entry.estimated_bytes;
            entry.estimated_bytes = estimated_bytes;
            inner.total_bytes = inner.total_bytes - old + estimated_bytes;
        }
    }

    /// Drop a run from the cache (delete, conflict invalidation, unload).
    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.total_bytes -= entry.estimated_bytes;
        }
    }

    /// Drop every run of a shard (shard unload).
    pub fn invalidate_shard(&self, shard_id: i32) {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.shard_id == shard_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.estimated_bytes;
            }
        }
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(inner: &mut Inner, now: Instant, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.estimated_bytes;
            }
        }
    }

    fn evict_excess(inner: &mut Inner, settings: &CacheSettings) {
        loop {
            let over = if settings.size_based {
                inner.total_bytes > settings.max_bytes && inner.entries.len() > 1
            } else {
                inner.entries.len() > settings.max_entries
            };
            if !over {
                return;
            }
            // Evict the least recently used entry that nobody holds.
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.context) == 1)
                .min_by_key(|(_, e)| e.access_seq)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    if let Some(entry) = inner.entries.remove(&key) {
                        inner.total_bytes -= entry.estimated_bytes;
                    }
                }
                // every entry is pinned by an in-flight caller
                None => return,
            }
        }
    }
}
