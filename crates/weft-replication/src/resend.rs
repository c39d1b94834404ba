// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resend protocol support.
//!
//! When a task references events `(id, version)` the receiver doesn't have,
//! it asks the source cluster to resend the missing range, bounded to a
//! maximum number of batches. The progress cache remembers recent requests
//! per run so concurrent tasks missing the same events don't trigger
//! duplicate resends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use weft_common::tasks::WorkflowKey;

use crate::error::Result;

/// Fetches missing event batches from the source cluster and applies them
/// locally. The real implementation drives the cross-cluster history fetch;
/// tests use a recording stub.
#[async_trait]
pub trait EventsResender: Send + Sync {
    /// Resend events of `workflow_key` up to `(end_event_id, end_version)`
    /// exclusive, transferring at most `max_batches` batches.
    async fn resend(
        &self,
        workflow_key: &WorkflowKey,
        end_event_id: i64,
        end_version: i64,
        max_batches: usize,
    ) -> Result<()>;
}

#[derive(Clone)]
struct ProgressEntry {
    event_id: i64,
    version: i64,
    requested_at: Instant,
}

/// Deduplicates resend requests per run.
pub struct ProgressCache {
    max_size: usize,
    ttl: Duration,
    entries: Mutex<HashMap<WorkflowKey, ProgressEntry>>,
}

impl ProgressCache {
    /// Create a cache bounded to `max_size` runs with entry TTL `ttl`.
    pub fn new(max_size: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_size: max_size.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Record an intended resend. Returns false when an equivalent request
    /// was made recently (the caller should skip the resend and just retry).
    pub fn try_record(&self, workflow_key: &WorkflowKey, event_id: i64, version: i64) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(workflow_key) {
            let fresh = entry.requested_at.elapsed() < self.ttl;
            let covers = entry.version > version
                || (entry.version == version && entry.event_id >= event_id);
            if fresh && covers {
                return false;
            }
        }
        if entries.len() >= self.max_size && !entries.contains_key(workflow_key) {
            // drop the stalest entry to stay bounded
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.requested_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            workflow_key.clone(),
            ProgressEntry {
                event_id,
                version,
                requested_at: Instant::now(),
            },
        );
        true
    }

    /// Number of tracked runs.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
