// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication configuration.

use std::sync::Arc;
use std::time::Duration;

use weft_common::config::{Constraints, DynamicConfig};

/// Typed configuration for the replication subsystem.
#[derive(Clone)]
pub struct ReplicationConfig {
    store: Arc<DynamicConfig>,
}

impl ReplicationConfig {
    /// Wrap the dynamic config store.
    pub fn new(store: Arc<DynamicConfig>) -> Self {
        Self { store }
    }

    /// Whether the stream runs separate high/low priority tiers.
    pub fn tiered_processing_enabled(&self) -> bool {
        self.store.get_bool(
            "history.enableReplicationTaskTieredProcessing",
            &Constraints::default(),
            false,
        )
    }

    /// Per-shard QPS of the high priority tier.
    pub fn sender_high_priority_qps(&self) -> f64 {
        self.store.get_float(
            "history.replicationStreamSenderHighPriorityQPS",
            &Constraints::default(),
            100.0,
        )
    }

    /// Per-shard QPS of the low priority tier.
    pub fn sender_low_priority_qps(&self) -> f64 {
        self.store.get_float(
            "history.replicationStreamSenderLowPriorityQPS",
            &Constraints::default(),
            20.0,
        )
    }

    /// Cadence of sync-status frames.
    pub fn sync_status_interval(&self) -> Duration {
        self.store.get_duration(
            "history.replicationStreamSyncStatusDuration",
            &Constraints::default(),
            Duration::from_secs(1),
        )
    }

    /// Cadence of empty keep-alive frames on an idle stream.
    pub fn send_empty_task_interval(&self) -> Duration {
        self.store.get_duration(
            "history.replicationStreamSendEmptyTaskDuration",
            &Constraints::default(),
            Duration::from_secs(30),
        )
    }

    /// Event-loop restarts before the stream gives up.
    pub fn event_loop_retry_max_attempts(&self) -> u32 {
        self.store
            .get_int(
                "history.replicationStreamEventLoopRetryMaxAttempts",
                &Constraints::default(),
                100,
            )
            .max(1) as u32
    }

    /// Bounded in-flight tasks on the receiver.
    pub fn receiver_max_outstanding(&self) -> usize {
        self.store
            .get_int(
                "history.replicationReceiverMaxOutstandingTaskCount",
                &Constraints::default(),
                500,
            )
            .max(1) as usize
    }

    /// High priority apply workers per shard.
    pub fn processor_scheduler_worker_count(&self) -> usize {
        self.store
            .get_int(
                "history.replicationProcessorSchedulerWorkerCount",
                &Constraints::default(),
                4,
            )
            .max(1) as usize
    }

    /// Low priority apply workers per shard.
    pub fn processor_scheduler_worker_count_low(&self) -> usize {
        self.store
            .get_int(
                "history.replicationProcessorSchedulerWorkerCountLowPriority",
                &Constraints::default(),
                2,
            )
            .max(1) as usize
    }

    /// Maximum event batches per resend request.
    pub fn resend_max_batch_count(&self) -> usize {
        self.store
            .get_int("history.replicationResendMaxBatchCount", &Constraints::default(), 10)
            .max(1) as usize
    }

    /// Progress cache capacity.
    pub fn progress_cache_max_size(&self) -> usize {
        self.store
            .get_int("history.replicationProgressCacheMaxSize", &Constraints::default(), 4096)
            .max(1) as usize
    }

    /// Progress cache entry TTL.
    pub fn progress_cache_ttl(&self) -> Duration {
        self.store.get_duration(
            "history.replicationProgressCacheTTL",
            &Constraints::default(),
            Duration::from_secs(60),
        )
    }

    /// Apply attempts before a task dead-letters.
    pub fn apply_max_attempts(&self) -> u32 {
        self.store
            .get_int("history.replicationApplyMaxAttempts", &Constraints::default(), 5)
            .max(1) as u32
    }

    /// Stream read batch size.
    pub fn fetch_batch_size(&self) -> usize {
        self.store
            .get_int("history.replicationFetchBatchSize", &Constraints::default(), 100)
            .max(1) as usize
    }
}
