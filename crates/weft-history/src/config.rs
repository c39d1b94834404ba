// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.
//!
//! A thin typed view over the dynamic config store. Getters resolve on every
//! call so operator changes take effect without restarts; per-shard and
//! per-namespace overrides apply through the constraint scope.

use std::sync::Arc;
use std::time::Duration;

use weft_common::config::{keys, Constraints, DynamicConfig};

/// Typed configuration for the history engine.
#[derive(Clone)]
pub struct HistoryConfig {
    store: Arc<DynamicConfig>,
    /// Static shard count of the cluster. Never changes at runtime.
    pub num_history_shards: i32,
}

impl HistoryConfig {
    /// Wrap the dynamic config store.
    pub fn new(store: Arc<DynamicConfig>, num_history_shards: i32) -> Self {
        Self {
            store,
            num_history_shards,
        }
    }

    /// Shard reacquire sweep interval.
    pub fn acquire_shard_interval(&self) -> Duration {
        self.store.get_duration(
            keys::ACQUIRE_SHARD_INTERVAL,
            &Constraints::default(),
            keys::ACQUIRE_SHARD_INTERVAL_DEFAULT,
        )
    }

    /// Concurrent shard acquisitions per sweep.
    pub fn acquire_shard_concurrency(&self) -> usize {
        self.store
            .get_int("history.acquireShardConcurrency", &Constraints::default(), 10)
            .max(1) as usize
    }

    /// How long a lost shard may linger awaiting confirmation.
    pub fn shard_linger_time_limit(&self) -> Duration {
        self.store.get_duration(
            "history.shardLingerTimeLimit",
            &Constraints::default(),
            Duration::ZERO,
        )
    }

    /// Per persistence call timeout inside a shard.
    pub fn shard_io_timeout(&self, shard_id: i32) -> Duration {
        self.store.get_duration(
            keys::SHARD_IO_TIMEOUT,
            &Constraints::shard(shard_id),
            keys::SHARD_IO_TIMEOUT_DEFAULT,
        )
    }

    /// Task ids reserved per shard lease renewal.
    pub fn shard_task_id_block_size(&self) -> i64 {
        self.store
            .get_int("history.shardTaskIdBlockSize", &Constraints::default(), 100_000)
            .max(1)
    }

    /// Mutable-state cache entry TTL.
    pub fn cache_ttl(&self) -> Duration {
        self.store.get_duration(
            keys::HISTORY_CACHE_TTL,
            &Constraints::default(),
            keys::HISTORY_CACHE_TTL_DEFAULT,
        )
    }

    /// Host-level cache bound in entries.
    pub fn cache_max_entries(&self) -> usize {
        self.store
            .get_int("history.cacheHostLevelMaxSize", &Constraints::default(), 128_000)
            .max(1) as usize
    }

    /// Host-level cache bound in estimated bytes.
    pub fn cache_max_bytes(&self) -> usize {
        self.store
            .get_int(
                "history.cacheHostLevelMaxSizeBytes",
                &Constraints::default(),
                256 * 1024 * 1024,
            )
            .max(1) as usize
    }

    /// Whether the cache is bounded by bytes instead of entries.
    pub fn cache_size_based_limit(&self) -> bool {
        self.store
            .get_bool("history.cacheSizeBasedLimit", &Constraints::default(), false)
    }

    /// Lock wait budget for non-user callers (tasks, replication).
    pub fn cache_non_user_lock_timeout(&self) -> Duration {
        self.store.get_duration(
            "history.cacheNonUserContextLockTimeout",
            &Constraints::default(),
            Duration::from_millis(500),
        )
    }

    /// Pending tasks per queue before slices split and readers throttle.
    pub fn queue_pending_task_critical_count(&self) -> usize {
        self.store
            .get_int(
                keys::QUEUE_PENDING_TASK_CRITICAL_COUNT,
                &Constraints::default(),
                keys::QUEUE_PENDING_TASK_CRITICAL_COUNT_DEFAULT,
            )
            .max(1) as usize
    }

    /// Pending tasks per queue at which loading stops entirely.
    pub fn queue_pending_tasks_max_count(&self) -> usize {
        self.store
            .get_int(
                keys::QUEUE_PENDING_TASKS_MAX_COUNT,
                &Constraints::default(),
                keys::QUEUE_PENDING_TASKS_MAX_COUNT_DEFAULT,
            )
            .max(1) as usize
    }

    /// Maximum predicate size before degrading to the universal predicate.
    pub fn queue_max_predicate_size(&self) -> usize {
        self.store
            .get_int("history.queueMaxPredicateSize", &Constraints::default(), 256)
            .max(1) as usize
    }

    /// Batch size for queue reads.
    pub fn queue_batch_size(&self) -> usize {
        self.store
            .get_int("history.queueBatchSize", &Constraints::default(), 100)
            .max(1) as usize
    }

    /// Attempts before an erroring task is sent to the DLQ.
    pub fn task_dlq_unexpected_error_attempts(&self) -> u32 {
        self.store
            .get_int(
                "history.TaskDLQUnexpectedErrorAttempts",
                &Constraints::default(),
                70,
            )
            .max(1) as u32
    }

    /// Substring pattern that sends a task error straight to the DLQ.
    pub fn task_dlq_error_pattern(&self) -> String {
        self.store
            .get_string("history.TaskDLQErrorPattern", &Constraints::default(), "")
    }

    /// Whether internal errors are DLQ'd rather than retried forever.
    pub fn task_dlq_internal_errors(&self) -> bool {
        self.store
            .get_bool("history.TaskDLQInternalErrors", &Constraints::default(), false)
    }

    /// Delay before a standby task actively requests an event resend.
    pub fn standby_task_missing_events_resend_delay(&self, namespace: &str) -> Duration {
        self.store.get_duration(
            "history.standbyTaskMissingEventsResendDelay",
            &Constraints::namespace(namespace),
            Duration::from_secs(10 * 60),
        )
    }

    /// Delay after which a standby task still missing events is discarded.
    pub fn standby_task_missing_events_discard_delay(&self, namespace: &str) -> Duration {
        self.store.get_duration(
            "history.standbyTaskMissingEventsDiscardDelay",
            &Constraints::namespace(namespace),
            Duration::from_secs(15 * 60),
        )
    }

    /// Buffered event count cap per run.
    pub fn maximum_buffered_events_batch(&self) -> usize {
        self.store
            .get_int("limit.maximumBufferedEventsBatch", &Constraints::default(), 100)
            .max(1) as usize
    }

    /// Buffered event byte cap per run.
    pub fn maximum_buffered_events_size_bytes(&self) -> usize {
        self.store
            .get_int(
                "limit.maximumBufferedEventsSizeInBytes",
                &Constraints::default(),
                2 * 1024 * 1024,
            )
            .max(1) as usize
    }

    /// Pending activity cap per run.
    pub fn pending_activities_limit(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                "limit.numPendingActivities",
                &Constraints::namespace(namespace),
                2000,
            )
            .max(1) as usize
    }

    /// Pending child workflow cap per run.
    pub fn pending_child_executions_limit(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                "limit.numPendingChildExecutions",
                &Constraints::namespace(namespace),
                2000,
            )
            .max(1) as usize
    }

    /// Pending signal cap per run.
    pub fn pending_signals_limit(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                "limit.numPendingSignals",
                &Constraints::namespace(namespace),
                2000,
            )
            .max(1) as usize
    }

    /// Pending cancel-request cap per run.
    pub fn pending_cancel_requests_limit(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                "limit.numPendingCancelRequests",
                &Constraints::namespace(namespace),
                2000,
            )
            .max(1) as usize
    }

    /// History byte size hard cap per run.
    pub fn history_size_limit_error(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                keys::LIMIT_HISTORY_SIZE_ERROR,
                &Constraints::namespace(namespace),
                keys::LIMIT_HISTORY_SIZE_ERROR_DEFAULT,
            )
            .max(1) as usize
    }

    /// History event count hard cap per run.
    pub fn history_count_limit_error(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                keys::LIMIT_HISTORY_COUNT_ERROR,
                &Constraints::namespace(namespace),
                keys::LIMIT_HISTORY_COUNT_ERROR_DEFAULT,
            )
            .max(1) as usize
    }

    /// Maximum events a speculative workflow task may have shipped and still
    /// be discarded without writing history.
    pub fn discard_speculative_wft_events_count(&self) -> usize {
        self.store
            .get_int(
                "history.discardSpeculativeWorkflowTaskMaximumEventsCount",
                &Constraints::default(),
                10,
            )
            .max(0) as usize
    }

    /// Cross-region event blob cache capacity.
    pub fn xdc_cache_max_size(&self) -> usize {
        self.store
            .get_int("history.xdcCacheMaxSizeBytes", &Constraints::default(), 8 * 1024 * 1024)
            .max(1) as usize
    }

    /// In-flight workflow update cap per run.
    pub fn max_in_flight_updates(&self, namespace: &str) -> usize {
        self.store
            .get_int(
                "history.maxInFlightUpdates",
                &Constraints::namespace(namespace),
                10,
            )
            .max(1) as usize
    }
}
