// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching configuration.

use std::sync::Arc;
use std::time::Duration;

use weft_common::config::{keys, Constraints, DynamicConfig};

/// Typed configuration for the matching subsystem.
#[derive(Clone)]
pub struct MatchingConfig {
    store: Arc<DynamicConfig>,
}

impl MatchingConfig {
    /// Wrap the dynamic config store.
    pub fn new(store: Arc<DynamicConfig>) -> Self {
        Self { store }
    }

    fn scope(namespace: &str, task_queue: &str) -> Constraints {
        Constraints::task_queue(namespace, task_queue)
    }

    /// Task ids reserved per lease renewal.
    pub fn range_size(&self, namespace: &str, task_queue: &str) -> i64 {
        self.store
            .get_int(
                "matching.rangeSize",
                &Self::scope(namespace, task_queue),
                100_000,
            )
            .max(1)
    }

    /// Maximum tasks written per store batch.
    pub fn max_task_batch_size(&self, namespace: &str, task_queue: &str) -> usize {
        self.store
            .get_int(
                "matching.maxTaskBatchSize",
                &Self::scope(namespace, task_queue),
                100,
            )
            .max(1) as usize
    }

    /// Worker long-poll duration.
    pub fn long_poll_expiration(&self) -> Duration {
        self.store.get_duration(
            keys::MATCHING_LONG_POLL_EXPIRATION,
            &Constraints::default(),
            keys::MATCHING_LONG_POLL_EXPIRATION_DEFAULT,
        )
    }

    /// User-data long-poll duration.
    pub fn get_user_data_long_poll_timeout(&self) -> Duration {
        self.store.get_duration(
            "matching.getUserDataLongPollTimeout",
            &Constraints::default(),
            Duration::from_secs(4 * 60 + 50),
        )
    }

    /// How long an add-task waits for a sync match before falling through.
    pub fn sync_match_wait(&self, namespace: &str, task_queue: &str) -> Duration {
        self.store.get_duration(
            "matching.syncMatchWaitDuration",
            &Self::scope(namespace, task_queue),
            Duration::from_millis(200),
        )
    }

    /// Fan-out of the partition forwarding tree.
    pub fn forwarder_max_children_per_node(&self) -> i32 {
        self.store
            .get_int(
                "matching.forwarderMaxChildrenPerNode",
                &Constraints::default(),
                20,
            )
            .max(1) as i32
    }

    /// Backlog age below which forwarding is still allowed.
    pub fn backlog_negligible_age(&self) -> Duration {
        self.store.get_duration(
            "matching.backlogNegligibleAge",
            &Constraints::default(),
            Duration::from_secs(5),
        )
    }

    /// Wait without a local poller before forwarding resumes.
    pub fn max_wait_for_poller_before_fwd(&self) -> Duration {
        self.store.get_duration(
            "matching.maxWaitForPollerBeforeFwd",
            &Constraints::default(),
            Duration::from_millis(200),
        )
    }

    /// Backlog read batch size.
    pub fn get_tasks_batch_size(&self) -> usize {
        self.store
            .get_int("matching.getTasksBatchSize", &Constraints::default(), 1000)
            .max(1) as usize
    }

    /// Remaining buffered tasks at which the next batch is loaded.
    pub fn get_tasks_reload_at(&self) -> usize {
        self.store
            .get_int("matching.getTasksReloadAt", &Constraints::default(), 100)
            .max(1) as usize
    }

    /// Idle time after which a partition unloads.
    pub fn max_task_queue_idle_time(&self) -> Duration {
        self.store.get_duration(
            "matching.maxTaskQueueIdleTime",
            &Constraints::default(),
            Duration::from_secs(5 * 60),
        )
    }

    /// Maximum assignment rules per family.
    pub fn max_assignment_rules(&self) -> usize {
        self.store
            .get_int("matching.versionAssignmentRuleLimit", &Constraints::default(), 100)
            .max(1) as usize
    }

    /// Maximum redirect rules per family.
    pub fn max_redirect_rules(&self) -> usize {
        self.store
            .get_int("matching.versionRedirectRuleLimit", &Constraints::default(), 500)
            .max(1) as usize
    }

    /// Maximum redirect chain length.
    pub fn max_redirect_chain(&self) -> usize {
        self.store
            .get_int("matching.versionRedirectRuleChainLimit", &Constraints::default(), 50)
            .max(1) as usize
    }

    /// How long deleted rules keep their tombstones.
    pub fn deleted_rule_retention(&self) -> Duration {
        self.store.get_duration(
            "matching.deletedRuleRetentionTime",
            &Constraints::default(),
            Duration::from_secs(14 * 24 * 60 * 60),
        )
    }

    /// Grace period during which drainage visibility data is considered
    /// stale.
    pub fn drainage_visibility_grace_period(&self) -> Duration {
        self.store.get_duration(
            "matching.versionDrainageStatusVisibilityGracePeriod",
            &Constraints::default(),
            Duration::from_secs(3 * 60),
        )
    }

    /// Poller scaling decisions admitted per second, host-wide.
    pub fn poller_scaling_decision_rate(&self) -> f64 {
        self.store.get_float(
            "matching.pollerScalingDecisionsPerSecond",
            &Constraints::default(),
            10.0,
        )
    }

    /// Backlog count past which more pollers are suggested.
    pub fn poller_scaling_backlog_count_threshold(&self) -> i64 {
        self.store
            .get_int(
                "matching.pollerScalingBacklogCountThreshold",
                &Constraints::default(),
                10,
            )
            .max(1)
    }

    /// Backlog age past which more pollers are suggested.
    pub fn poller_scaling_backlog_age_threshold(&self) -> Duration {
        self.store.get_duration(
            "matching.pollerScalingBacklogAgeThreshold",
            &Constraints::default(),
            Duration::from_secs(10),
        )
    }

    /// Sync-match wait past which fewer pollers are suggested.
    pub fn poller_scaling_wait_threshold(&self) -> Duration {
        self.store.get_duration(
            "matching.pollerScalingSyncMatchWaitThreshold",
            &Constraints::default(),
            Duration::from_secs(1),
        )
    }
}
