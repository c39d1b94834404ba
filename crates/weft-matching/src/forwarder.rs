// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partition tree and forwarding policy.
//!
//! Partitions form a tree with fan-out `max_children_per_node`; partition 0
//! is the root, and partition p's parent is `(p - 1) / fan_out`. Child
//! partitions forward add-task calls toward the root so tasks meet pollers
//! that may be parked elsewhere in the family.
//!
//! Forwarding is suppressed while the local backlog is non-negligible, to
//! keep dispatch order fair: spooled tasks would otherwise be overtaken by
//! every new add. It resumes when the partition has gone without a local
//! poller for the configured wait.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use weft_persistence::types::{MatchingTask, TaskQueueKey};

use crate::error::Result;

/// The parent of `partition` in a tree with the given fan-out, or `None`
/// for the root.
pub fn parent_partition(partition: i32, fan_out: i32) -> Option<i32> {
    if partition <= 0 {
        return None;
    }
    Some((partition - 1) / fan_out.max(1))
}

/// Transport seam: delivers a forwarded task to the parent partition's
/// owner. The real implementation is an RPC to whichever host owns the
/// parent; tests use an in-process registry.
#[async_trait]
pub trait ForwardTarget: Send + Sync {
    /// Add a forwarded task to the parent partition. Returns true when the
    /// parent sync-matched it, false when the parent declined (caller
    /// spools locally).
    async fn forward_task(&self, parent: TaskQueueKey, task: MatchingTask) -> Result<bool>;
}

/// Inputs for one forwarding decision.
#[derive(Debug, Clone, Copy)]
pub struct ForwardDecisionInput {
    /// This partition's index.
    pub partition: i32,
    /// Age of the oldest spooled-but-undelivered task.
    pub backlog_age: Option<Duration>,
    /// When a poller last parked locally.
    pub last_local_poller: Option<Instant>,
}

/// Policy knobs for forwarding.
#[derive(Debug, Clone, Copy)]
pub struct ForwardPolicy {
    /// Backlog age below which forwarding remains allowed.
    pub backlog_negligible_age: Duration,
    /// Pollerless wait after which forwarding resumes regardless of backlog.
    pub max_wait_for_poller: Duration,
}

impl ForwardPolicy {
    /// Whether an add-task call may forward to the parent.
    pub fn should_forward(&self, input: &ForwardDecisionInput) -> bool {
        if input.partition == 0 {
            // the root has nowhere to go
            return false;
        }
        let pollerless_too_long = match input.last_local_poller {
            Some(at) => at.elapsed() >= self.max_wait_for_poller,
            None => true,
        };
        if pollerless_too_long {
            return true;
        }
        match input.backlog_age {
            // a non-negligible backlog blocks forwarding to keep ordering fair
            Some(age) => age < self.backlog_negligible_age,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_relation() {
        assert_eq!(parent_partition(0, 20), None);
        assert_eq!(parent_partition(1, 20), Some(0));
        assert_eq!(parent_partition(20, 20), Some(0));
        assert_eq!(parent_partition(21, 20), Some(1));
        // fan-out 2: a deeper tree
        assert_eq!(parent_partition(1, 2), Some(0));
        assert_eq!(parent_partition(2, 2), Some(0));
        assert_eq!(parent_partition(3, 2), Some(1));
        assert_eq!(parent_partition(4, 2), Some(1));
        assert_eq!(parent_partition(5, 2), Some(2));
    }

    fn policy() -> ForwardPolicy {
        ForwardPolicy {
            backlog_negligible_age: Duration::from_secs(5),
            max_wait_for_poller: Duration::from_millis(100),
        }
    }

    #[test]
    fn root_never_forwards() {
        let input = ForwardDecisionInput {
            partition: 0,
            backlog_age: None,
            last_local_poller: None,
        };
        assert!(!policy().should_forward(&input));
    }

    #[test]
    fn child_with_recent_poller_and_old_backlog_holds_tasks() {
        let input = ForwardDecisionInput {
            partition: 3,
            backlog_age: Some(Duration::from_secs(30)),
            last_local_poller: Some(Instant::now()),
        };
        assert!(!policy().should_forward(&input));
    }

    #[test]
    fn child_with_negligible_backlog_forwards() {
        let input = ForwardDecisionInput {
            partition: 3,
            backlog_age: Some(Duration::from_millis(10)),
            last_local_poller: Some(Instant::now()),
        };
        assert!(policy().should_forward(&input));
    }

    #[test]
    fn pollerless_child_resumes_forwarding_despite_backlog() {
        let input = ForwardDecisionInput {
            partition: 3,
            backlog_age: Some(Duration::from_secs(30)),
            last_local_poller: Some(Instant::now() - Duration::from_secs(1)),
        };
        assert!(policy().should_forward(&input));

        let never_polled = ForwardDecisionInput {
            partition: 3,
            backlog_age: Some(Duration::from_secs(30)),
            last_local_poller: None,
        };
        assert!(policy().should_forward(&never_polled));
    }
}
