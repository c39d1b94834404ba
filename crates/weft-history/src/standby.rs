// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standby task validation.
//!
//! A standby cluster processes its namespaces' tasks as an observer: a task
//! is only actionable once the events it refers to have been replicated.
//! When they haven't, the task waits; after the resend delay the cluster
//! actively asks the remote side to resend; after the discard delay the task
//! is dropped. Outbound tasks are never discarded, their discard delay is
//! effectively infinite.

use std::time::Duration;

use chrono::{DateTime, Utc};

use weft_common::tasks::TaskCategory;

/// What to do with a standby task whose referenced events are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyVerdict {
    /// Keep waiting for replication to catch up.
    Retry,
    /// Actively request a resend of the missing events.
    RequestResend,
    /// Give up on the task.
    Discard,
}

/// Policy inputs for one standby task.
#[derive(Debug, Clone, Copy)]
pub struct StandbyPolicy {
    /// Wait before requesting a resend.
    pub resend_delay: Duration,
    /// Wait before discarding.
    pub discard_delay: Duration,
}

impl StandbyPolicy {
    /// The policy for a category. Outbound tasks never discard.
    pub fn for_category(
        category: TaskCategory,
        resend_delay: Duration,
        discard_delay: Duration,
    ) -> Self {
        match category {
            TaskCategory::Outbound => Self {
                resend_delay,
                discard_delay: Duration::MAX,
            },
            _ => Self {
                resend_delay,
                discard_delay,
            },
        }
    }

    /// Decide what to do `now`, given when the task first failed validation
    /// and whether a resend has been requested already.
    pub fn verdict(
        &self,
        first_attempt: DateTime<Utc>,
        resend_requested: bool,
        now: DateTime<Utc>,
    ) -> StandbyVerdict {
        let waited = (now - first_attempt).to_std().unwrap_or(Duration::ZERO);
        if waited >= self.discard_delay {
            return StandbyVerdict::Discard;
        }
        if waited >= self.resend_delay && !resend_requested {
            return StandbyVerdict::RequestResend;
        }
        StandbyVerdict::Retry
    }
}

/// Whether the events a task refers to are present locally: the task's
/// `(event_id, version)` must be at or below the run's current branch
/// progress.
pub fn events_present(
    task_event_id: i64,
    task_version: i64,
    local_last_event_id: i64,
    local_last_version: i64,
) -> bool {
    match task_version.cmp(&local_last_version) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => task_event_id <= local_last_event_id,
        std::cmp::Ordering::Greater => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(resend_secs: u64, discard_secs: u64) -> StandbyPolicy {
        StandbyPolicy {
            resend_delay: Duration::from_secs(resend_secs),
            discard_delay: Duration::from_secs(discard_secs),
        }
    }

    #[test]
    fn verdict_progression() {
        let policy = policy(10, 30);
        let start = Utc::now();

        // within the resend delay: keep waiting
        assert_eq!(
            policy.verdict(start, false, start + chrono::Duration::seconds(5)),
            StandbyVerdict::Retry
        );
        // past the resend delay: request once
        assert_eq!(
            policy.verdict(start, false, start + chrono::Duration::seconds(15)),
            StandbyVerdict::RequestResend
        );
        // already requested: wait
        assert_eq!(
            policy.verdict(start, true, start + chrono::Duration::seconds(15)),
            StandbyVerdict::Retry
        );
        // past the discard delay: drop
        assert_eq!(
            policy.verdict(start, true, start + chrono::Duration::seconds(31)),
            StandbyVerdict::Discard
        );
    }

    #[test]
    fn outbound_never_discards() {
        let policy = StandbyPolicy::for_category(
            TaskCategory::Outbound,
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        let start = Utc::now();
        let verdict = policy.verdict(start, true, start + chrono::Duration::days(365));
        assert_eq!(verdict, StandbyVerdict::Retry);
    }

    #[test]
    fn event_presence_by_version_then_id() {
        // lower version: replicated long ago
        assert!(events_present(100, 1, 5, 2));
        // same version: compare ids
        assert!(events_present(5, 2, 5, 2));
        assert!(!events_present(6, 2, 5, 2));
        // higher version: not yet replicated
        assert!(!events_present(1, 3, 100, 2));
    }
}
