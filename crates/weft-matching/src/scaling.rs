// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poller scaling decisions.
//!
//! On each sync-match or long-poll tick the partition may suggest that the
//! worker fleet change its poller count. Suggestions are rate-limited by a
//! host-wide token bucket; a denied decision emits nothing.

use std::time::Duration;

use weft_common::ratelimit::TokenBucket;

use crate::backlog::BacklogStats;

/// A suggested change to the worker's poller count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerScalingDecision {
    /// Positive: add pollers. Negative: shed pollers.
    pub poll_request_delta_suggestion: i32,
}

/// Inputs to one scaling decision.
#[derive(Debug, Clone, Copy)]
pub struct ScalingInput {
    /// Whether this partition is the family root.
    pub is_root_partition: bool,
    /// Backlog statistics at decision time.
    pub stats: BacklogStats,
    /// How long the triggering match waited, for sync-matched polls.
    pub sync_match_wait: Option<Duration>,
}

/// Thresholds for scaling decisions.
#[derive(Debug, Clone, Copy)]
pub struct ScalingThresholds {
    /// Backlog count past which more pollers are suggested.
    pub backlog_count: i64,
    /// Backlog age past which more pollers are suggested.
    pub backlog_age: Duration,
    /// Sync-match wait past which fewer pollers are suggested.
    pub long_wait: Duration,
}

/// Emits rate-limited poller scaling decisions.
pub struct PollerScalingDecider {
    thresholds: ScalingThresholds,
    limiter: TokenBucket,
}

impl PollerScalingDecider {
    /// Create a decider admitting `decisions_per_second` suggestions.
    pub fn new(thresholds: ScalingThresholds, decisions_per_second: f64) -> Self {
        Self {
            thresholds,
            limiter: TokenBucket::new(decisions_per_second, decisions_per_second.max(1.0)),
        }
    }

    /// Decide, or return `None` when there is nothing to suggest or the
    /// limiter denies.
    pub fn decide(&self, input: &ScalingInput) -> Option<PollerScalingDecision> {
        let suggestion = self.raw_suggestion(input)?;
        if !self.limiter.try_acquire() {
            return None;
        }
        Some(PollerScalingDecision {
            poll_request_delta_suggestion: suggestion,
        })
    }

    fn raw_suggestion(&self, input: &ScalingInput) -> Option<i32> {
        let backlog_high = input.stats.approximate_count > self.thresholds.backlog_count
            || input.stats.approximate_age > self.thresholds.backlog_age;

        if input.is_root_partition {
            if backlog_high {
                return Some(1);
            }
            // adds outpacing dispatch: the fleet is under-polled
            if input.stats.add_rate > input.stats.dispatch_rate && input.stats.add_rate > 0.0 {
                return Some(1);
            }
            // a long sync-match wait with no backlog: over-polled
            if let Some(wait) = input.sync_match_wait {
                if wait > self.thresholds.long_wait && input.stats.approximate_count == 0 {
                    return Some(-1);
                }
            }
            None
        } else {
            // non-root partitions only push the fleet up, never down
            if backlog_high {
                Some(1)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decider(rate: f64) -> PollerScalingDecider {
        PollerScalingDecider::new(
            ScalingThresholds {
                backlog_count: 10,
                backlog_age: Duration::from_secs(10),
                long_wait: Duration::from_secs(1),
            },
            rate,
        )
    }

    fn stats(count: i64, age: Duration) -> BacklogStats {
        BacklogStats {
            approximate_count: count,
            approximate_age: age,
            add_rate: 0.0,
            dispatch_rate: 0.0,
        }
    }

    #[test]
    fn root_backlog_suggests_more_pollers() {
        let decider = decider(100.0);
        let decision = decider
            .decide(&ScalingInput {
                is_root_partition: true,
                stats: stats(100, Duration::from_secs(60)),
                sync_match_wait: None,
            })
            .unwrap();
        assert!(decision.poll_request_delta_suggestion >= 1);
    }

    #[test]
    fn rate_limited_decision_is_none() {
        let decider = decider(1.0);
        let input = ScalingInput {
            is_root_partition: true,
            stats: stats(100, Duration::from_secs(60)),
            sync_match_wait: None,
        };
        // first decision takes the only token
        assert!(decider.decide(&input).is_some());
        // immediate re-ask while the limiter denies
        assert!(decider.decide(&input).is_none());
    }

    #[test]
    fn add_rate_above_dispatch_rate_scales_up() {
        let decider = decider(100.0);
        let decision = decider
            .decide(&ScalingInput {
                is_root_partition: true,
                stats: BacklogStats {
                    approximate_count: 0,
                    approximate_age: Duration::ZERO,
                    add_rate: 50.0,
                    dispatch_rate: 20.0,
                },
                sync_match_wait: None,
            })
            .unwrap();
        assert_eq!(decision.poll_request_delta_suggestion, 1);
    }

    #[test]
    fn long_wait_without_backlog_scales_down() {
        let decider = decider(100.0);
        let decision = decider
            .decide(&ScalingInput {
                is_root_partition: true,
                stats: stats(0, Duration::ZERO),
                sync_match_wait: Some(Duration::from_secs(2)),
            })
            .unwrap();
        assert_eq!(decision.poll_request_delta_suggestion, -1);
    }

    #[test]
    fn fast_match_without_backlog_suggests_nothing() {
        let decider = decider(100.0);
        assert!(decider
            .decide(&ScalingInput {
                is_root_partition: true,
                stats: stats(0, Duration::ZERO),
                sync_match_wait: Some(Duration::from_millis(5)),
            })
            .is_none());
    }

    #[test]
    fn non_root_only_scales_up() {
        let decider = decider(100.0);
        // high backlog: up
        assert!(decider
            .decide(&ScalingInput {
                is_root_partition: false,
                stats: stats(100, Duration::from_secs(60)),
                sync_match_wait: None,
            })
            .is_some());
        // long wait with no backlog: nothing (only the root sheds pollers)
        assert!(decider
            .decide(&ScalingInput {
                is_root_partition: false,
                stats: stats(0, Duration::ZERO),
                sync_match_wait: Some(Duration::from_secs(2)),
            })
            .is_none());
    }
}
