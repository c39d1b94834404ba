// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff retry policies.

use std::time::Duration;

use rand::Rng;

/// An exponential backoff policy with full jitter on each interval.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First retry interval.
    pub initial_interval: Duration,
    /// Upper bound on any single interval.
    pub max_interval: Duration,
    /// Growth factor between attempts.
    pub backoff_coefficient: f64,
    /// Attempts after which [`RetryPolicy::next_delay`] returns `None`.
    /// `0` means unbounded.
    pub max_attempts: u32,
    /// Fraction of the computed interval used as jitter range (0.0..=1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            max_attempts: 0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy used by task executors before a task is sent to the DLQ.
    /// Roughly one hour of wall clock across the default 70 attempts.
    pub fn task_processing() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(100),
            backoff_coefficient: 1.2,
            max_attempts: 0,
            jitter: 0.2,
        }
    }

    /// Policy for transient persistence errors inside a shard transaction.
    pub fn persistence() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            max_attempts: 5,
            jitter: 0.2,
        }
    }

    /// Compute the delay before retry number `attempt` (1-based).
    ///
    /// Returns `None` once `attempt` exceeds `max_attempts` (when bounded).
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return None;
        }
        let exp = (attempt - 1).min(63);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Some(Duration::from_secs_f64(jittered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_until_cap() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_attempts: 0,
            jitter: 0.0,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        // capped
        assert_eq!(policy.next_delay(10), Some(Duration::from_secs(1)));
    }

    #[test]
    fn bounded_attempts_exhaust() {
        let policy = RetryPolicy {
            max_attempts: 3,
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert!(policy.next_delay(3).is_some());
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 1.0,
            max_attempts: 0,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.next_delay(1).unwrap();
            assert!(d >= Duration::from_millis(50), "delay {d:?} below jitter floor");
            assert!(d <= Duration::from_millis(150), "delay {d:?} above jitter ceiling");
        }
    }
}
