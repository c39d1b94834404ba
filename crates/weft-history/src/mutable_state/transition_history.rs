// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition history.
//!
//! An append-only list of `(namespace_failover_version, transition_count)`
//! entries. Every committed mutation of a run increments the transition
//! count; the entries let peers linearize mutations across regions without
//! reading events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by transition history updates.
#[derive(Debug, Clone, Error)]
pub enum TransitionHistoryError {
    /// The failover version regressed.
    #[error("failover version {0} is below the last recorded version {1}")]
    VersionRegression(i64, i64),
}

/// One entry: the highest transition count reached at a failover version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedTransition {
    /// Namespace failover version.
    pub namespace_failover_version: i64,
    /// Highest transition count at that version.
    pub transition_count: i64,
}

/// The transition history of one run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionHistory {
    entries: Vec<VersionedTransition>,
}

impl TransitionHistory {
    /// Record one state transition at `failover_version`.
    ///
    /// Extends the last entry when the version matches; appends a new entry
    /// when the version advanced. Transition counts grow strictly
    /// monotonically across the whole history.
    pub fn record_transition(&mut self, failover_version: i64) -> Result<(), TransitionHistoryError> {
        let next_count = self.transition_count() + 1;
        match self.entries.last_mut() {
            Some(last) if last.namespace_failover_version == failover_version => {
                last.transition_count = next_count;
                Ok(())
            }
            Some(last) if last.namespace_failover_version > failover_version => Err(
                TransitionHistoryError::VersionRegression(
                    failover_version,
                    last.namespace_failover_version,
                ),
            ),
            _ => {
                self.entries.push(VersionedTransition {
                    namespace_failover_version: failover_version,
                    transition_count: next_count,
                });
                Ok(())
            }
        }
    }

    /// Total transitions recorded.
    pub fn transition_count(&self) -> i64 {
        self.entries.last().map(|e| e.transition_count).unwrap_or(0)
    }

    /// The last versioned transition, if any.
    pub fn last(&self) -> Option<VersionedTransition> {
        self.entries.last().copied()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[VersionedTransition] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_grow_strictly_monotonically() {
        let mut history = TransitionHistory::default();
        history.record_transition(10).unwrap();
        history.record_transition(10).unwrap();
        history.record_transition(12).unwrap();
        assert_eq!(history.transition_count(), 3);

        let entries = history.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].transition_count, 2);
        assert_eq!(entries[1].transition_count, 3);
        assert!(entries[0].transition_count < entries[1].transition_count);
    }

    #[test]
    fn version_regression_is_rejected() {
        let mut history = TransitionHistory::default();
        history.record_transition(12).unwrap();
        assert!(matches!(
            history.record_transition(10),
            Err(TransitionHistoryError::VersionRegression(10, 12))
        ));
    }

    #[test]
    fn empty_history_has_zero_count() {
        let history = TransitionHistory::default();
        assert_eq!(history.transition_count(), 0);
        assert!(history.last().is_none());
    }
}
