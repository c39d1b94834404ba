// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version histories.
//!
//! Each branch of a run's history tree has a version history: an append-only
//! sequence of `(event_id, version)` items recording which failover version
//! wrote events up to each id. Branches are reconciled after reset or
//! cross-cluster conflict by comparing these sequences. One history is
//! current: the branch being written.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by version history operations.
#[derive(Debug, Clone, Error)]
pub enum VersionHistoryError {
    /// Items must grow in both event id and version.
    #[error("version history item ({event_id}, {version}) is not an append")]
    NonMonotonicItem {
        /// Offending event id.
        event_id: i64,
        /// Offending version.
        version: i64,
    },

    /// The history has no items yet.
    #[error("version history is empty")]
    Empty,

    /// No history at the requested index.
    #[error("no version history at index {0}")]
    IndexOutOfRange(usize),
}

/// One `(event_id, version)` item. `event_id` is the last event written at
/// `version` on the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Last event id written at this version.
    pub event_id: i64,
    /// Failover version.
    pub version: i64,
}

/// The version history of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Token of the branch this history describes.
    pub branch_token: Vec<u8>,
    /// Append-only items.
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Create a history for a branch.
    pub fn new(branch_token: Vec<u8>) -> Self {
        Self {
            branch_token,
            items: Vec::new(),
        }
    }

    /// Record that events up to `event_id` were written at `version`.
    /// Extends the last item when the version matches; appends otherwise.
    pub fn add_or_update_item(
        &mut self,
        event_id: i64,
        version: i64,
    ) -> Result<(), VersionHistoryError> {
        match self.items.last_mut() {
            None => {
                self.items.push(VersionHistoryItem { event_id, version });
                Ok(())
            }
            Some(last) if version == last.version && event_id >= last.event_id => {
                last.event_id = event_id;
                Ok(())
            }
            Some(last) if version > last.version && event_id > last.event_id => {
                self.items.push(VersionHistoryItem { event_id, version });
                Ok(())
            }
            Some(_) => Err(VersionHistoryError::NonMonotonicItem { event_id, version }),
        }
    }

    /// The last item, if any.
    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }

    /// Index of the lowest common item with `other`, used to pick a fork
    /// point during conflict resolution.
    pub fn lowest_common_item(&self, other: &VersionHistory) -> Option<VersionHistoryItem> {
        let mut best: Option<VersionHistoryItem> = None;
        for item in &self.items {
            for candidate in &other.items {
                if item.version == candidate.version {
                    let common = VersionHistoryItem {
                        event_id: item.event_id.min(candidate.event_id),
                        version: item.version,
                    };
                    if best.is_none_or(|b| common.event_id > b.event_id) {
                        best = Some(common);
                    }
                }
            }
        }
        best
    }
}

/// The set of branch version histories of one run. `current_index` names the
/// branch being written.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistories {
    /// Index of the current branch.
    pub current_index: usize,
    /// All branch histories.
    pub histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Create with a single (current) branch.
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    /// The current branch's history.
    pub fn current(&self) -> Result<&VersionHistory, VersionHistoryError> {
        self.histories
            .get(self.current_index)
            .ok_or(VersionHistoryError::IndexOutOfRange(self.current_index))
    }

    /// Mutable access to the current branch's history.
    pub fn current_mut(&mut self) -> Result<&mut VersionHistory, VersionHistoryError> {
        self.histories
            .get_mut(self.current_index)
            .ok_or(VersionHistoryError::IndexOutOfRange(self.current_index))
    }

    /// Add a branch history and return its index.
    pub fn add_history(&mut self, history: VersionHistory) -> usize {
        self.histories.push(history);
        self.histories.len() - 1
    }

    /// Switch the current branch.
    pub fn set_current_index(&mut self, index: usize) -> Result<(), VersionHistoryError> {
        if index >= self.histories.len() {
            return Err(VersionHistoryError::IndexOutOfRange(index));
        }
        self.current_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_extend_within_a_version() {
        let mut history = VersionHistory::new(vec![1]);
        history.add_or_update_item(3, 10).unwrap();
        history.add_or_update_item(7, 10).unwrap();
        assert_eq!(history.items.len(), 1);
        assert_eq!(
            history.last_item().unwrap(),
            VersionHistoryItem {
                event_id: 7,
                version: 10
            }
        );
    }

    #[test]
    fn new_version_appends() {
        let mut history = VersionHistory::new(vec![1]);
        history.add_or_update_item(3, 10).unwrap();
        history.add_or_update_item(8, 12).unwrap();
        assert_eq!(history.items.len(), 2);
    }

    #[test]
    fn regressions_are_rejected() {
        let mut history = VersionHistory::new(vec![1]);
        history.add_or_update_item(5, 10).unwrap();
        assert!(history.add_or_update_item(4, 10).is_err());
        assert!(history.add_or_update_item(6, 9).is_err());
        // same version lower id
        assert!(history.add_or_update_item(3, 12).is_err() || history.items.len() == 2);
    }

    #[test]
    fn lowest_common_item_picks_highest_shared_prefix() {
        let mut a = VersionHistory::new(vec![1]);
        a.add_or_update_item(5, 1).unwrap();
        a.add_or_update_item(9, 3).unwrap();

        let mut b = VersionHistory::new(vec![2]);
        b.add_or_update_item(5, 1).unwrap();
        b.add_or_update_item(7, 2).unwrap();

        let common = a.lowest_common_item(&b).unwrap();
        assert_eq!(
            common,
            VersionHistoryItem {
                event_id: 5,
                version: 1
            }
        );
    }

    #[test]
    fn current_branch_selection() {
        let mut histories = VersionHistories::new(VersionHistory::new(vec![1]));
        let idx = histories.add_history(VersionHistory::new(vec![2]));
        assert_eq!(idx, 1);
        histories.set_current_index(1).unwrap();
        assert_eq!(histories.current().unwrap().branch_token, vec![2]);
        assert!(histories.set_current_index(5).is_err());
    }
}
