// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Internal task queues.
//!
//! Each shard keeps one ordered queue per task category. A queue is consumed
//! through multiple cursors: each [`QueueSlice`] covers a key range and a
//! predicate saying which tasks the slice owns. The default reader owns one
//! universal slice; when pending work piles past the critical count, the
//! heaviest namespace's loaded backlog is split into its own slice so it
//! cannot starve the rest. A split slice's scope ends at the primary
//! cursor's position at split time: its cursor is already complete, it only
//! drains the moved tasks, and it retires once they finish. A predicate
//! that grows past the configured size degrades to the universal predicate,
//! trading reprocessing for bounded state.
//!
//! The ack level of a queue is the smallest key any live slice still has
//! pending; everything below it is range-completed in the store and the
//! level is persisted in the shard row. Retired slices are dropped before
//! the ack level is computed so a drained split can never hold it back.

pub mod outbound;
pub mod reader;
pub mod scheduler;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_common::tasks::{Task, TaskKey};

/// Which tasks a slice owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPredicate {
    /// Every task.
    Universal,
    /// Tasks of these namespaces only.
    Namespaces(HashSet<Uuid>),
}

impl TaskPredicate {
    /// Whether the predicate admits a task.
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            TaskPredicate::Universal => true,
            TaskPredicate::Namespaces(ids) => ids.contains(&task.workflow_key.namespace_id),
        }
    }

    /// Stored size of the predicate, in members.
    pub fn size(&self) -> usize {
        match self {
            TaskPredicate::Universal => 0,
            TaskPredicate::Namespaces(ids) => ids.len(),
        }
    }

    /// Union with another predicate, degrading to universal past
    /// `max_size` members.
    pub fn union(&self, other: &TaskPredicate, max_size: usize) -> TaskPredicate {
        match (self, other) {
            (TaskPredicate::Universal, _) | (_, TaskPredicate::Universal) => {
                TaskPredicate::Universal
            }
            (TaskPredicate::Namespaces(a), TaskPredicate::Namespaces(b)) => {
                let merged: HashSet<Uuid> = a.union(b).copied().collect();
                if merged.len() > max_size {
                    TaskPredicate::Universal
                } else {
                    TaskPredicate::Namespaces(merged)
                }
            }
        }
    }
}

/// One cursor over a key range of the queue.
#[derive(Debug, Clone)]
pub struct QueueSlice {
    /// Inclusive minimum key of the slice scope.
    pub min_key: TaskKey,
    /// Exclusive maximum key of the slice scope.
    pub max_key: TaskKey,
    /// Which tasks the slice owns inside its scope.
    pub predicate: TaskPredicate,
    /// Loaded-but-unfinished tasks.
    pending: BTreeMap<TaskKey, Task>,
    /// Next key to read from the store.
    read_cursor: TaskKey,
}

impl QueueSlice {
    /// A slice covering `[min, max)` with the given predicate.
    pub fn new(min_key: TaskKey, max_key: TaskKey, predicate: TaskPredicate) -> Self {
        Self {
            min_key,
            max_key,
            predicate,
            pending: BTreeMap::new(),
            read_cursor: min_key,
        }
    }

    /// Where the next store read starts.
    pub fn read_cursor(&self) -> TaskKey {
        self.read_cursor
    }

    /// Record loaded tasks, returning the ones this slice owns.
    pub fn absorb(&mut self, tasks: Vec<Task>, new_cursor: TaskKey) -> Vec<Task> {
        self.read_cursor = new_cursor;
        let mut owned = Vec::new();
        for task in tasks {
            if task.key >= self.min_key && task.key < self.max_key && self.predicate.matches(&task)
            {
                self.pending.insert(task.key, task.clone());
                owned.push(task);
            }
        }
        owned
    }

    /// Mark one task finished.
    pub fn complete(&mut self, key: TaskKey) {
        self.pending.remove(&key);
    }

    /// Number of loaded-but-unfinished tasks.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the slice has read its whole scope and finished every task
    /// it owned. A retired slice contributes nothing to the ack level and
    /// must be dropped by the reader.
    pub fn is_retired(&self) -> bool {
        self.pending.is_empty() && self.read_cursor >= self.max_key
    }

    /// The smallest key still pending, or the read cursor when drained.
    pub fn min_pending_key(&self) -> TaskKey {
        self.pending
            .keys()
            .next()
            .copied()
            .unwrap_or(self.read_cursor)
    }

    /// Count pending tasks per namespace, for split decisions.
    pub fn pending_by_namespace(&self) -> BTreeMap<Uuid, usize> {
        let mut counts = BTreeMap::new();
        for task in self.pending.values() {
            *counts.entry(task.workflow_key.namespace_id).or_insert(0) += 1;
        }
        counts
    }

    /// Split the namespaces in `moved` into a new slice. The split slice's
    /// scope is the range this slice has already read: its cursor is
    /// complete, it only drains the moved pending set, and it retires once
    /// that set is empty. New tasks of the moved namespaces keep flowing
    /// through this slice's reads.
    pub fn split_namespaces(&mut self, moved: HashSet<Uuid>, max_predicate_size: usize) -> QueueSlice {
        let predicate = if moved.len() > max_predicate_size {
            TaskPredicate::Universal
        } else {
            TaskPredicate::Namespaces(moved.clone())
        };
        let mut split = QueueSlice::new(self.min_key, self.read_cursor, predicate);
        split.read_cursor = self.read_cursor;

        let moved_keys: Vec<TaskKey> = self
            .pending
            .iter()
            .filter(|(_, t)| moved.contains(&t.workflow_key.namespace_id))
            .map(|(k, _)| *k)
            .collect();
        for key in moved_keys {
            if let Some(task) = self.pending.remove(&key) {
                split.pending.insert(key, task);
            }
        }
        split
    }
}

/// Reader progress persisted in the shard row. The ack level is the durable
/// part; the slice scopes are recorded for observability and a restored
/// reader starts over from the ack with a single universal cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedReaderState {
    /// Exclusive ack level at save time.
    pub ack_level: TaskKey,
    /// Scopes of the live slices at save time: `(min, max, predicate)`.
    pub slices: Vec<(TaskKey, TaskKey, TaskPredicate)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::tasks::{TaskAttributes, WorkflowKey};

    fn task(namespace_id: Uuid, id: i64) -> Task {
        Task {
            shard_id: 1,
            key: TaskKey::immediate(id),
            workflow_key: WorkflowKey::new(namespace_id, "wf", Uuid::new_v4()),
            version: 1,
            destination: None,
            attributes: TaskAttributes::UpsertVisibility,
        }
    }

    #[test]
    fn predicate_matching() {
        let ns = Uuid::new_v4();
        let other = Uuid::new_v4();
        let universal = TaskPredicate::Universal;
        let scoped = TaskPredicate::Namespaces(HashSet::from([ns]));

        assert!(universal.matches(&task(ns, 1)));
        assert!(scoped.matches(&task(ns, 1)));
        assert!(!scoped.matches(&task(other, 1)));
    }

    #[test]
    fn predicate_union_degrades_past_max_size() {
        let a = TaskPredicate::Namespaces(HashSet::from([Uuid::new_v4(), Uuid::new_v4()]));
        let b = TaskPredicate::Namespaces(HashSet::from([Uuid::new_v4()]));
        assert_eq!(a.union(&b, 2), TaskPredicate::Universal);
        assert!(matches!(a.union(&b, 10), TaskPredicate::Namespaces(_)));
        assert_eq!(
            a.union(&TaskPredicate::Universal, 10),
            TaskPredicate::Universal
        );
    }

    #[test]
    fn slice_tracks_pending_and_min_key() {
        let mut slice = QueueSlice::new(
            TaskKey::minimum(),
            TaskKey::maximum(),
            TaskPredicate::Universal,
        );
        let ns = Uuid::new_v4();
        let owned = slice.absorb(
            vec![task(ns, 3), task(ns, 1), task(ns, 2)],
            TaskKey::immediate(4),
        );
        assert_eq!(owned.len(), 3);
        assert_eq!(slice.pending_count(), 3);
        assert_eq!(slice.min_pending_key(), TaskKey::immediate(1));

        slice.complete(TaskKey::immediate(1));
        assert_eq!(slice.min_pending_key(), TaskKey::immediate(2));

        slice.complete(TaskKey::immediate(2));
        slice.complete(TaskKey::immediate(3));
        // drained: min pending is the read cursor
        assert_eq!(slice.min_pending_key(), TaskKey::immediate(4));
    }

    #[test]
    fn slice_split_moves_hot_namespace() {
        let hot = Uuid::new_v4();
        let cold = Uuid::new_v4();
        let mut slice = QueueSlice::new(
            TaskKey::minimum(),
            TaskKey::maximum(),
            TaskPredicate::Universal,
        );
        slice.absorb(
            vec![task(hot, 1), task(hot, 2), task(hot, 3), task(cold, 4)],
            TaskKey::immediate(5),
        );

        let counts = slice.pending_by_namespace();
        assert_eq!(counts[&hot], 3);

        let split = slice.split_namespaces(HashSet::from([hot]), 16);
        assert_eq!(split.pending_count(), 3);
        assert_eq!(slice.pending_count(), 1);
        assert!(split.predicate.matches(&task(hot, 9)));
        assert!(!split.predicate.matches(&task(cold, 9)));

        // the split scope ends at the read position; its cursor is complete
        assert_eq!(split.max_key, TaskKey::immediate(5));
        assert_eq!(split.read_cursor(), TaskKey::immediate(5));
        // the primary slice keeps reading the moved namespace's new tasks
        assert!(slice.predicate.matches(&task(hot, 9)));
    }

    #[test]
    fn split_slice_retires_once_drained() {
        let hot = Uuid::new_v4();
        let mut slice = QueueSlice::new(
            TaskKey::minimum(),
            TaskKey::maximum(),
            TaskPredicate::Universal,
        );
        slice.absorb(vec![task(hot, 1), task(hot, 2)], TaskKey::immediate(3));
        let mut split = slice.split_namespaces(HashSet::from([hot]), 16);
        assert!(!split.is_retired());

        split.complete(TaskKey::immediate(1));
        split.complete(TaskKey::immediate(2));
        assert!(split.is_retired());

        // the primary slice still has its whole range ahead of it
        assert!(!slice.is_retired());
    }

    #[test]
    fn split_degrades_predicate_past_max_size() {
        let mut slice = QueueSlice::new(
            TaskKey::minimum(),
            TaskKey::maximum(),
            TaskPredicate::Universal,
        );
        let many: HashSet<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let split = slice.split_namespaces(many, 3);
        assert_eq!(split.predicate, TaskPredicate::Universal);
    }
}
