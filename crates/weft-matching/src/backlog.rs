// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backlog reader and ack manager.
//!
//! The reader pulls spooled tasks from the store in FIFO order, buffering a
//! batch and reloading when the buffer drains to the reload threshold. Tasks
//! whose expiry has passed are dropped on read. The ack manager tracks
//! outstanding task ids; the ack level is the highest id below every
//! outstanding task, and everything at or below it is deleted from the store
//! when the level advances.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use weft_persistence::store::MatchingTaskStore;
use weft_persistence::types::{MatchingTask, TaskQueueKey};

use crate::error::Result;

/// Tracks outstanding (read but unacked) task ids.
#[derive(Debug, Default)]
pub struct AckManager {
    state: Mutex<AckState>,
}

#[derive(Debug, Default)]
struct AckState {
    outstanding: BTreeSet<i64>,
    read_level: i64,
    ack_level: i64,
}

impl AckManager {
    /// Record a task handed to processing.
    pub fn task_read(&self, task_id: i64) {
        let mut state = self.state.lock();
        state.outstanding.insert(task_id);
        state.read_level = state.read_level.max(task_id);
    }

    /// Record a task finished. Returns the new ack level when it advanced.
    pub fn task_done(&self, task_id: i64) -> Option<i64> {
        let mut state = self.state.lock();
        state.outstanding.remove(&task_id);
        let new_level = match state.outstanding.iter().next() {
            Some(min_outstanding) => min_outstanding - 1,
            None => state.read_level,
        };
        if new_level > state.ack_level {
            state.ack_level = new_level;
            Some(new_level)
        } else {
            None
        }
    }

    /// Highest id with everything at or below it finished.
    pub fn ack_level(&self) -> i64 {
        self.state.lock().ack_level
    }

    /// Ids currently outstanding.
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Highest id handed out so far.
    pub fn read_level(&self) -> i64 {
        self.state.lock().read_level
    }
}

/// Approximate backlog statistics, feeding poller scaling decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacklogStats {
    /// Approximate number of spooled-but-unfinished tasks.
    pub approximate_count: i64,
    /// Age of the oldest buffered task.
    pub approximate_age: std::time::Duration,
    /// Tasks added per second (decayed).
    pub add_rate: f64,
    /// Tasks dispatched per second (decayed).
    pub dispatch_rate: f64,
}

struct BufferedTask {
    task: MatchingTask,
    buffered_at: Instant,
}

struct ReaderState {
    buffer: VecDeque<BufferedTask>,
    add_count: u64,
    dispatch_count: u64,
    window_start: Instant,
}

/// FIFO reader over one partition's backlog.
pub struct BacklogReader {
    key: TaskQueueKey,
    store: Arc<dyn MatchingTaskStore>,
    batch_size: usize,
    reload_at: usize,
    /// Ack manager shared with the partition.
    pub acks: Arc<AckManager>,
    state: Mutex<ReaderState>,
}

impl BacklogReader {
    /// Create a reader starting past `ack_level`.
    pub fn new(
        key: TaskQueueKey,
        store: Arc<dyn MatchingTaskStore>,
        ack_level: i64,
        batch_size: usize,
        reload_at: usize,
    ) -> Self {
        let acks = Arc::new(AckManager::default());
        acks.state.lock().read_level = ack_level;
        acks.state.lock().ack_level = ack_level;
        Self {
            key,
            store,
            batch_size: batch_size.max(1),
            reload_at: reload_at.max(1),
            acks,
            state: Mutex::new(ReaderState {
                buffer: VecDeque::new(),
                add_count: 0,
                dispatch_count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Number of buffered tasks.
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Record a spooled task for the add-rate estimate.
    pub fn note_task_added(&self) {
        self.state.lock().add_count += 1;
    }

    /// Pop the next backlog task, reloading from the store when the buffer
    /// is at or below the reload threshold. Expired tasks are dropped.
    pub async fn next_task(&self) -> Result<Option<MatchingTask>> {
        if self.buffered() <= self.reload_at {
            self.reload().await?;
        }
        let mut state = self.state.lock();
        while let Some(buffered) = state.buffer.pop_front() {
            if buffered
                .task
                .expiry
                .is_some_and(|expiry| expiry <= Utc::now())
            {
                // expired on read: complete it without dispatch
                self.acks.task_read(buffered.task.task_id);
                self.acks.task_done(buffered.task.task_id);
                continue;
            }
            state.dispatch_count += 1;
            self.acks.task_read(buffered.task.task_id);
            return Ok(Some(buffered.task));
        }
        Ok(None)
    }

    async fn reload(&self) -> Result<()> {
        let min_id = {
            let state = self.state.lock();
            state
                .buffer
                .back()
                .map(|b| b.task.task_id)
                .unwrap_or(self.acks.read_level())
        };
        let tasks = self
            .store
            .get_tasks(&self.key, min_id, i64::MAX, self.batch_size)
            .await?;
        if tasks.is_empty() {
            return Ok(());
        }
        debug!(partition = %self.key, loaded = tasks.len(), "backlog batch loaded");
        let now = Instant::now();
        let mut state = self.state.lock();
        for task in tasks {
            state.buffer.push_back(BufferedTask {
                task,
                buffered_at: now,
            });
        }
        Ok(())
    }

    /// Finish a task and range-complete the store below the new ack level.
    pub async fn complete_task(&self, task_id: i64) -> Result<()> {
        if let Some(new_level) = self.acks.task_done(task_id) {
            self.store
                .complete_tasks_less_than(&self.key, new_level)
                .await?;
        }
        Ok(())
    }

    /// Current backlog statistics.
    pub fn stats(&self) -> BacklogStats {
        let mut state = self.state.lock();
        let elapsed = state.window_start.elapsed().as_secs_f64().max(0.001);
        let stats = BacklogStats {
            approximate_count: (state.buffer.len() + self.acks.outstanding_count()) as i64,
            approximate_age: state
                .buffer
                .front()
                .map(|b| b.buffered_at.elapsed())
                .unwrap_or_default(),
            add_rate: state.add_count as f64 / elapsed,
            dispatch_rate: state.dispatch_count as f64 / elapsed,
        };
        // roll the rate window once a minute
        if elapsed > 60.0 {
            state.add_count = 0;
            state.dispatch_count = 0;
            state.window_start = Instant::now();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_common::tasks::WorkflowKey;
    use weft_persistence::types::TaskQueueType;
    use weft_persistence::MemoryStore;

    fn queue_key() -> TaskQueueKey {
        TaskQueueKey {
            namespace_id: Uuid::new_v4(),
            name: "tq".into(),
            task_type: TaskQueueType::Workflow,
            partition: 0,
        }
    }

    fn task(id: i64, expiry: Option<chrono::DateTime<Utc>>) -> MatchingTask {
        MatchingTask {
            task_id: id,
            workflow_key: WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4()),
            scheduled_event_id: 3,
            expiry,
            assigned_build_id: None,
        }
    }

    async fn reader_with_tasks(tasks: Vec<MatchingTask>) -> (BacklogReader, Arc<MemoryStore>, TaskQueueKey) {
        let store = Arc::new(MemoryStore::new());
        let key = queue_key();
        let info = store.lease_task_queue(&key, "host-a").await.unwrap();
        store.create_tasks(&key, info.range_id, tasks).await.unwrap();
        let reader = BacklogReader::new(key.clone(), store.clone(), 0, 100, 10);
        (reader, store, key)
    }

    #[test]
    fn ack_level_is_contiguous_floor() {
        let acks = AckManager::default();
        acks.task_read(1);
        acks.task_read(2);
        acks.task_read(3);

        // finishing out of order holds the level below the still-open id
        assert_eq!(acks.task_done(2), None);
        assert_eq!(acks.task_done(1), Some(2));
        assert_eq!(acks.task_done(3), Some(3));
        assert_eq!(acks.ack_level(), 3);
    }

    #[tokio::test]
    async fn fifo_reads_and_completion() {
        let (reader, store, key) =
            reader_with_tasks(vec![task(1, None), task(2, None), task(3, None)]).await;

        let first = reader.next_task().await.unwrap().unwrap();
        assert_eq!(first.task_id, 1);
        let second = reader.next_task().await.unwrap().unwrap();
        assert_eq!(second.task_id, 2);

        reader.complete_task(1).await.unwrap();
        // task 1 deleted from the store; 2 outstanding, 3 buffered
        let remaining = store.get_tasks(&key, 0, i64::MAX, 10).await.unwrap();
        let ids: Vec<i64> = remaining.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn expired_tasks_are_dropped_on_read() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let (reader, _store, _key) =
            reader_with_tasks(vec![task(1, Some(past)), task(2, None)]).await;

        let next = reader.next_task().await.unwrap().unwrap();
        assert_eq!(next.task_id, 2);
    }

    #[tokio::test]
    async fn drained_backlog_returns_none() {
        let (reader, _store, _key) = reader_with_tasks(vec![]).await;
        assert!(reader.next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_reflect_backlog() {
        let (reader, _store, _key) =
            reader_with_tasks(vec![task(1, None), task(2, None)]).await;
        reader.next_task().await.unwrap();
        let stats = reader.stats();
        assert!(stats.approximate_count >= 1);
        assert!(stats.dispatch_rate > 0.0);
    }
}
