// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task scheduling and retry.
//!
//! One host-level scheduler serves every shard's queues. Tasks are placed in
//! an active or standby lane depending on whether their namespace is active
//! in this cluster; workers drain the lanes with weighted round-robin so
//! standby reprocessing cannot starve live traffic.
//!
//! Execution failures retry with exponential backoff. A task whose error
//! matches the configured DLQ pattern goes to the dead-letter queue at once;
//! any other error does so after the configured attempt budget (seventy
//! attempts by default, roughly an hour under the task backoff policy).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use weft_common::backoff::RetryPolicy;
use weft_common::tasks::Task;
use weft_persistence::store::QueueV2Store;
use weft_persistence::types::{Blob, QueueV2Kind};

use crate::config::HistoryConfig;
use crate::error::{EngineError, Result};

/// How a task execution failed.
#[derive(Debug, Clone)]
pub struct TaskExecutionError {
    /// Whether a retry may succeed.
    pub retryable: bool,
    /// Whether this is an unclassified internal failure.
    pub internal: bool,
    /// Failure detail.
    pub message: String,
}

impl TaskExecutionError {
    /// A retryable failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            internal: false,
            message: message.into(),
        }
    }

    /// A terminal failure.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            internal: false,
            message: message.into(),
        }
    }
}

/// Executes tasks of one category.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task to completion.
    async fn execute(&self, task: &Task) -> std::result::Result<(), TaskExecutionError>;
}

/// Terminal outcome of processing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Executed successfully.
    Completed,
    /// Moved to the dead-letter queue.
    DeadLettered,
}

/// Drives one task through retries and, on exhaustion, into the DLQ.
pub struct TaskProcessor {
    executor: Arc<dyn TaskExecutor>,
    dlq: Arc<dyn QueueV2Store>,
    dlq_queue_name: String,
    config: HistoryConfig,
    retry_policy: RetryPolicy,
}

impl TaskProcessor {
    /// Create a processor writing dead letters to `dlq_queue_name`.
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        dlq: Arc<dyn QueueV2Store>,
        dlq_queue_name: impl Into<String>,
        config: HistoryConfig,
    ) -> Self {
        Self {
            executor,
            dlq,
            dlq_queue_name: dlq_queue_name.into(),
            config,
            retry_policy: RetryPolicy::task_processing(),
        }
    }

    /// Run a task until it completes or dead-letters.
    pub async fn process(&self, task: &Task) -> Result<TaskOutcome> {
        let max_attempts = self.config.task_dlq_unexpected_error_attempts();
        let pattern = self.config.task_dlq_error_pattern();
        let dlq_internal = self.config.task_dlq_internal_errors();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.executor.execute(task).await {
                Ok(()) => return Ok(TaskOutcome::Completed),
                Err(err) => {
                    let pattern_hit = !pattern.is_empty() && err.message.contains(&pattern);
                    let internal_hit = dlq_internal && err.internal;
                    let exhausted = attempt >= max_attempts;
                    if pattern_hit || internal_hit || exhausted || !err.retryable {
                        warn!(
                            task_id = task.key.task_id,
                            category = %task.category(),
                            attempts = attempt,
                            error = %err.message,
                            "task dead-lettered"
                        );
                        self.dead_letter(task, attempt, &err).await?;
                        return Ok(TaskOutcome::DeadLettered);
                    }
                    if let Some(delay) = self.retry_policy.next_delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        task: &Task,
        attempts: u32,
        err: &TaskExecutionError,
    ) -> Result<()> {
        #[derive(serde::Serialize)]
        struct DeadLetter<'a> {
            task: &'a Task,
            attempts: u32,
            last_error: &'a str,
        }
        let payload = Blob::from_json(&DeadLetter {
            task,
            attempts,
            last_error: &err.message,
        })
        .map_err(|e| EngineError::Internal(e.to_string()))?;

        self.dlq
            .create_queue(QueueV2Kind::ReplicationDlq, &self.dlq_queue_name)
            .await?;
        self.dlq
            .enqueue_message(QueueV2Kind::ReplicationDlq, &self.dlq_queue_name, payload)
            .await?;
        Ok(())
    }
}

/// Which lane a task is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLane {
    /// Namespace is active in this cluster.
    Active,
    /// Namespace is standby here.
    Standby,
}

/// Host-level two-lane queue with weighted round-robin draining.
///
/// The active lane gets `active_weight` pops for every standby pop.
pub struct HostTaskScheduler {
    active_weight: u32,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    active: VecDeque<Task>,
    standby: VecDeque<Task>,
    // pops granted to the active lane since the last standby pop
    active_credit: u32,
}

impl HostTaskScheduler {
    /// Create a scheduler granting the active lane `active_weight` pops per
    /// standby pop.
    pub fn new(active_weight: u32) -> Self {
        Self {
            active_weight: active_weight.max(1),
            state: Mutex::new(SchedulerState {
                active: VecDeque::new(),
                standby: VecDeque::new(),
                active_credit: 0,
            }),
        }
    }

    /// Enqueue a task on a lane.
    pub fn submit(&self, task: Task, lane: TaskLane) {
        let mut state = self.state.lock();
        match lane {
            TaskLane::Active => state.active.push_back(task),
            TaskLane::Standby => state.standby.push_back(task),
        }
    }

    /// Pop the next task per the round-robin weights.
    pub fn next(&self) -> Option<Task> {
        let mut state = self.state.lock();
        let prefer_standby =
            state.active_credit >= self.active_weight && !state.standby.is_empty();
        if prefer_standby {
            state.active_credit = 0;
            return state.standby.pop_front();
        }
        if let Some(task) = state.active.pop_front() {
            state.active_credit += 1;
            return Some(task);
        }
        // active lane empty: serve standby regardless of credit
        state.active_credit = 0;
        state.standby.pop_front()
    }

    /// Tasks waiting across both lanes.
    pub fn queued(&self) -> usize {
        let state = self.state.lock();
        state.active.len() + state.standby.len()
    }
}

/// Spawn `workers` background workers draining the scheduler through a
/// processor. Returns the worker handles; dropping the scheduler reference
/// does not stop them, use the returned handles' abort on shutdown.
pub fn spawn_workers(
    scheduler: Arc<HostTaskScheduler>,
    processor: Arc<TaskProcessor>,
    workers: usize,
    on_complete: Arc<dyn Fn(&Task, TaskOutcome) + Send + Sync>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..workers.max(1))
        .map(|_| {
            let scheduler = scheduler.clone();
            let processor = processor.clone();
            let on_complete = on_complete.clone();
            tokio::spawn(async move {
                loop {
                    let Some(task) = scheduler.next() else {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        continue;
                    };
                    match processor.process(&task).await {
                        Ok(outcome) => on_complete(&task, outcome),
                        Err(e) => {
                            error!(
                                task_id = task.key.task_id,
                                error = %e,
                                "task processing aborted"
                            );
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;
    use weft_common::config::{ConfigValue, Constraints, DynamicConfig};
    use weft_common::tasks::{TaskAttributes, TaskKey, WorkflowKey};
    use weft_persistence::MemoryStore;

    fn task(id: i64) -> Task {
        Task {
            shard_id: 1,
            key: TaskKey::immediate(id),
            workflow_key: WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4()),
            version: 1,
            destination: None,
            attributes: TaskAttributes::UpsertVisibility,
        }
    }

    struct FailingExecutor {
        fail_times: u32,
        calls: AtomicU32,
        retryable: bool,
        message: String,
    }

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self, _task: &Task) -> std::result::Result<(), TaskExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(TaskExecutionError {
                    retryable: self.retryable,
                    internal: false,
                    message: self.message.clone(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn processor(executor: Arc<dyn TaskExecutor>, config: Arc<DynamicConfig>) -> (TaskProcessor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            TaskProcessor::new(
                executor,
                store.clone(),
                "test-dlq",
                HistoryConfig::new(config, 4),
            ),
            store,
        )
    }

    #[tokio::test]
    async fn transient_failures_retry_to_success() {
        let executor = Arc::new(FailingExecutor {
            fail_times: 2,
            calls: AtomicU32::new(0),
            retryable: true,
            message: "transient".into(),
        });
        let (processor, store) = processor(executor.clone(), DynamicConfig::new());
        let outcome = processor.process(&task(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        // nothing dead-lettered
        assert!(store
            .list_queues(QueueV2Kind::ReplicationDlq)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn attempt_budget_sends_to_dlq() {
        let config = DynamicConfig::new();
        config.set(
            "history.TaskDLQUnexpectedErrorAttempts",
            Constraints::default(),
            ConfigValue::Int(3),
        );
        let executor = Arc::new(FailingExecutor {
            fail_times: u32::MAX,
            calls: AtomicU32::new(0),
            retryable: true,
            message: "keeps failing".into(),
        });
        let (processor, store) = processor(executor.clone(), config);
        let outcome = processor.process(&task(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::DeadLettered);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        let read = store
            .read_messages(QueueV2Kind::ReplicationDlq, "test-dlq", 0, 10)
            .await
            .unwrap();
        assert_eq!(read.messages.len(), 1);
    }

    #[tokio::test]
    async fn error_pattern_dead_letters_immediately() {
        let config = DynamicConfig::new();
        config.set(
            "history.TaskDLQErrorPattern",
            Constraints::default(),
            ConfigValue::String("poison".into()),
        );
        let executor = Arc::new(FailingExecutor {
            fail_times: u32::MAX,
            calls: AtomicU32::new(0),
            retryable: true,
            message: "poison pill".into(),
        });
        let (processor, _store) = processor(executor.clone(), config);
        let outcome = processor.process(&task(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::DeadLettered);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_errors_skip_retry() {
        let executor = Arc::new(FailingExecutor {
            fail_times: u32::MAX,
            calls: AtomicU32::new(0),
            retryable: false,
            message: "bad task".into(),
        });
        let (processor, _store) = processor(executor.clone(), DynamicConfig::new());
        let outcome = processor.process(&task(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::DeadLettered);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn round_robin_respects_weights() {
        let scheduler = HostTaskScheduler::new(2);
        for i in 0..6 {
            scheduler.submit(task(i), TaskLane::Active);
        }
        for i in 10..13 {
            scheduler.submit(task(i), TaskLane::Standby);
        }

        let order: Vec<i64> = std::iter::from_fn(|| scheduler.next())
            .map(|t| t.key.task_id)
            .collect();
        // two active per standby
        assert_eq!(order, vec![0, 1, 10, 2, 3, 11, 4, 5, 12]);
    }

    #[test]
    fn standby_drains_when_active_is_empty() {
        let scheduler = HostTaskScheduler::new(5);
        scheduler.submit(task(10), TaskLane::Standby);
        scheduler.submit(task(11), TaskLane::Standby);
        assert_eq!(scheduler.next().unwrap().key.task_id, 10);
        assert_eq!(scheduler.next().unwrap().key.task_id, 11);
        assert!(scheduler.next().is_none());
    }
}
