// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The replication stream.
//!
//! One stream per `(source shard, target cluster)` and priority tier. The
//! sender pulls from the shard's replication queue cursor under the tier's
//! QPS budget and interleaves sync-status and keep-alive frames; the
//! receiver applies tasks with bounded in-flight work and acks the frame's
//! high watermark once every task delivered below it is applied.
//!
//! Both tiers of a pair read the same physical replication queue; task ids
//! interleave across tiers because they come from one per-shard allocator.
//! Two consequences:
//!
//! - Receiver acks are watermark-based, not contiguity-based: a tier only
//!   ever sees its own subset of ids, so waiting for contiguous ids would
//!   stall at the first id belonging to the other tier. Acking the shipped
//!   watermark says "my tier's share below this id is applied".
//! - Deleting below an acked id is only safe once *every* tier of the pair
//!   has acked past it. Senders share a [`StreamAckLevels`] record and trim
//!   at the minimum ack across tiers, so a fast tier can never delete the
//!   slow tier's still-unshipped tasks.
//!
//! Tasks are ordered per source shard by task id; the receiver preserves
//! that order within a tier. Apply failures retry; when a task's events are
//! missing the receiver requests a bounded resend (deduplicated through the
//! progress cache) before retrying; exhausted retries dead-letter the task.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use weft_common::ratelimit::TokenBucket;
use weft_common::tasks::{Task, TaskAttributes, TaskCategory, TaskKey};
use weft_persistence::store::TaskStore;
use weft_persistence::types::GetHistoryTasksRequest;

use crate::config::ReplicationConfig;
use crate::dlq::ReplicationDlq;
use crate::error::{ReplicationError, Result};
use crate::resend::{EventsResender, ProgressCache};

/// Priority tier of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationPriority {
    /// Workflow state replication.
    High,
    /// Activity heartbeat/state replication.
    Low,
}

/// The tier a task belongs to.
pub fn priority_of(task: &Task) -> ReplicationPriority {
    match &task.attributes {
        TaskAttributes::SyncActivityState { .. } => ReplicationPriority::Low,
        _ => ReplicationPriority::High,
    }
}

/// Frames exchanged on a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamFrame {
    /// Sender → receiver: a batch of tasks in task-id order.
    Tasks {
        /// Tier of the batch.
        priority: ReplicationPriority,
        /// The tasks.
        tasks: Vec<Task>,
        /// All tasks below this id have been shipped on this tier.
        exclusive_high_watermark: i64,
    },
    /// Sender → receiver: the sender's queue position.
    SyncStatus {
        /// Lowest unacked task id on the sender.
        inclusive_low_watermark: i64,
    },
    /// Sender → receiver: idle keep-alive.
    KeepAlive,
    /// Receiver → sender: this tier's tasks at or below this id are applied.
    Ack {
        /// Highest acked task id of the tier.
        inclusive_acked_task_id: i64,
    },
}

/// Transport seam for frames flowing to the peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Ship one frame.
    async fn send(&self, frame: StreamFrame) -> Result<()>;
}

/// Per-tier ack record shared by the senders of one `(shard, target
/// cluster)` pair.
///
/// The tiers share one physical queue, so the trim level is the minimum ack
/// across every registered tier: nothing is deleted until the slowest tier
/// has acked past it. An untiered pair registers a single tier and trims at
/// its own ack.
#[derive(Default)]
pub struct StreamAckLevels {
    levels: Mutex<std::collections::HashMap<ReplicationPriority, i64>>,
}

impl StreamAckLevels {
    /// Create an empty record. One per `(shard, target cluster)` pair,
    /// shared by its tier senders.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, priority: ReplicationPriority) {
        self.levels.lock().entry(priority).or_insert(-1);
    }

    /// Record a tier's ack and return the trim level: the minimum ack over
    /// every registered tier.
    fn record(&self, priority: ReplicationPriority, acked: i64) -> i64 {
        let mut levels = self.levels.lock();
        let entry = levels.entry(priority).or_insert(-1);
        *entry = (*entry).max(acked);
        levels.values().copied().min().unwrap_or(-1)
    }

    /// The id below which every registered tier has acked.
    pub fn safe_trim_level(&self) -> i64 {
        self.levels.lock().values().copied().min().unwrap_or(-1)
    }
}

// ============================================================================
// Sender
// ============================================================================

struct SenderState {
    // next task id to ship (exclusive over everything shipped)
    cursor: i64,
    // highest acked task id of this tier
    acked: i64,
    // id up to which the shared queue has been trimmed
    trimmed: i64,
    event_loop_failures: u32,
}

/// The send side of one stream tier.
pub struct StreamSender {
    shard_id: i32,
    target_cluster: String,
    priority: ReplicationPriority,
    tiered: bool,
    store: Arc<dyn TaskStore>,
    link: Arc<dyn PeerLink>,
    config: ReplicationConfig,
    qps: TokenBucket,
    // shared with the pair's other tier; trim gates on the minimum ack
    ack_levels: Arc<StreamAckLevels>,
    state: Mutex<SenderState>,
    shutdown: Arc<Notify>,
}

impl StreamSender {
    /// Create a sender for one `(shard, cluster, tier)` stream. Both tier
    /// senders of a pair must share the same `ack_levels`.
    pub fn new(
        shard_id: i32,
        target_cluster: impl Into<String>,
        priority: ReplicationPriority,
        store: Arc<dyn TaskStore>,
        link: Arc<dyn PeerLink>,
        config: ReplicationConfig,
        ack_levels: Arc<StreamAckLevels>,
    ) -> Self {
        let qps = match priority {
            ReplicationPriority::High => config.sender_high_priority_qps(),
            ReplicationPriority::Low => config.sender_low_priority_qps(),
        };
        let tiered = config.tiered_processing_enabled();
        ack_levels.register(priority);
        Self {
            shard_id,
            target_cluster: target_cluster.into(),
            priority,
            tiered,
            store,
            link,
            config,
            qps: TokenBucket::new(qps, qps.max(1.0)),
            ack_levels,
            state: Mutex::new(SenderState {
                cursor: 0,
                acked: -1,
                trimmed: -1,
                event_loop_failures: 0,
            }),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the event loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Next task id this sender would ship.
    pub fn cursor(&self) -> i64 {
        self.state.lock().cursor
    }

    /// Highest acked task id.
    pub fn acked(&self) -> i64 {
        self.state.lock().acked
    }

    /// Pull one batch from the replication queue and ship it. Returns the
    /// number of tasks shipped.
    pub async fn pump_once(&self) -> Result<usize> {
        let cursor = self.state.lock().cursor;
        let response = self
            .store
            .get_history_tasks(GetHistoryTasksRequest {
                shard_id: self.shard_id,
                category: TaskCategory::Replication,
                inclusive_min_key: TaskKey::immediate(cursor),
                exclusive_max_key: TaskKey::maximum(),
                batch_size: self.config.fetch_batch_size(),
                next_page_token: None,
            })
            .await?;
        if response.tasks.is_empty() {
            return Ok(0);
        }
        let high_watermark = response
            .tasks
            .last()
            .map(|t| t.key.task_id + 1)
            .unwrap_or(cursor);

        // with tiering off a single stream carries everything
        let tasks: Vec<Task> = if self.tiered {
            response
                .tasks
                .into_iter()
                .filter(|t| priority_of(t) == self.priority)
                .collect()
        } else {
            response.tasks
        };
        let shipped = tasks.len();
        if !self.qps.try_acquire_n(shipped.max(1) as f64) {
            // over budget this tick; ship nothing and let the loop retry
            return Ok(0);
        }

        self.link
            .send(StreamFrame::Tasks {
                priority: self.priority,
                tasks,
                exclusive_high_watermark: high_watermark,
            })
            .await?;
        self.state.lock().cursor = high_watermark;
        debug!(
            shard_id = self.shard_id,
            target = %self.target_cluster,
            shipped,
            "replication batch shipped"
        );
        Ok(shipped)
    }

    /// Process an ack from the receiver. The tier's ack is recorded in the
    /// shared record; the physical queue is trimmed only up to the minimum
    /// ack across the pair's tiers, so the other tier's unacked tasks
    /// survive.
    pub async fn handle_ack(&self, inclusive_acked_task_id: i64) -> Result<()> {
        {
            let mut state = self.state.lock();
            if inclusive_acked_task_id <= state.acked {
                return Ok(());
            }
            state.acked = inclusive_acked_task_id;
        }
        let safe = self
            .ack_levels
            .record(self.priority, inclusive_acked_task_id);
        if safe <= self.state.lock().trimmed {
            return Ok(());
        }
        self.store
            .range_complete_history_tasks(
                self.shard_id,
                TaskCategory::Replication,
                TaskKey::minimum(),
                TaskKey::immediate(safe + 1),
            )
            .await?;
        let mut state = self.state.lock();
        state.trimmed = state.trimmed.max(safe);
        Ok(())
    }

    /// Emit a sync-status frame.
    pub async fn send_sync_status(&self) -> Result<()> {
        let low = self.state.lock().acked + 1;
        self.link
            .send(StreamFrame::SyncStatus {
                inclusive_low_watermark: low,
            })
            .await
    }

    /// Run the event loop: pump, interleave status and keep-alive frames,
    /// retry on failure up to the configured attempt budget.
    pub async fn run(self: Arc<Self>) {
        info!(
            shard_id = self.shard_id,
            target = %self.target_cluster,
            priority = ?self.priority,
            "replication stream sender started"
        );
        let mut last_sync = tokio::time::Instant::now();
        let mut last_traffic = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(shard_id = self.shard_id, "replication sender stopping");
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }

            match self.pump_once().await {
                Ok(shipped) => {
                    self.state.lock().event_loop_failures = 0;
                    if shipped > 0 {
                        last_traffic = tokio::time::Instant::now();
                    }
                }
                Err(e) => {
                    let failures = {
                        let mut state = self.state.lock();
                        state.event_loop_failures += 1;
                        state.event_loop_failures
                    };
                    warn!(shard_id = self.shard_id, error = %e, failures, "sender pump failed");
                    if failures >= self.config.event_loop_retry_max_attempts() {
                        warn!(shard_id = self.shard_id, "sender retry budget exhausted");
                        return;
                    }
                }
            }

            if last_sync.elapsed() >= self.config.sync_status_interval() {
                let _ = self.send_sync_status().await;
                last_sync = tokio::time::Instant::now();
            }
            if last_traffic.elapsed() >= self.config.send_empty_task_interval() {
                let _ = self.link.send(StreamFrame::KeepAlive).await;
                last_traffic = tokio::time::Instant::now();
            }
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Applies one replication task against local state.
#[async_trait]
pub trait ReplicationTaskApplier: Send + Sync {
    /// Apply the task. `MissingEvents` triggers the resend protocol.
    async fn apply(&self, task: &Task) -> Result<()>;
}

/// The receive side of one stream.
pub struct StreamReceiver {
    source_cluster: String,
    applier: Arc<dyn ReplicationTaskApplier>,
    resender: Arc<dyn EventsResender>,
    progress: Arc<ProgressCache>,
    dlq: Arc<ReplicationDlq>,
    config: ReplicationConfig,
    // highest acked id; advanced by frame watermarks, never by id
    // contiguity, because a tier only sees its own interleaved subset
    acked: Mutex<i64>,
    outstanding: Arc<tokio::sync::Semaphore>,
}

impl StreamReceiver {
    /// Create a receiver for tasks arriving from `source_cluster`.
    pub fn new(
        source_cluster: impl Into<String>,
        applier: Arc<dyn ReplicationTaskApplier>,
        resender: Arc<dyn EventsResender>,
        dlq: Arc<ReplicationDlq>,
        config: ReplicationConfig,
    ) -> Self {
        let progress =
            ProgressCache::new(config.progress_cache_max_size(), config.progress_cache_ttl());
        let outstanding = Arc::new(tokio::sync::Semaphore::new(config.receiver_max_outstanding()));
        Self {
            source_cluster: source_cluster.into(),
            applier,
            resender,
            progress,
            dlq,
            config,
            acked: Mutex::new(-1),
            outstanding,
        }
    }

    /// Highest acked task id: this tier's share below it is applied.
    pub fn ack_level(&self) -> i64 {
        *self.acked.lock()
    }

    /// Process one incoming frame, returning the ack frame to send back when
    /// tasks were applied.
    ///
    /// A task frame acks its high watermark once every task it delivered is
    /// settled (applied or dead-lettered): the sender asserts this tier has
    /// no unshipped tasks below the watermark, and ids belonging to the
    /// other tier are not this stream's responsibility.
    pub async fn handle_frame(&self, frame: StreamFrame) -> Result<Option<StreamFrame>> {
        match frame {
            StreamFrame::Tasks {
                tasks,
                exclusive_high_watermark,
                ..
            } => {
                for task in &tasks {
                    let _permit = self
                        .outstanding
                        .acquire()
                        .await
                        .map_err(|_| ReplicationError::Canceled)?;
                    self.apply_one(task).await?;
                }
                let acked = {
                    let mut acked = self.acked.lock();
                    *acked = (*acked).max(exclusive_high_watermark - 1);
                    *acked
                };
                Ok(Some(StreamFrame::Ack {
                    inclusive_acked_task_id: acked,
                }))
            }
            StreamFrame::SyncStatus { .. } | StreamFrame::KeepAlive => Ok(None),
            StreamFrame::Ack { .. } => Ok(None),
        }
    }

    /// Apply one task with retries, resend on missing events, and DLQ on
    /// exhaustion. Application is idempotent on the applier side, so a retry
    /// after a partial failure converges to the same terminal state.
    async fn apply_one(&self, task: &Task) -> Result<()> {
        let max_attempts = self.config.apply_max_attempts();
        let mut attempt: u32 = 0;
        let mut last_error = String::new();
        while attempt < max_attempts {
            attempt += 1;
            match self.applier.apply(task).await {
                Ok(()) => return Ok(()),
                Err(ReplicationError::MissingEvents { event_id, version }) => {
                    last_error = format!("missing events ({event_id}, {version})");
                    if self
                        .progress
                        .try_record(&task.workflow_key, event_id, version)
                    {
                        let resend = self
                            .resender
                            .resend(
                                &task.workflow_key,
                                event_id,
                                version,
                                self.config.resend_max_batch_count(),
                            )
                            .await;
                        if let Err(e) = resend {
                            warn!(workflow = %task.workflow_key, error = %e, "resend failed");
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }
        warn!(
            workflow = %task.workflow_key,
            attempts = attempt,
            error = %last_error,
            "replication task dead-lettered"
        );
        self.dlq
            .enqueue(task.clone(), &self.source_cluster, attempt, &last_error)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;
    use weft_common::config::{ConfigValue, Constraints, DynamicConfig};
    use weft_common::tasks::WorkflowKey;
    use weft_persistence::store::TaskStore;
    use weft_persistence::MemoryStore;

    fn config() -> ReplicationConfig {
        ReplicationConfig::new(DynamicConfig::new())
    }

    fn sync_task(id: i64, wf: &WorkflowKey) -> Task {
        Task {
            shard_id: 1,
            key: TaskKey::immediate(id),
            workflow_key: wf.clone(),
            version: 3,
            destination: None,
            attributes: TaskAttributes::SyncWorkflowState {
                first_event_id: 1,
                next_event_id: 5,
                version: 3,
            },
        }
    }

    #[derive(Default)]
    struct RecordingLink {
        frames: Mutex<Vec<StreamFrame>>,
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn send(&self, frame: StreamFrame) -> Result<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    struct NoResend;

    #[async_trait]
    impl EventsResender for NoResend {
        async fn resend(
            &self,
            _workflow_key: &WorkflowKey,
            _end_event_id: i64,
            _end_version: i64,
            _max_batches: usize,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn activity_task(id: i64, wf: &WorkflowKey) -> Task {
        Task {
            attributes: TaskAttributes::SyncActivityState {
                scheduled_event_id: 4,
                version: 3,
            },
            ..sync_task(id, wf)
        }
    }

    async fn seed(store: &Arc<MemoryStore>, tasks: Vec<Task>) {
        use weft_persistence::store::ShardStore;
        let shard = store.get_or_create_shard(1, "host-a").await.unwrap();
        let mut renewed = shard.clone();
        renewed.range_id += 1;
        store.update_shard(renewed.clone(), shard.range_id).await.unwrap();
        store.add_history_tasks(1, renewed.range_id, tasks).await.unwrap();
    }

    async fn seed_tasks(store: &Arc<MemoryStore>, count: i64) -> WorkflowKey {
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());
        let tasks: Vec<Task> = (1..=count).map(|id| sync_task(id, &wf)).collect();
        seed(store, tasks).await;
        wf
    }

    async fn remaining_task_ids(store: &Arc<MemoryStore>) -> Vec<i64> {
        store
            .get_history_tasks(GetHistoryTasksRequest {
                shard_id: 1,
                category: TaskCategory::Replication,
                inclusive_min_key: TaskKey::minimum(),
                exclusive_max_key: TaskKey::maximum(),
                batch_size: 10,
                next_page_token: None,
            })
            .await
            .unwrap()
            .tasks
            .iter()
            .map(|t| t.key.task_id)
            .collect()
    }

    #[tokio::test]
    async fn sender_ships_in_order_and_trims_on_ack() {
        let store = Arc::new(MemoryStore::new());
        seed_tasks(&store, 3).await;
        let link = Arc::new(RecordingLink::default());
        let sender = StreamSender::new(
            1,
            "c2",
            ReplicationPriority::High,
            store.clone(),
            link.clone(),
            config(),
            StreamAckLevels::new(),
        );

        let shipped = sender.pump_once().await.unwrap();
        assert_eq!(shipped, 3);
        {
            let frames = link.frames.lock();
            let StreamFrame::Tasks { tasks, exclusive_high_watermark, .. } = &frames[0] else {
                panic!("expected a task frame");
            };
            let ids: Vec<i64> = tasks.iter().map(|t| t.key.task_id).collect();
            assert_eq!(ids, vec![1, 2, 3]);
            assert_eq!(*exclusive_high_watermark, 4);
        }
        // nothing more to ship
        assert_eq!(sender.pump_once().await.unwrap(), 0);

        sender.handle_ack(3).await.unwrap();
        assert!(remaining_task_ids(&store).await.is_empty());
    }

    #[tokio::test]
    async fn tiered_trim_waits_for_the_slowest_tier() {
        let tiered_config = DynamicConfig::new();
        tiered_config.set(
            "history.enableReplicationTaskTieredProcessing",
            Constraints::default(),
            ConfigValue::Bool(true),
        );
        let config = ReplicationConfig::new(tiered_config);

        // one shared physical queue with interleaved tier ids: 1 and 3 are
        // workflow state (high), 2 is activity state (low)
        let store = Arc::new(MemoryStore::new());
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());
        seed(
            &store,
            vec![sync_task(1, &wf), activity_task(2, &wf), sync_task(3, &wf)],
        )
        .await;

        let ack_levels = StreamAckLevels::new();
        let high_link = Arc::new(RecordingLink::default());
        let high = StreamSender::new(
            1,
            "c2",
            ReplicationPriority::High,
            store.clone(),
            high_link.clone(),
            config.clone(),
            ack_levels.clone(),
        );
        let low_link = Arc::new(RecordingLink::default());
        let low = StreamSender::new(
            1,
            "c2",
            ReplicationPriority::Low,
            store.clone(),
            low_link.clone(),
            config.clone(),
            ack_levels.clone(),
        );

        // the high tier ships only its tasks but the watermark covers the
        // scanned range
        high.pump_once().await.unwrap();
        {
            let frames = high_link.frames.lock();
            let StreamFrame::Tasks { tasks, exclusive_high_watermark, .. } = &frames[0] else {
                panic!("expected a task frame");
            };
            let ids: Vec<i64> = tasks.iter().map(|t| t.key.task_id).collect();
            assert_eq!(ids, vec![1, 3]);
            assert_eq!(*exclusive_high_watermark, 4);
        }

        // the high tier acks past everything, but the low tier hasn't even
        // shipped task 2 yet: nothing may be deleted
        high.handle_ack(3).await.unwrap();
        assert_eq!(remaining_task_ids(&store).await, vec![1, 2, 3]);
        assert_eq!(ack_levels.safe_trim_level(), -1);

        // the low tier ships and acks its share; now every tier is past 3
        // and the shared queue trims
        low.pump_once().await.unwrap();
        {
            let frames = low_link.frames.lock();
            let StreamFrame::Tasks { tasks, .. } = &frames[0] else {
                panic!("expected a task frame");
            };
            let ids: Vec<i64> = tasks.iter().map(|t| t.key.task_id).collect();
            assert_eq!(ids, vec![2]);
        }
        low.handle_ack(3).await.unwrap();
        assert_eq!(ack_levels.safe_trim_level(), 3);
        assert!(remaining_task_ids(&store).await.is_empty());
    }

    #[tokio::test]
    async fn receiver_acks_the_frame_watermark() {
        let store = Arc::new(MemoryStore::new());
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());

        struct OkApplier;
        #[async_trait]
        impl ReplicationTaskApplier for OkApplier {
            async fn apply(&self, _task: &Task) -> Result<()> {
                Ok(())
            }
        }

        let receiver = StreamReceiver::new(
            "c1",
            Arc::new(OkApplier),
            Arc::new(NoResend),
            Arc::new(ReplicationDlq::new(store)),
            config(),
        );
        let ack = receiver
            .handle_frame(StreamFrame::Tasks {
                priority: ReplicationPriority::High,
                tasks: vec![sync_task(1, &wf), sync_task(2, &wf), sync_task(3, &wf)],
                exclusive_high_watermark: 4,
            })
            .await
            .unwrap();
        let Some(StreamFrame::Ack { inclusive_acked_task_id }) = ack else {
            panic!("expected an ack");
        };
        assert_eq!(inclusive_acked_task_id, 3);
    }

    #[tokio::test]
    async fn receiver_ack_covers_ids_of_the_other_tier() {
        let store = Arc::new(MemoryStore::new());
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());

        struct OkApplier;
        #[async_trait]
        impl ReplicationTaskApplier for OkApplier {
            async fn apply(&self, _task: &Task) -> Result<()> {
                Ok(())
            }
        }

        let receiver = StreamReceiver::new(
            "c1",
            Arc::new(OkApplier),
            Arc::new(NoResend),
            Arc::new(ReplicationDlq::new(store)),
            config(),
        );
        // a high-tier frame skips id 2 (it belongs to the low tier); the ack
        // still reaches the watermark instead of stalling at the gap
        let ack = receiver
            .handle_frame(StreamFrame::Tasks {
                priority: ReplicationPriority::High,
                tasks: vec![sync_task(1, &wf), sync_task(3, &wf)],
                exclusive_high_watermark: 4,
            })
            .await
            .unwrap();
        let Some(StreamFrame::Ack { inclusive_acked_task_id }) = ack else {
            panic!("expected an ack");
        };
        assert_eq!(inclusive_acked_task_id, 3);
        assert_eq!(receiver.ack_level(), 3);
    }

    #[tokio::test]
    async fn missing_events_trigger_one_resend_then_apply() {
        let store = Arc::new(MemoryStore::new());
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());

        struct FlakyApplier {
            calls: AtomicU32,
        }
        #[async_trait]
        impl ReplicationTaskApplier for FlakyApplier {
            async fn apply(&self, _task: &Task) -> Result<()> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ReplicationError::MissingEvents {
                        event_id: 5,
                        version: 3,
                    })
                } else {
                    Ok(())
                }
            }
        }
        struct CountingResender {
            calls: AtomicU32,
        }
        #[async_trait]
        impl EventsResender for CountingResender {
            async fn resend(
                &self,
                _workflow_key: &WorkflowKey,
                _end_event_id: i64,
                _end_version: i64,
                max_batches: usize,
            ) -> Result<()> {
                assert_eq!(max_batches, 10);
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let resender = Arc::new(CountingResender {
            calls: AtomicU32::new(0),
        });
        let receiver = StreamReceiver::new(
            "c1",
            Arc::new(FlakyApplier {
                calls: AtomicU32::new(0),
            }),
            resender.clone(),
            Arc::new(ReplicationDlq::new(store)),
            config(),
        );
        receiver
            .handle_frame(StreamFrame::Tasks {
                priority: ReplicationPriority::High,
                tasks: vec![sync_task(1, &wf)],
                exclusive_high_watermark: 2,
            })
            .await
            .unwrap();
        assert_eq!(resender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.ack_level(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_task() {
        let store = Arc::new(MemoryStore::new());
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());

        struct BrokenApplier;
        #[async_trait]
        impl ReplicationTaskApplier for BrokenApplier {
            async fn apply(&self, _task: &Task) -> Result<()> {
                Err(ReplicationError::ApplyFailed("schema mismatch".into()))
            }
        }

        let dlq = Arc::new(ReplicationDlq::new(store));
        let receiver = StreamReceiver::new(
            "c1",
            Arc::new(BrokenApplier),
            Arc::new(NoResend),
            dlq.clone(),
            config(),
        );
        receiver
            .handle_frame(StreamFrame::Tasks {
                priority: ReplicationPriority::High,
                tasks: vec![sync_task(1, &wf)],
                exclusive_high_watermark: 2,
            })
            .await
            .unwrap();

        let entries = dlq.read("c1", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].1.last_error.contains("schema mismatch"));
        // dead-lettered tasks still advance the ack so the stream moves on
        assert_eq!(receiver.ack_level(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_converges_to_the_same_state() {
        let store = Arc::new(MemoryStore::new());
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());

        // an applier modeling idempotent state application
        struct IdempotentApplier {
            state: Mutex<HashMap<WorkflowKey, i64>>,
        }
        #[async_trait]
        impl ReplicationTaskApplier for IdempotentApplier {
            async fn apply(&self, task: &Task) -> Result<()> {
                let TaskAttributes::SyncWorkflowState { next_event_id, .. } = &task.attributes
                else {
                    return Err(ReplicationError::ApplyFailed("unexpected task".into()));
                };
                let mut state = self.state.lock();
                let entry = state.entry(task.workflow_key.clone()).or_insert(0);
                *entry = (*entry).max(*next_event_id);
                Ok(())
            }
        }

        let applier = Arc::new(IdempotentApplier {
            state: Mutex::new(HashMap::new()),
        });
        let receiver = StreamReceiver::new(
            "c1",
            applier.clone(),
            Arc::new(NoResend),
            Arc::new(ReplicationDlq::new(store)),
            config(),
        );

        let frame = StreamFrame::Tasks {
            priority: ReplicationPriority::High,
            tasks: vec![sync_task(1, &wf)],
            exclusive_high_watermark: 2,
        };
        receiver.handle_frame(frame.clone()).await.unwrap();
        let after_first = applier.state.lock().clone();
        receiver.handle_frame(frame).await.unwrap();
        let after_second = applier.state.lock().clone();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn priority_classification() {
        let wf = WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4());
        assert_eq!(priority_of(&sync_task(1, &wf)), ReplicationPriority::High);
        let activity = Task {
            attributes: TaskAttributes::SyncActivityState {
                scheduled_event_id: 4,
                version: 3,
            },
            ..sync_task(2, &wf)
        };
        assert_eq!(priority_of(&activity), ReplicationPriority::Low);
    }
}
