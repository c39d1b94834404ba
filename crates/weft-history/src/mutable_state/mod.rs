// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable state: the authoritative per-run record.
//!
//! Invariants maintained here:
//!
//! - `next_event_id` always equals the id the next appended event will take.
//! - Buffered events (signals/updates received while a workflow task is in
//!   flight) respect the count and byte caps; overflow fails the task.
//! - Pending activity/timer/child/cancel/signal maps respect per-namespace
//!   limits; exceeding a limit fails the command that scheduled it.
//! - The current version history tracks every appended event; the
//!   transition history grows strictly monotonically.
//! - The checksum covers the serialized record and is verified on load.

pub mod events;
pub mod transition_history;
pub mod version_history;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use weft_common::tasks::WorkflowKey;
use weft_persistence::types::{Blob, WorkflowSnapshot, WorkflowState, WorkflowStatus};

use crate::error::{EngineError, Result};
use events::{EventType, HistoryEvent};
use transition_history::{TransitionHistory, VersionedTransition};
use version_history::{VersionHistories, VersionHistory};

/// Pending activity bookkeeping, keyed by scheduled event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Scheduled event id.
    pub scheduled_event_id: i64,
    /// Started event id, 0 until a worker picks it up.
    pub started_event_id: i64,
    /// User-chosen activity id.
    pub activity_id: String,
    /// Dispatch queue.
    pub task_queue: String,
    /// Current attempt, 1-based.
    pub attempt: i32,
    /// Last recorded heartbeat.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Failover version at scheduling.
    pub version: i64,
}

/// Pending user timer, keyed by timer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// User-chosen timer id.
    pub timer_id: String,
    /// Started event id.
    pub started_event_id: i64,
    /// When the timer fires.
    pub fire_time: DateTime<Utc>,
    /// Failover version at start.
    pub version: i64,
}

/// Pending child workflow, keyed by initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// Initiated event id.
    pub initiated_event_id: i64,
    /// Started event id, 0 until the child starts.
    pub started_event_id: i64,
    /// Child namespace id.
    pub namespace_id: Uuid,
    /// Child workflow id.
    pub workflow_id: String,
    /// Child run id once started.
    pub run_id: Option<Uuid>,
}

/// Pending external cancel request, keyed by initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    /// Initiated event id.
    pub initiated_event_id: i64,
    /// Target namespace id.
    pub target_namespace_id: Uuid,
    /// Target workflow id.
    pub target_workflow_id: String,
}

/// Pending external signal, keyed by initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    /// Initiated event id.
    pub initiated_event_id: i64,
    /// Signal name.
    pub signal_name: String,
    /// Target workflow id.
    pub target_workflow_id: String,
}

/// Execution-scoped info that is not per-pending-item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// When the run started.
    pub start_time: Option<DateTime<Utc>>,
    /// Whole-execution timeout.
    pub execution_timeout: Option<std::time::Duration>,
    /// Single-run timeout.
    pub run_timeout: Option<std::time::Duration>,
    /// Default dispatch queue.
    pub task_queue: String,
    /// Parent run for child workflows.
    pub parent: Option<WorkflowKey>,
    /// Auto-reset points (build id -> first event id).
    pub auto_reset_points: HashMap<String, i64>,
    /// Indexed search attributes.
    pub search_attributes: HashMap<String, serde_json::Value>,
    /// Non-indexed memo.
    pub memo: HashMap<String, serde_json::Value>,
    /// Accumulated history size in bytes.
    pub history_size_bytes: i64,
    /// Accumulated history event count.
    pub history_event_count: i64,
}

/// Execution lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Idempotency token of the start request.
    pub create_request_id: String,
    /// Run id.
    pub run_id: Uuid,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// Status; terminal once closed.
    pub status: WorkflowStatus,
    /// Versioned transition of the last update, for replication ordering.
    pub last_update_versioned_transition: Option<VersionedTransition>,
    /// When the state record was created.
    pub start_time: Option<DateTime<Utc>>,
}

/// Bookkeeping for a speculative workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpeculativeTaskInfo {
    /// Events handed to the transport write buffer while the task was out.
    pub shipped_event_count: usize,
}

/// Caps applied when buffering events.
#[derive(Debug, Clone, Copy)]
pub struct BufferedEventLimits {
    /// Maximum buffered event count.
    pub max_count: usize,
    /// Maximum total buffered bytes.
    pub max_bytes: usize,
}

/// The authoritative in-memory record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    /// Run identity.
    pub workflow_key: WorkflowKey,
    /// Execution info.
    pub execution_info: ExecutionInfo,
    /// Execution state.
    pub execution_state: ExecutionState,
    /// Id the next appended event takes.
    pub next_event_id: i64,
    /// Pending activities by scheduled event id.
    pub activity_infos: HashMap<i64, ActivityInfo>,
    /// Pending timers by timer id.
    pub timer_infos: HashMap<String, TimerInfo>,
    /// Pending children by initiated event id.
    pub child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    /// Pending cancel requests by initiated event id.
    pub request_cancel_infos: HashMap<i64, RequestCancelInfo>,
    /// Pending signals by initiated event id.
    pub signal_infos: HashMap<i64, SignalInfo>,
    /// Deduplication ids of received signals.
    pub signal_requested_ids: HashSet<String>,
    /// Events held while a workflow task is in flight.
    pub buffered_events: Vec<HistoryEvent>,
    /// Opaque component tree nodes by path.
    pub chasm_nodes: HashMap<String, Vec<u8>>,
    /// Branch version histories.
    pub version_histories: VersionHistories,
    /// Versioned transition record.
    pub transition_history: TransitionHistory,
    /// Speculative workflow task bookkeeping, when one is outstanding.
    pub speculative_task: Option<SpeculativeTaskInfo>,
    /// Workflow updates currently awaiting a worker response.
    pub in_flight_updates: usize,
    /// Workflow updates admitted over the run's lifetime.
    pub total_updates: i64,
}

impl MutableState {
    /// Create the mutable state of a brand-new run.
    pub fn new_run(
        workflow_key: WorkflowKey,
        create_request_id: String,
        task_queue: String,
        branch_token: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_key: workflow_key.clone(),
            execution_info: ExecutionInfo {
                start_time: Some(now),
                task_queue,
                ..ExecutionInfo::default()
            },
            execution_state: ExecutionState {
                create_request_id,
                run_id: workflow_key.run_id,
                state: WorkflowState::Created,
                status: WorkflowStatus::Running,
                last_update_versioned_transition: None,
                start_time: Some(now),
            },
            next_event_id: 1,
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
            request_cancel_infos: HashMap::new(),
            signal_infos: HashMap::new(),
            signal_requested_ids: HashSet::new(),
            buffered_events: Vec::new(),
            chasm_nodes: HashMap::new(),
            version_histories: VersionHistories::new(VersionHistory::new(branch_token)),
            transition_history: TransitionHistory::default(),
            speculative_task: None,
            in_flight_updates: 0,
            total_updates: 0,
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append an event to the current branch, assigning the next event id.
    pub fn add_event(
        &mut self,
        event_type: EventType,
        attributes: serde_json::Value,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<HistoryEvent> {
        let event = HistoryEvent {
            event_id: self.next_event_id,
            event_type,
            version,
            event_time: now,
            attributes,
        };
        self.version_histories
            .current_mut()
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .add_or_update_item(event.event_id, version)
            .map_err(|e| EngineError::Conflict(e.to_string()))?;
        self.next_event_id += 1;
        self.execution_info.history_event_count += 1;
        self.execution_info.history_size_bytes += event.estimated_size() as i64;
        Ok(event)
    }

    /// Buffer an event received while a workflow task is in flight.
    ///
    /// The event carries no id yet; ids are assigned when the buffer is
    /// flushed. Overflow of either cap is an error the caller turns into a
    /// workflow task failure.
    pub fn buffer_event(&mut self, mut event: HistoryEvent, limits: BufferedEventLimits) -> Result<()> {
        if self.buffered_events.len() + 1 > limits.max_count {
            return Err(EngineError::LimitExceeded(format!(
                "buffered event count would exceed {}",
                limits.max_count
            )));
        }
        let buffered_bytes: usize = self.buffered_events.iter().map(|e| e.estimated_size()).sum();
        if buffered_bytes + event.estimated_size() > limits.max_bytes {
            return Err(EngineError::LimitExceeded(format!(
                "buffered event bytes would exceed {}",
                limits.max_bytes
            )));
        }
        event.event_id = 0;
        self.buffered_events.push(event);
        Ok(())
    }

    /// Flush buffered events into the history, assigning ids in arrival
    /// order. Called right before the WorkflowTaskCompleted event is written.
    pub fn flush_buffered_events(&mut self, version: i64) -> Result<Vec<HistoryEvent>> {
        let buffered = std::mem::take(&mut self.buffered_events);
        let mut flushed = Vec::with_capacity(buffered.len());
        for event in buffered {
            let flushed_event =
                self.add_event(event.event_type, event.attributes, version, event.event_time)?;
            flushed.push(flushed_event);
        }
        Ok(flushed)
    }

    // ------------------------------------------------------------------
    // Versions and transitions
    // ------------------------------------------------------------------

    /// Record one committed state transition at `failover_version`.
    pub fn record_transition(&mut self, failover_version: i64) -> Result<()> {
        self.transition_history
            .record_transition(failover_version)
            .map_err(|e| EngineError::Conflict(e.to_string()))?;
        self.execution_state.last_update_versioned_transition = self.transition_history.last();
        Ok(())
    }

    /// Version of the last write on the current branch. Runs without events
    /// fall back to the last versioned transition.
    pub fn last_write_version(&self) -> Result<i64> {
        let current = self
            .version_histories
            .current()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if let Some(item) = current.last_item() {
            return Ok(item.version);
        }
        self.transition_history
            .last()
            .map(|t| t.namespace_failover_version)
            .ok_or_else(|| EngineError::InvalidState("run has no writes".into()))
    }

    // ------------------------------------------------------------------
    // Pending-item limits
    // ------------------------------------------------------------------

    /// Track a scheduled activity, enforcing the pending cap.
    pub fn add_activity(&mut self, info: ActivityInfo, limit: usize) -> Result<()> {
        if self.activity_infos.len() >= limit {
            return Err(EngineError::LimitExceeded(format!(
                "pending activities would exceed {limit}"
            )));
        }
        self.activity_infos.insert(info.scheduled_event_id, info);
        Ok(())
    }

    /// Track a started timer.
    pub fn add_timer(&mut self, info: TimerInfo) -> Result<()> {
        self.timer_infos.insert(info.timer_id.clone(), info);
        Ok(())
    }

    /// Track an initiated child workflow, enforcing the pending cap.
    pub fn add_child_execution(&mut self, info: ChildExecutionInfo, limit: usize) -> Result<()> {
        if self.child_execution_infos.len() >= limit {
            return Err(EngineError::LimitExceeded(format!(
                "pending child workflows would exceed {limit}"
            )));
        }
        self.child_execution_infos.insert(info.initiated_event_id, info);
        Ok(())
    }

    /// Track an initiated cancel request, enforcing the pending cap.
    pub fn add_request_cancel(&mut self, info: RequestCancelInfo, limit: usize) -> Result<()> {
        if self.request_cancel_infos.len() >= limit {
            return Err(EngineError::LimitExceeded(format!(
                "pending cancel requests would exceed {limit}"
            )));
        }
        self.request_cancel_infos.insert(info.initiated_event_id, info);
        Ok(())
    }

    /// Track an initiated external signal, enforcing the pending cap.
    pub fn add_signal(&mut self, info: SignalInfo, limit: usize) -> Result<()> {
        if self.signal_infos.len() >= limit {
            return Err(EngineError::LimitExceeded(format!(
                "pending signals would exceed {limit}"
            )));
        }
        self.signal_infos.insert(info.initiated_event_id, info);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Mark the run running (first workflow task scheduled).
    pub fn mark_running(&mut self) {
        self.execution_state.state = WorkflowState::Running;
    }

    /// Close the run with a terminal status.
    pub fn close(&mut self, status: WorkflowStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidArgument(
                "close requires a terminal status".into(),
            ));
        }
        if self.execution_state.state == WorkflowState::Completed {
            return Err(EngineError::InvalidState("run is already closed".into()));
        }
        self.execution_state.state = WorkflowState::Completed;
        self.execution_state.status = status;
        Ok(())
    }

    /// Whether an outstanding speculative workflow task may be discarded
    /// without writing events.
    pub fn can_discard_speculative_task(&self, max_shipped_events: usize) -> bool {
        match &self.speculative_task {
            Some(info) => info.shipped_event_count < max_shipped_events,
            None => false,
        }
    }

    /// Admit one workflow update. Overflowing the in-flight bound is a
    /// resource-exhausted condition for the caller; overflowing the lifetime
    /// bound is terminal for the update.
    pub fn begin_update(&mut self, max_in_flight: usize, max_total: i64) -> Result<()> {
        if self.in_flight_updates >= max_in_flight {
            return Err(EngineError::LimitExceeded(format!(
                "in-flight workflow updates would exceed {max_in_flight}"
            )));
        }
        if self.total_updates >= max_total {
            return Err(EngineError::LimitExceeded(format!(
                "total workflow updates would exceed {max_total}"
            )));
        }
        self.in_flight_updates += 1;
        self.total_updates += 1;
        Ok(())
    }

    /// Settle one in-flight workflow update (accepted, completed, or
    /// rejected by the worker).
    pub fn complete_update(&mut self) {
        self.in_flight_updates = self.in_flight_updates.saturating_sub(1);
    }

    // ------------------------------------------------------------------
    // Snapshots and checksums
    // ------------------------------------------------------------------

    /// Checksum over the serialized record.
    pub fn checksum(&self) -> Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        let encoded = serde_json::to_vec(&ChecksumView::of(self))
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        hasher.update(&encoded);
        Ok(hasher.finalize().to_vec())
    }

    /// Serialize into the store's discrete-blob snapshot form.
    pub fn to_snapshot(&self) -> Result<WorkflowSnapshot> {
        let mut snapshot = WorkflowSnapshot {
            execution_info: json_blob(&(
                &self.execution_info,
                &self.version_histories,
                &self.transition_history,
            ))?,
            execution_state: json_blob(&self.execution_state)?,
            state: self.execution_state.state,
            status: self.execution_state.status,
            next_event_id: self.next_event_id,
            last_write_version: self.last_write_version().unwrap_or(0),
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
            request_cancel_infos: HashMap::new(),
            signal_infos: HashMap::new(),
            signal_requested_ids: self.signal_requested_ids.clone(),
            buffered_events: Vec::new(),
            chasm_nodes: HashMap::new(),
            checksum: Blob {
                data: self.checksum()?,
                encoding: "sha256/plain".into(),
            },
        };
        for (k, v) in &self.activity_infos {
            snapshot.activity_infos.insert(*k, json_blob(v)?);
        }
        for (k, v) in &self.timer_infos {
            snapshot.timer_infos.insert(k.clone(), json_blob(v)?);
        }
        for (k, v) in &self.child_execution_infos {
            snapshot.child_execution_infos.insert(*k, json_blob(v)?);
        }
        for (k, v) in &self.request_cancel_infos {
            snapshot.request_cancel_infos.insert(*k, json_blob(v)?);
        }
        for (k, v) in &self.signal_infos {
            snapshot.signal_infos.insert(*k, json_blob(v)?);
        }
        for event in &self.buffered_events {
            snapshot.buffered_events.push(json_blob(event)?);
        }
        for (k, v) in &self.chasm_nodes {
            snapshot.chasm_nodes.insert(
                k.clone(),
                Blob {
                    data: v.clone(),
                    encoding: "binary/plain".into(),
                },
            );
        }
        Ok(snapshot)
    }

    /// Rebuild from the store's snapshot form, verifying the checksum.
    pub fn from_snapshot(workflow_key: WorkflowKey, snapshot: &WorkflowSnapshot) -> Result<Self> {
        let (execution_info, version_histories, transition_history): (
            ExecutionInfo,
            VersionHistories,
            TransitionHistory,
        ) = snapshot
            .execution_info
            .to_json()
            .map_err(|e| EngineError::Internal(format!("execution info blob: {e}")))?;
        let execution_state: ExecutionState = snapshot
            .execution_state
            .to_json()
            .map_err(|e| EngineError::Internal(format!("execution state blob: {e}")))?;

        let mut state = Self {
            workflow_key,
            execution_info,
            execution_state,
            next_event_id: snapshot.next_event_id,
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
            request_cancel_infos: HashMap::new(),
            signal_infos: HashMap::new(),
            signal_requested_ids: snapshot.signal_requested_ids.clone(),
            buffered_events: Vec::new(),
            chasm_nodes: HashMap::new(),
            version_histories,
            transition_history,
            speculative_task: None,
            in_flight_updates: 0,
            total_updates: 0,
        };
        for (k, v) in &snapshot.activity_infos {
            state.activity_infos.insert(
                *k,
                v.to_json()
                    .map_err(|e| EngineError::Internal(format!("activity blob: {e}")))?,
            );
        }
        for (k, v) in &snapshot.timer_infos {
            state.timer_infos.insert(
                k.clone(),
                v.to_json()
                    .map_err(|e| EngineError::Internal(format!("timer blob: {e}")))?,
            );
        }
        for (k, v) in &snapshot.child_execution_infos {
            state.child_execution_infos.insert(
                *k,
                v.to_json()
                    .map_err(|e| EngineError::Internal(format!("child blob: {e}")))?,
            );
        }
        for (k, v) in &snapshot.request_cancel_infos {
            state.request_cancel_infos.insert(
                *k,
                v.to_json()
                    .map_err(|e| EngineError::Internal(format!("cancel blob: {e}")))?,
            );
        }
        for (k, v) in &snapshot.signal_infos {
            state.signal_infos.insert(
                *k,
                v.to_json()
                    .map_err(|e| EngineError::Internal(format!("signal blob: {e}")))?,
            );
        }
        for blob in &snapshot.buffered_events {
            state.buffered_events.push(
                blob.to_json()
                    .map_err(|e| EngineError::Internal(format!("buffered event blob: {e}")))?,
            );
        }
        for (k, v) in &snapshot.chasm_nodes {
            state.chasm_nodes.insert(k.clone(), v.data.clone());
        }

        if !snapshot.checksum.is_empty() {
            let computed = state.checksum()?;
            if computed != snapshot.checksum.data {
                return Err(EngineError::Internal(format!(
                    "mutable state checksum mismatch for {}",
                    state.workflow_key
                )));
            }
        }
        Ok(state)
    }

    /// Rough in-memory footprint, used by the size-bounded cache.
    pub fn estimated_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        let events: usize = self.buffered_events.iter().map(|e| e.estimated_size()).sum();
        let chasm: usize = self.chasm_nodes.values().map(Vec::len).sum();
        base + events
            + chasm
            + self.activity_infos.len() * std::mem::size_of::<ActivityInfo>()
            + self.timer_infos.len() * std::mem::size_of::<TimerInfo>()
    }
}

/// The fields covered by the checksum. Buffered events and the speculative
/// marker are transient and excluded.
#[derive(Serialize)]
struct ChecksumView<'a> {
    execution_info: &'a ExecutionInfo,
    execution_state: &'a ExecutionState,
    next_event_id: i64,
    activity_ids: Vec<i64>,
    timer_ids: Vec<&'a String>,
    child_ids: Vec<i64>,
    version_histories: &'a VersionHistories,
    transition_history: &'a TransitionHistory,
}

impl<'a> ChecksumView<'a> {
    fn of(state: &'a MutableState) -> Self {
        let mut activity_ids: Vec<i64> = state.activity_infos.keys().copied().collect();
        activity_ids.sort_unstable();
        let mut timer_ids: Vec<&String> = state.timer_infos.keys().collect();
        timer_ids.sort();
        let mut child_ids: Vec<i64> = state.child_execution_infos.keys().copied().collect();
        child_ids.sort_unstable();
        Self {
            execution_info: &state.execution_info,
            execution_state: &state.execution_state,
            next_event_id: state.next_event_id,
            activity_ids,
            timer_ids,
            child_ids,
            version_histories: &state.version_histories,
            transition_history: &state.transition_history,
        }
    }
}

fn json_blob<T: Serialize>(value: &T) -> Result<Blob> {
    Ok(Blob {
        data: serde_json::to_vec(value).map_err(|e| EngineError::Internal(e.to_string()))?,
        encoding: "json/plain".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> MutableState {
        let key = WorkflowKey::new(Uuid::new_v4(), "wf-1", Uuid::new_v4());
        MutableState::new_run(
            key,
            "create-req-1".into(),
            "default-queue".into(),
            vec![1, 2, 3],
            Utc::now(),
        )
    }

    fn signal_event() -> HistoryEvent {
        HistoryEvent {
            event_id: 0,
            event_type: EventType::WorkflowExecutionSignaled,
            version: 1,
            event_time: Utc::now(),
            attributes: serde_json::json!({"signal_name": "go"}),
        }
    }

    #[test]
    fn next_event_id_tracks_appends() {
        let mut state = new_state();
        assert_eq!(state.next_event_id, 1);
        let first = state
            .add_event(EventType::WorkflowExecutionStarted, serde_json::json!({}), 1, Utc::now())
            .unwrap();
        assert_eq!(first.event_id, 1);
        let second = state
            .add_event(EventType::WorkflowTaskScheduled, serde_json::json!({}), 1, Utc::now())
            .unwrap();
        assert_eq!(second.event_id, 2);
        assert_eq!(state.next_event_id, 3);
        // the version history current branch tracked the last id
        assert_eq!(
            state.version_histories.current().unwrap().last_item().unwrap().event_id,
            2
        );
    }

    #[test]
    fn buffered_events_respect_count_cap() {
        let mut state = new_state();
        let limits = BufferedEventLimits {
            max_count: 2,
            max_bytes: 1 << 20,
        };
        state.buffer_event(signal_event(), limits).unwrap();
        state.buffer_event(signal_event(), limits).unwrap();
        let err = state.buffer_event(signal_event(), limits).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[test]
    fn buffered_events_respect_byte_cap() {
        let mut state = new_state();
        let limits = BufferedEventLimits {
            max_count: 100,
            max_bytes: signal_event().estimated_size() + 10,
        };
        state.buffer_event(signal_event(), limits).unwrap();
        let err = state.buffer_event(signal_event(), limits).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[test]
    fn flush_assigns_ids_in_arrival_order() {
        let mut state = new_state();
        state
            .add_event(EventType::WorkflowExecutionStarted, serde_json::json!({}), 1, Utc::now())
            .unwrap();
        let limits = BufferedEventLimits {
            max_count: 10,
            max_bytes: 1 << 20,
        };
        state.buffer_event(signal_event(), limits).unwrap();
        state.buffer_event(signal_event(), limits).unwrap();

        let flushed = state.flush_buffered_events(1).unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].event_id, 2);
        assert_eq!(flushed[1].event_id, 3);
        assert!(state.buffered_events.is_empty());
        assert_eq!(state.next_event_id, 4);
    }

    #[test]
    fn last_write_version_falls_back_to_transitions() {
        let mut state = new_state();
        // no events, no transitions: no version
        assert!(state.last_write_version().is_err());

        // a versioned transition without events (component-only run)
        state.record_transition(7).unwrap();
        assert_eq!(state.last_write_version().unwrap(), 7);

        // events take precedence
        state
            .add_event(EventType::WorkflowExecutionStarted, serde_json::json!({}), 9, Utc::now())
            .unwrap();
        assert_eq!(state.last_write_version().unwrap(), 9);
    }

    #[test]
    fn pending_limits_fail_the_offending_command() {
        let mut state = new_state();
        for i in 0..3 {
            state
                .add_activity(
                    ActivityInfo {
                        scheduled_event_id: i,
                        started_event_id: 0,
                        activity_id: format!("a{i}"),
                        task_queue: "q".into(),
                        attempt: 1,
                        last_heartbeat_time: None,
                        version: 1,
                    },
                    3,
                )
                .unwrap();
        }
        let err = state
            .add_activity(
                ActivityInfo {
                    scheduled_event_id: 99,
                    started_event_id: 0,
                    activity_id: "a99".into(),
                    task_queue: "q".into(),
                    attempt: 1,
                    last_heartbeat_time: None,
                    version: 1,
                },
                3,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[test]
    fn close_requires_terminal_status_and_is_idempotent_guarded() {
        let mut state = new_state();
        assert!(state.close(WorkflowStatus::Running).is_err());
        state.close(WorkflowStatus::Completed).unwrap();
        assert_eq!(state.execution_state.state, WorkflowState::Completed);
        assert!(state.close(WorkflowStatus::Failed).is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_state() {
        let mut state = new_state();
        state
            .add_event(EventType::WorkflowExecutionStarted, serde_json::json!({}), 1, Utc::now())
            .unwrap();
        state.record_transition(1).unwrap();
        state
            .add_activity(
                ActivityInfo {
                    scheduled_event_id: 2,
                    started_event_id: 0,
                    activity_id: "a1".into(),
                    task_queue: "q".into(),
                    attempt: 1,
                    last_heartbeat_time: None,
                    version: 1,
                },
                10,
            )
            .unwrap();
        state.signal_requested_ids.insert("sig-1".into());
        state.chasm_nodes.insert("root/child".into(), vec![9, 9]);

        let snapshot = state.to_snapshot().unwrap();
        assert_eq!(snapshot.next_event_id, state.next_event_id);

        let restored = MutableState::from_snapshot(state.workflow_key.clone(), &snapshot).unwrap();
        assert_eq!(restored.next_event_id, state.next_event_id);
        assert_eq!(restored.activity_infos, state.activity_infos);
        assert_eq!(restored.signal_requested_ids, state.signal_requested_ids);
        assert_eq!(restored.chasm_nodes, state.chasm_nodes);
        assert_eq!(restored.transition_history, state.transition_history);
        assert_eq!(restored.version_histories, state.version_histories);
    }

    #[test]
    fn corrupted_snapshot_fails_checksum() {
        let state = new_state();
        let mut snapshot = state.to_snapshot().unwrap();
        snapshot.next_event_id += 5;
        let err = MutableState::from_snapshot(state.workflow_key.clone(), &snapshot).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn update_limits() {
        let mut state = new_state();
        state.begin_update(2, 100).unwrap();
        state.begin_update(2, 100).unwrap();
        // in-flight bound
        let err = state.begin_update(2, 100).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));

        state.complete_update();
        state.begin_update(2, 100).unwrap();

        // lifetime bound
        state.total_updates = 100;
        state.complete_update();
        let err = state.begin_update(2, 100).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[test]
    fn speculative_task_discard_threshold() {
        let mut state = new_state();
        assert!(!state.can_discard_speculative_task(10));
        state.speculative_task = Some(SpeculativeTaskInfo {
            shipped_event_count: 3,
        });
        assert!(state.can_discard_speculative_task(10));
        assert!(!state.can_discard_speculative_task(3));
    }
}
