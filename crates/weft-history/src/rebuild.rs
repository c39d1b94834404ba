// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable-state rebuild.
//!
//! Reconstructs a run's mutable state from its persisted snapshot and the
//! history on its current branch, then writes it back. Used by the admin
//! surface to repair drifted state. The rebuild preserves the run's version
//! histories, transition count and execution state identity; only the state
//! record's start time may move forward.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use weft_common::tasks::WorkflowKey;
use weft_persistence::store::{ExecutionStore, HistoryStore};
use weft_persistence::types::ReadHistoryBranchRequest;

use crate::error::{EngineError, Result};
use crate::mutable_state::MutableState;
use crate::shard::ShardContext;

/// Rebuild one run's mutable state in place. Returns the rebuilt state.
pub async fn rebuild_mutable_state(
    shard: &Arc<ShardContext>,
    workflow_key: &WorkflowKey,
    now: DateTime<Utc>,
) -> Result<MutableState> {
    let stored = shard
        .with_io_timeout(shard.store().get_workflow_execution(shard.shard_id, workflow_key))
        .await?;
    let original = MutableState::from_snapshot(workflow_key.clone(), &stored.snapshot)?;

    let mut rebuilt = original.clone();

    // recount history from the current branch; event counters and sizes are
    // derived state and may have drifted
    let branch_token = rebuilt
        .version_histories
        .current()
        .map_err(|e| EngineError::Internal(e.to_string()))?
        .branch_token
        .clone();
    let mut event_count: i64 = 0;
    let mut size_bytes: i64 = 0;
    let mut highest_event_id: i64 = 0;
    let mut next_page_token = None;
    loop {
        let page = shard
            .with_io_timeout(shard.store().read_history_branch(ReadHistoryBranchRequest {
                branch_token: branch_token.clone(),
                min_node_id: 0,
                max_node_id: i64::MAX,
                page_size: 256,
                next_page_token,
            }))
            .await?;
        for node in &page.nodes {
            event_count += node.event_count;
            size_bytes += node.events.len() as i64;
            highest_event_id = highest_event_id.max(node.node_id + node.event_count - 1);
        }
        match page.next_page_token {
            Some(token) => next_page_token = Some(token),
            None => break,
        }
    }
    rebuilt.execution_info.history_event_count = event_count;
    rebuilt.execution_info.history_size_bytes = size_bytes;
    if highest_event_id > 0 && highest_event_id + 1 != rebuilt.next_event_id {
        return Err(EngineError::Internal(format!(
            "run {workflow_key} history ends at {highest_event_id} but next event id is {}",
            rebuilt.next_event_id
        )));
    }

    // only the state record's start time may move forward
    if let Some(start) = rebuilt.execution_state.start_time {
        if now > start {
            rebuilt.execution_state.start_time = Some(now);
        }
    }

    let snapshot = rebuilt.to_snapshot()?;
    shard
        .with_io_timeout(shard.store().set_workflow_execution(
            shard.shard_id,
            workflow_key,
            snapshot,
            stored.record_version,
        ))
        .await?;
    info!(workflow = %workflow_key, events = event_count, "mutable state rebuilt");
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_common::config::DynamicConfig;
    use weft_persistence::store::Store;
    use weft_persistence::types::{BranchInfo, CreateWorkflowMode};
    use weft_persistence::MemoryStore;

    use crate::config::HistoryConfig;
    use crate::mutable_state::events::EventType;
    use crate::transaction::{EventBatch, EventBlobCache, WorkflowTransaction};

    #[tokio::test]
    async fn rebuild_preserves_identity_and_histories() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let shard = ShardContext::acquire(
            dyn_store,
            HistoryConfig::new(DynamicConfig::new(), 4),
            1,
            "host-a",
        )
        .await
        .unwrap();

        let branch = BranchInfo::new_tree().to_token().unwrap();
        let key = WorkflowKey::new(Uuid::new_v4(), "wf-1", Uuid::new_v4());
        let mut state = MutableState::new_run(
            key.clone(),
            "req-1".into(),
            "queue".into(),
            branch.clone(),
            Utc::now(),
        );
        state.mark_running();
        state.record_transition(1).unwrap();
        let event = state
            .add_event(
                EventType::WorkflowExecutionStarted,
                serde_json::json!({}),
                1,
                Utc::now(),
            )
            .unwrap();

        let txn = WorkflowTransaction::new(shard.clone(), EventBlobCache::new(1 << 20));
        txn.create_workflow(
            &state,
            CreateWorkflowMode::BrandNew,
            vec![EventBatch {
                branch_token: branch,
                events: vec![event],
                is_new_branch: true,
            }],
            vec![],
        )
        .await
        .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        let first = rebuild_mutable_state(&shard, &key, later).await.unwrap();
        // re-running preserves the protected fields
        let even_later = later + chrono::Duration::seconds(30);
        let second = rebuild_mutable_state(&shard, &key, even_later).await.unwrap();

        assert_eq!(first.version_histories, second.version_histories);
        assert_eq!(
            first.transition_history.transition_count(),
            second.transition_history.transition_count()
        );
        assert_eq!(
            first.execution_state.create_request_id,
            second.execution_state.create_request_id
        );
        assert_eq!(first.execution_state.run_id, second.execution_state.run_id);
        assert_eq!(first.execution_state.state, second.execution_state.state);
        assert_eq!(first.execution_state.status, second.execution_state.status);
        assert_eq!(
            first.execution_state.last_update_versioned_transition,
            second.execution_state.last_update_versioned_transition
        );
        // only the start time moved forward
        assert!(second.execution_state.start_time >= first.execution_state.start_time);
        assert_eq!(first.next_event_id, second.next_event_id);
    }

    #[tokio::test]
    async fn rebuild_rejects_history_gap() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let shard = ShardContext::acquire(
            dyn_store,
            HistoryConfig::new(DynamicConfig::new(), 4),
            1,
            "host-a",
        )
        .await
        .unwrap();

        let branch = BranchInfo::new_tree().to_token().unwrap();
        let key = WorkflowKey::new(Uuid::new_v4(), "wf-1", Uuid::new_v4());
        let mut state = MutableState::new_run(
            key.clone(),
            "req-1".into(),
            "queue".into(),
            branch.clone(),
            Utc::now(),
        );
        state.mark_running();
        let event = state
            .add_event(
                EventType::WorkflowExecutionStarted,
                serde_json::json!({}),
                1,
                Utc::now(),
            )
            .unwrap();
        // claim more events than the branch holds
        state.next_event_id += 5;

        let txn = WorkflowTransaction::new(shard.clone(), EventBlobCache::new(1 << 20));
        txn.create_workflow(
            &state,
            CreateWorkflowMode::BrandNew,
            vec![EventBatch {
                branch_token: branch,
                events: vec![event],
                is_new_branch: true,
            }],
            vec![],
        )
        .await
        .unwrap();

        let err = rebuild_mutable_state(&shard, &key, Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
