// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for history engine integration tests.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use weft_common::config::DynamicConfig;
use weft_common::tasks::WorkflowKey;
use weft_history::config::HistoryConfig;
use weft_history::mutable_state::MutableState;
use weft_history::shard::ShardContext;
use weft_persistence::store::Store;
use weft_persistence::types::BranchInfo;
use weft_persistence::MemoryStore;

/// An acquired shard over a fresh in-memory store.
pub async fn shard_fixture(shard_id: i32) -> (Arc<ShardContext>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn Store> = store.clone();
    let shard = ShardContext::acquire(
        dyn_store,
        HistoryConfig::new(DynamicConfig::new(), 4),
        shard_id,
        "host-a",
    )
    .await
    .expect("shard acquisition");
    (shard, store)
}

/// A running mutable state on a fresh branch.
pub fn running_state(workflow_id: &str) -> (MutableState, Vec<u8>) {
    let branch = BranchInfo::new_tree().to_token().expect("branch token");
    let key = WorkflowKey::new(Uuid::new_v4(), workflow_id, Uuid::new_v4());
    let mut state = MutableState::new_run(
        key,
        format!("create-{workflow_id}"),
        "default-queue".into(),
        branch.clone(),
        Utc::now(),
    );
    state.mark_running();
    (state, branch)
}
