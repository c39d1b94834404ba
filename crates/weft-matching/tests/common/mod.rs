// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for matching integration tests.

use std::sync::Arc;

use uuid::Uuid;

use weft_common::config::DynamicConfig;
use weft_common::tasks::WorkflowKey;
use weft_matching::config::MatchingConfig;
use weft_matching::partition::PartitionManager;
use weft_persistence::types::{MatchingTask, TaskQueueKey, TaskQueueType};
use weft_persistence::MemoryStore;

/// A workflow partition key.
pub fn queue_key(partition: i32) -> TaskQueueKey {
    TaskQueueKey {
        namespace_id: Uuid::new_v4(),
        name: "orders".into(),
        task_type: TaskQueueType::Workflow,
        partition,
    }
}

/// A spool-ready task.
pub fn matching_task() -> MatchingTask {
    MatchingTask {
        task_id: 0,
        workflow_key: WorkflowKey::new(Uuid::new_v4(), "wf-1", Uuid::new_v4()),
        scheduled_event_id: 3,
        expiry: None,
        assigned_build_id: None,
    }
}

/// Start a partition manager over the store with the given dynamic config.
pub async fn start_partition(
    store: Arc<MemoryStore>,
    dyn_config: Arc<DynamicConfig>,
    key: TaskQueueKey,
) -> Arc<PartitionManager> {
    PartitionManager::start(
        store,
        MatchingConfig::new(dyn_config),
        key,
        "ns1",
        "host-a",
        None,
    )
    .await
    .expect("partition lease")
}
