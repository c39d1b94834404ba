// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication dead-letter queue.
//!
//! Failed replication tasks land in a per-source-cluster queue-v2 message
//! log with the metadata needed for manual replay: the task itself, the
//! source cluster, the attempt count and the last error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_common::tasks::Task;
use weft_persistence::store::QueueV2Store;
use weft_persistence::types::{Blob, QueueV2Kind};

use crate::error::{ReplicationError, Result};

/// One dead-lettered replication task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The failed task.
    pub task: Task,
    /// Cluster the task came from.
    pub source_cluster: String,
    /// Apply attempts made before dead-lettering.
    pub attempts: u32,
    /// Last apply error.
    pub last_error: String,
    /// When the task was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Per-source-cluster dead-letter queue over queue v2.
pub struct ReplicationDlq {
    store: Arc<dyn QueueV2Store>,
}

impl ReplicationDlq {
    /// Wrap the queue-v2 store.
    pub fn new(store: Arc<dyn QueueV2Store>) -> Self {
        Self { store }
    }

    fn queue_name(source_cluster: &str) -> String {
        format!("replication-dlq-{source_cluster}")
    }

    /// Dead-letter one task. Returns the message id.
    pub async fn enqueue(
        &self,
        task: Task,
        source_cluster: &str,
        attempts: u32,
        last_error: &str,
    ) -> Result<i64> {
        let name = Self::queue_name(source_cluster);
        let entry = DeadLetterEntry {
            task,
            source_cluster: source_cluster.to_string(),
            attempts,
            last_error: last_error.to_string(),
            dead_lettered_at: Utc::now(),
        };
        let payload =
            Blob::from_json(&entry).map_err(|e| ReplicationError::Internal(e.to_string()))?;
        self.store
            .create_queue(QueueV2Kind::ReplicationDlq, &name)
            .await?;
        Ok(self
            .store
            .enqueue_message(QueueV2Kind::ReplicationDlq, &name, payload)
            .await?)
    }

    /// Read dead letters of a source cluster starting at `min_message_id`.
    pub async fn read(
        &self,
        source_cluster: &str,
        min_message_id: i64,
        page_size: usize,
    ) -> Result<Vec<(i64, DeadLetterEntry)>> {
        let name = Self::queue_name(source_cluster);
        let response = self
            .store
            .read_messages(QueueV2Kind::ReplicationDlq, &name, min_message_id, page_size)
            .await?;
        response
            .messages
            .into_iter()
            .map(|m| {
                let entry: DeadLetterEntry = m
                    .payload
                    .to_json()
                    .map_err(|e| ReplicationError::Internal(e.to_string()))?;
                Ok((m.id, entry))
            })
            .collect()
    }

    /// Delete dead letters up to and including `inclusive_max_message_id`
    /// (after a successful manual replay).
    pub async fn purge(&self, source_cluster: &str, inclusive_max_message_id: i64) -> Result<()> {
        let name = Self::queue_name(source_cluster);
        self.store
            .range_delete_messages(QueueV2Kind::ReplicationDlq, &name, inclusive_max_message_id)
            .await?;
        Ok(())
    }

    /// Source clusters with dead letters.
    pub async fn list_sources(&self) -> Result<Vec<String>> {
        let names = self.store.list_queues(QueueV2Kind::ReplicationDlq).await?;
        Ok(names
            .into_iter()
            .filter_map(|n| n.strip_prefix("replication-dlq-").map(String::from))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_common::tasks::{TaskAttributes, TaskKey, WorkflowKey};
    use weft_persistence::MemoryStore;

    fn task(id: i64) -> Task {
        Task {
            shard_id: 1,
            key: TaskKey::immediate(id),
            workflow_key: WorkflowKey::new(Uuid::new_v4(), "wf", Uuid::new_v4()),
            version: 3,
            destination: None,
            attributes: TaskAttributes::SyncWorkflowState {
                first_event_id: 1,
                next_event_id: 5,
                version: 3,
            },
        }
    }

    #[tokio::test]
    async fn round_trip_with_replay_metadata() {
        let dlq = ReplicationDlq::new(Arc::new(MemoryStore::new()));
        dlq.enqueue(task(7), "c2", 5, "apply failed: boom")
            .await
            .unwrap();

        let entries = dlq.read("c2", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let (_, entry) = &entries[0];
        assert_eq!(entry.task.key.task_id, 7);
        assert_eq!(entry.source_cluster, "c2");
        assert_eq!(entry.attempts, 5);
        assert!(entry.last_error.contains("boom"));
    }

    #[tokio::test]
    async fn queues_are_per_source_cluster() {
        let dlq = ReplicationDlq::new(Arc::new(MemoryStore::new()));
        dlq.enqueue(task(1), "c2", 1, "x").await.unwrap();
        dlq.enqueue(task(2), "c3", 1, "y").await.unwrap();

        assert_eq!(dlq.read("c2", 0, 10).await.unwrap().len(), 1);
        assert_eq!(dlq.read("c3", 0, 10).await.unwrap().len(), 1);

        let mut sources = dlq.list_sources().await.unwrap();
        sources.sort();
        assert_eq!(sources, vec!["c2".to_string(), "c3".to_string()]);
    }

    #[tokio::test]
    async fn purge_removes_replayed_entries() {
        let dlq = ReplicationDlq::new(Arc::new(MemoryStore::new()));
        let first = dlq.enqueue(task(1), "c2", 1, "x").await.unwrap();
        dlq.enqueue(task(2), "c2", 1, "y").await.unwrap();

        dlq.purge("c2", first).await.unwrap();
        let remaining = dlq.read("c2", 0, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.task.key.task_id, 2);
    }
}
