// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task-queue user data.
//!
//! Versioning rules and deployment data ride on a versioned user-data blob
//! attached to the task-queue family (stored on the root partition's row).
//! Non-root partitions and workers long-poll for a version newer than the
//! one they hold; the manager wakes waiters whenever a write lands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use weft_persistence::store::MatchingTaskStore;
use weft_persistence::types::{Blob, TaskQueueType, TaskQueueUserData};

use crate::error::{MatchingError, Result};
use crate::versioning::VersioningData;

/// Manages the user data of one task-queue family.
pub struct UserDataManager {
    store: Arc<dyn MatchingTaskStore>,
    namespace_id: Uuid,
    name: String,
    task_type: TaskQueueType,
    // latest known version, for waking long-polls
    version_tx: watch::Sender<i64>,
}

impl UserDataManager {
    /// Create a manager and prime it from the store.
    pub async fn new(
        store: Arc<dyn MatchingTaskStore>,
        namespace_id: Uuid,
        name: impl Into<String>,
        task_type: TaskQueueType,
    ) -> Result<Self> {
        let name = name.into();
        let current = store
            .get_task_queue_user_data(namespace_id, &name, task_type)
            .await?;
        let (version_tx, _) = watch::channel(current.version);
        Ok(Self {
            store,
            namespace_id,
            name,
            task_type,
            version_tx,
        })
    }

    /// Read the current user data.
    pub async fn get(&self) -> Result<TaskQueueUserData> {
        let data = self
            .store
            .get_task_queue_user_data(self.namespace_id, &self.name, self.task_type)
            .await?;
        let _ = self.version_tx.send_if_modified(|v| {
            if data.version > *v {
                *v = data.version;
                true
            } else {
                false
            }
        });
        Ok(data)
    }

    /// Long-poll: return as soon as user data newer than `known_version`
    /// exists, or the current data when the wait times out.
    pub async fn get_newer_than(
        &self,
        known_version: i64,
        timeout: Duration,
    ) -> Result<TaskQueueUserData> {
        let current = self.get().await?;
        if current.version > known_version {
            return Ok(current);
        }
        let mut receiver = self.version_tx.subscribe();
        let wait = async {
            loop {
                if *receiver.borrow_and_update() > known_version {
                    return;
                }
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.get().await
    }

    /// Replace the versioning rules, CASing on the version the caller read.
    pub async fn update_versioning(
        &self,
        rules: &VersioningData,
        expected_version: i64,
    ) -> Result<i64> {
        let blob = Blob::from_json(rules).map_err(|e| MatchingError::Internal(e.to_string()))?;
        self.store
            .update_task_queue_user_data(
                self.namespace_id,
                &self.name,
                self.task_type,
                TaskQueueUserData {
                    version: 0,
                    data: blob,
                },
                expected_version,
            )
            .await
            .map_err(|e| match e {
                weft_persistence::StoreError::ConditionFailed(message) => {
                    MatchingError::UserDataConflict(message)
                }
                e => e.into(),
            })?;
        let new_version = expected_version + 1;
        let _ = self.version_tx.send(new_version);
        debug!(
            task_queue = %self.name,
            version = new_version,
            "task queue user data updated"
        );
        Ok(new_version)
    }

    /// Decode the versioning rules out of the current user data.
    pub async fn versioning_data(&self) -> Result<(VersioningData, i64)> {
        let data = self.get().await?;
        if data.data.is_empty() {
            return Ok((VersioningData::default(), data.version));
        }
        let rules: VersioningData = data
            .data
            .to_json()
            .map_err(|e| MatchingError::Internal(e.to_string()))?;
        Ok((rules, data.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weft_persistence::MemoryStore;

    use crate::versioning::AssignmentRule;

    async fn manager() -> UserDataManager {
        UserDataManager::new(
            Arc::new(MemoryStore::new()),
            Uuid::new_v4(),
            "tq",
            TaskQueueType::Workflow,
        )
        .await
        .unwrap()
    }

    fn rules() -> VersioningData {
        VersioningData {
            assignment_rules: vec![AssignmentRule {
                target_build_id: "v2".into(),
                ramp_percentage: 100.0,
                create_time: Utc::now(),
                delete_time: None,
            }],
            redirect_rules: vec![],
        }
    }

    #[tokio::test]
    async fn update_and_read_back() {
        let manager = manager().await;
        let version = manager.update_versioning(&rules(), 0).await.unwrap();
        assert_eq!(version, 1);

        let (read, read_version) = manager.versioning_data().await.unwrap();
        assert_eq!(read_version, 1);
        assert_eq!(read.assignment_rules.len(), 1);
    }

    #[tokio::test]
    async fn stale_cas_is_rejected() {
        let manager = manager().await;
        manager.update_versioning(&rules(), 0).await.unwrap();
        let err = manager.update_versioning(&rules(), 0).await.unwrap_err();
        assert!(matches!(err, MatchingError::UserDataConflict(_)));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_write() {
        let manager = Arc::new(manager().await);
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .get_newer_than(0, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.update_versioning(&rules(), 0).await.unwrap();

        let data = waiter.await.unwrap();
        assert_eq!(data.version, 1);
    }

    #[tokio::test]
    async fn long_poll_times_out_with_current_data() {
        let manager = manager().await;
        let data = manager
            .get_newer_than(0, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(data.version, 0);
    }
}
