// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace metadata replication.
//!
//! Metadata mutations of global namespaces ride a dedicated queue-v2 log.
//! The publisher side implements the namespace crate's replicator seam; the
//! applier side drains the queue on the receiving cluster and merges records
//! into the local metadata store.
//!
//! Convergence under concurrent writes is last-writer-wins by failover
//! version, ties broken by failover notification version. A stale incoming
//! record is dropped; an unknown namespace is created.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use weft_namespace::error::{NamespaceError, Result as NamespaceResult};
use weft_namespace::replication::{
    NamespaceOperation, NamespaceReplicationMessage, NamespaceReplicator,
};
use weft_persistence::store::{MetadataStore, QueueV2Store};
use weft_persistence::types::{Blob, NamespaceState, QueueV2Kind};
use weft_persistence::StoreError;

use crate::error::{ReplicationError, Result};

const NAMESPACE_QUEUE: &str = "namespace-replication";

/// Publishes namespace mutations onto the replication queue.
pub struct QueueNamespaceReplicator {
    store: Arc<dyn QueueV2Store>,
}

impl QueueNamespaceReplicator {
    /// Wrap the queue-v2 store.
    pub fn new(store: Arc<dyn QueueV2Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NamespaceReplicator for QueueNamespaceReplicator {
    async fn publish(&self, message: NamespaceReplicationMessage) -> NamespaceResult<()> {
        let payload = Blob::from_json(&message).map_err(|e| NamespaceError::Internal {
            message: e.to_string(),
        })?;
        self.store
            .create_queue(QueueV2Kind::NamespaceReplication, NAMESPACE_QUEUE)
            .await
            .map_err(NamespaceError::from)?;
        self.store
            .enqueue_message(QueueV2Kind::NamespaceReplication, NAMESPACE_QUEUE, payload)
            .await
            .map_err(NamespaceError::from)?;
        debug!(
            namespace = %message.record.name,
            operation = ?message.operation,
            "namespace mutation published"
        );
        Ok(())
    }
}

/// Whether `incoming` supersedes `local` under failover-version ordering.
pub fn supersedes(
    local_failover_version: i64,
    local_failover_notification_version: i64,
    local_config_version: i64,
    incoming_failover_version: i64,
    incoming_failover_notification_version: i64,
    incoming_config_version: i64,
) -> bool {
    if incoming_failover_version != local_failover_version {
        return incoming_failover_version > local_failover_version;
    }
    if incoming_failover_notification_version != local_failover_notification_version {
        return incoming_failover_notification_version > local_failover_notification_version;
    }
    // same failover position: pure config updates move forward
    incoming_config_version > local_config_version
}

/// Applies namespace replication messages on a peer cluster.
pub struct NamespaceReplicationApplier {
    queue: Arc<dyn QueueV2Store>,
    metadata: Arc<dyn MetadataStore>,
}

impl NamespaceReplicationApplier {
    /// Create an applier over the local stores.
    pub fn new(queue: Arc<dyn QueueV2Store>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { queue, metadata }
    }

    /// Drain the queue once: apply every pending message and delete the
    /// applied prefix. Returns the number of messages applied.
    pub async fn drain_once(&self, batch_size: usize) -> Result<usize> {
        self.queue
            .create_queue(QueueV2Kind::NamespaceReplication, NAMESPACE_QUEUE)
            .await?;
        let read = self
            .queue
            .read_messages(QueueV2Kind::NamespaceReplication, NAMESPACE_QUEUE, 0, batch_size)
            .await?;
        if read.messages.is_empty() {
            return Ok(0);
        }
        let mut applied = 0usize;
        let mut last_id = 0i64;
        for message in &read.messages {
            let parsed: NamespaceReplicationMessage = message
                .payload
                .to_json()
                .map_err(|e| ReplicationError::Internal(e.to_string()))?;
            self.apply(parsed).await?;
            applied += 1;
            last_id = message.id;
        }
        self.queue
            .range_delete_messages(QueueV2Kind::NamespaceReplication, NAMESPACE_QUEUE, last_id)
            .await?;
        Ok(applied)
    }

    /// Apply one message to the local metadata store.
    pub async fn apply(&self, message: NamespaceReplicationMessage) -> Result<()> {
        let mut incoming = message.record;
        if message.operation == NamespaceOperation::Delete {
            incoming.state = NamespaceState::Deleted;
        }

        let local = match self.metadata.get_namespace_by_id(incoming.id).await {
            Ok(local) => Some(local),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        match local {
            None => {
                info!(namespace = %incoming.name, "replicated namespace created");
                match self.metadata.create_namespace(incoming).await {
                    Ok(()) => Ok(()),
                    // a concurrent applier won the create; the next message
                    // converges through the update path
                    Err(StoreError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Some(local) => {
                if !supersedes(
                    local.failover_version,
                    local.failover_notification_version,
                    local.config_version,
                    incoming.failover_version,
                    incoming.failover_notification_version,
                    incoming.config_version,
                ) {
                    debug!(
                        namespace = %incoming.name,
                        local_version = local.failover_version,
                        incoming_version = incoming.failover_version,
                        "stale namespace replication dropped"
                    );
                    return Ok(());
                }
                match self
                    .metadata
                    .update_namespace(incoming.clone(), local.notification_version)
                    .await
                {
                    Ok(()) => {
                        info!(
                            namespace = %incoming.name,
                            failover_version = incoming.failover_version,
                            "replicated namespace applied"
                        );
                        Ok(())
                    }
                    // a concurrent local write moved the row; the refresher
                    // re-reads and the next drain converges
                    Err(StoreError::ConditionFailed(message)) => {
                        warn!(namespace = %incoming.name, %message, "namespace apply lost a race");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;
    use weft_persistence::types::{
        ArchivalState, NamespaceConfig, NamespaceRecord, NamespaceReplicationConfig,
        ReplicationState,
    };
    use weft_persistence::MemoryStore;

    fn record(name: &str, failover_version: i64) -> NamespaceRecord {
        NamespaceRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            state: NamespaceState::Registered,
            description: String::new(),
            owner_email: String::new(),
            data: HashMap::new(),
            config: NamespaceConfig {
                retention: Duration::from_secs(86400),
                history_archival_state: ArchivalState::Disabled,
                history_archival_uri: String::new(),
                visibility_archival_state: ArchivalState::Disabled,
                visibility_archival_uri: String::new(),
                bad_binaries: HashMap::new(),
                workflow_rules: HashMap::new(),
            },
            replication_config: NamespaceReplicationConfig {
                active_cluster: "c1".into(),
                clusters: vec!["c1".into(), "c2".into()],
                replication_state: ReplicationState::Normal,
                failover_history: vec![],
            },
            is_global: true,
            config_version: 0,
            failover_version,
            failover_notification_version: 0,
            notification_version: 0,
        }
    }

    #[test]
    fn ordering_is_failover_version_then_notification_then_config() {
        // larger failover version wins
        assert!(supersedes(1, 5, 9, 11, 0, 0));
        assert!(!supersedes(11, 0, 0, 1, 99, 99));
        // ties broken by failover notification version
        assert!(supersedes(11, 3, 0, 11, 4, 0));
        assert!(!supersedes(11, 4, 0, 11, 3, 9));
        // full tie: config version moves forward
        assert!(supersedes(11, 4, 2, 11, 4, 3));
        assert!(!supersedes(11, 4, 3, 11, 4, 3));
    }

    #[tokio::test]
    async fn unknown_namespace_is_created() {
        let store = Arc::new(MemoryStore::new());
        let applier = NamespaceReplicationApplier::new(store.clone(), store.clone());
        applier
            .apply(NamespaceReplicationMessage {
                operation: NamespaceOperation::Create,
                record: record("gns", 2),
            })
            .await
            .unwrap();
        let local = store.get_namespace_by_name("gns").await.unwrap();
        assert_eq!(local.failover_version, 2);
    }

    #[tokio::test]
    async fn stale_update_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let applier = NamespaceReplicationApplier::new(store.clone(), store.clone());

        let mut newer = record("gns", 12);
        newer.replication_config.active_cluster = "c2".into();
        applier
            .apply(NamespaceReplicationMessage {
                operation: NamespaceOperation::Create,
                record: newer.clone(),
            })
            .await
            .unwrap();

        // an older failover arrives late
        let mut stale = newer.clone();
        stale.failover_version = 2;
        stale.replication_config.active_cluster = "c1".into();
        applier
            .apply(NamespaceReplicationMessage {
                operation: NamespaceOperation::Update,
                record: stale,
            })
            .await
            .unwrap();

        let local = store.get_namespace_by_name("gns").await.unwrap();
        assert_eq!(local.failover_version, 12);
        assert_eq!(local.replication_config.active_cluster, "c2");
    }

    #[tokio::test]
    async fn delete_marks_the_namespace_deleted() {
        let store = Arc::new(MemoryStore::new());
        let applier = NamespaceReplicationApplier::new(store.clone(), store.clone());
        applier
            .apply(NamespaceReplicationMessage {
                operation: NamespaceOperation::Create,
                record: record("gns", 2),
            })
            .await
            .unwrap();

        let mut deleted = store.get_namespace_by_name("gns").await.unwrap();
        deleted.failover_version = 12;
        applier
            .apply(NamespaceReplicationMessage {
                operation: NamespaceOperation::Delete,
                record: deleted,
            })
            .await
            .unwrap();

        let local = store.get_namespace_by_name("gns").await.unwrap();
        assert_eq!(local.state, NamespaceState::Deleted);
    }

    #[tokio::test]
    async fn publish_then_drain_converges() {
        // source cluster publishes onto its queue; the peer drains it into
        // its own metadata store
        let source_queue = Arc::new(MemoryStore::new());
        let peer_store = Arc::new(MemoryStore::new());

        let publisher = QueueNamespaceReplicator::new(source_queue.clone());
        publisher
            .publish(NamespaceReplicationMessage {
                operation: NamespaceOperation::Create,
                record: record("gns", 2),
            })
            .await
            .unwrap();

        let applier = NamespaceReplicationApplier::new(source_queue.clone(), peer_store.clone());
        let applied = applier.drain_once(100).await.unwrap();
        assert_eq!(applied, 1);
        assert!(peer_store.get_namespace_by_name("gns").await.is_ok());

        // the drained prefix is gone
        assert_eq!(applier.drain_once(100).await.unwrap(), 0);
    }
}
