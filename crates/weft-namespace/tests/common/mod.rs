// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for namespace integration tests.

use std::sync::Arc;

use weft_common::cluster::{ClusterInfo, ClusterMetadata};
use weft_common::config::DynamicConfig;
use weft_namespace::handler::NamespaceHandler;
use weft_namespace::replication::RecordingNamespaceReplicator;
use weft_persistence::MemoryStore;

/// Two-cluster deployment with c1 as master and current.
pub fn two_cluster_metadata() -> Arc<ClusterMetadata> {
    Arc::new(ClusterMetadata::new(
        "c1",
        "c1",
        10,
        vec![
            ClusterInfo {
                name: "c1".into(),
                initial_failover_version: 1,
                enabled: true,
            },
            ClusterInfo {
                name: "c2".into(),
                initial_failover_version: 2,
                enabled: true,
            },
        ],
    ))
}

/// A handler over a fresh in-memory store with a recording replicator.
pub fn handler_fixture() -> (
    NamespaceHandler,
    Arc<MemoryStore>,
    Arc<RecordingNamespaceReplicator>,
) {
    handler_fixture_with_cluster(two_cluster_metadata())
}

/// Same as [`handler_fixture`] with explicit cluster metadata.
pub fn handler_fixture_with_cluster(
    cluster: Arc<ClusterMetadata>,
) -> (
    NamespaceHandler,
    Arc<MemoryStore>,
    Arc<RecordingNamespaceReplicator>,
) {
    let store = Arc::new(MemoryStore::new());
    let replicator = Arc::new(RecordingNamespaceReplicator::default());
    let handler = NamespaceHandler::new(
        store.clone(),
        cluster,
        DynamicConfig::new(),
        replicator.clone(),
    );
    (handler, store, replicator)
}
