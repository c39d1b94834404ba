// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster metadata.
//!
//! Every cluster in a multi-region deployment is assigned a distinct initial
//! failover version. Failover versions for a cluster are drawn from the
//! arithmetic progression `initial + k * increment`, so a version uniquely
//! identifies the cluster that produced it. The increment must exceed the
//! largest initial version across the connected clusters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static information about one connected cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name, unique across the deployment.
    pub name: String,
    /// First failover version this cluster may produce.
    pub initial_failover_version: i64,
    /// Whether the cluster currently accepts namespace replication.
    pub enabled: bool,
}

/// Errors raised by cluster metadata lookups.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The named cluster is not part of the deployment.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// The version does not belong to any known cluster.
    #[error("failover version {0} does not map to a known cluster")]
    UnknownFailoverVersion(i64),
}

/// Cluster metadata service.
///
/// Immutable after construction; injected into every component that needs to
/// validate cluster names or allocate failover versions.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    current: String,
    master: String,
    failover_version_increment: i64,
    clusters: BTreeMap<String, ClusterInfo>,
}

impl ClusterMetadata {
    /// Build metadata for a deployment.
    ///
    /// `failover_version_increment` must be strictly greater than every
    /// cluster's initial failover version.
    pub fn new(
        current: impl Into<String>,
        master: impl Into<String>,
        failover_version_increment: i64,
        clusters: Vec<ClusterInfo>,
    ) -> Self {
        let clusters = clusters.into_iter().map(|c| (c.name.clone(), c)).collect();
        Self {
            current: current.into(),
            master: master.into(),
            failover_version_increment,
            clusters,
        }
    }

    /// Metadata for a standalone single-cluster deployment.
    pub fn standalone(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            name.clone(),
            name.clone(),
            10,
            vec![ClusterInfo {
                name,
                initial_failover_version: 1,
                enabled: true,
            }],
        )
    }

    /// Name of the cluster this process runs in.
    pub fn current_cluster(&self) -> &str {
        &self.current
    }

    /// Whether this process runs in the master cluster. Global namespace
    /// registration is only served by the master.
    pub fn is_master_cluster(&self) -> bool {
        self.current == self.master
    }

    /// Whether global namespaces are meaningful here (more than one cluster).
    pub fn is_global_namespace_enabled(&self) -> bool {
        self.clusters.len() > 1
    }

    /// All known cluster names, ordered.
    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    /// Whether `name` is a known cluster.
    pub fn is_known_cluster(&self, name: &str) -> bool {
        self.clusters.contains_key(name)
    }

    /// Version spacing between consecutive failovers of one cluster.
    pub fn failover_version_increment(&self) -> i64 {
        self.failover_version_increment
    }

    /// The next failover version for `cluster`, strictly greater than
    /// `current_version`.
    pub fn next_failover_version(
        &self,
        cluster: &str,
        current_version: i64,
    ) -> Result<i64, ClusterError> {
        let info = self
            .clusters
            .get(cluster)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster.to_string()))?;
        let initial = info.initial_failover_version;
        if current_version < initial {
            return Ok(initial);
        }
        let cycles = (current_version - initial) / self.failover_version_increment + 1;
        Ok(initial + cycles * self.failover_version_increment)
    }

    /// Map a failover version back to the cluster that produced it.
    pub fn cluster_for_failover_version(&self, version: i64) -> Result<&str, ClusterError> {
        if version < 0 {
            return Err(ClusterError::UnknownFailoverVersion(version));
        }
        let remainder = version % self.failover_version_increment;
        self.clusters
            .values()
            .find(|c| c.initial_failover_version % self.failover_version_increment == remainder)
            .map(|c| c.name.as_str())
            .ok_or(ClusterError::UnknownFailoverVersion(version))
    }
}
