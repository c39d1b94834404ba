// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace admin operations.
//!
//! Register, update (including failover and promotion), describe, deprecate,
//! delete and list. Every replicated mutation of a global namespace is
//! published through the [`NamespaceReplicator`] seam after the store write
//! succeeds.
//!
//! Retention bounds: retention must be at least one hour for a local
//! namespace and between one and ninety days for a global one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use weft_common::cluster::ClusterMetadata;
use weft_common::config::{keys, Constraints, DynamicConfig};
use weft_persistence::store::MetadataStore;
use weft_persistence::types::{
    ArchivalState, BadBinaryInfo, FailoverHistoryEntry, ListNamespacesRequest,
    ListNamespacesResponse, NamespaceConfig, NamespaceRecord, NamespaceReplicationConfig,
    NamespaceState, ReplicationState,
};

use crate::error::{NamespaceError, Result};
use crate::namespace::{merge_bad_binaries, merge_namespace_data};
use crate::replication::{NamespaceOperation, NamespaceReplicationMessage, NamespaceReplicator};

const MIN_RETENTION_LOCAL: Duration = Duration::from_secs(60 * 60);
const MIN_RETENTION_GLOBAL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_RETENTION_GLOBAL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Request to register a namespace.
#[derive(Debug, Clone, Default)]
pub struct RegisterNamespaceRequest {
    /// Unique name.
    pub name: String,
    /// Operator description.
    pub description: String,
    /// Operator contact.
    pub owner_email: String,
    /// Workflow retention after close.
    pub retention: Duration,
    /// Free-form key/value data.
    pub data: HashMap<String, String>,
    /// Whether the namespace replicates across clusters.
    pub is_global: bool,
    /// Active cluster; defaults to the current cluster.
    pub active_cluster: Option<String>,
    /// Cluster list; defaults to `[current]`.
    pub clusters: Vec<String>,
    /// History archival toggle; defaults to disabled.
    pub history_archival_state: Option<ArchivalState>,
    /// History archival target.
    pub history_archival_uri: String,
    /// Visibility archival toggle; defaults to disabled.
    pub visibility_archival_state: Option<ArchivalState>,
    /// Visibility archival target.
    pub visibility_archival_uri: String,
}

/// Info fields of an update request.
#[derive(Debug, Clone, Default)]
pub struct UpdateNamespaceInfo {
    /// New description, when set.
    pub description: Option<String>,
    /// New owner email, when set.
    pub owner_email: Option<String>,
    /// Data entries to merge in.
    pub data: HashMap<String, String>,
}

/// Config fields of an update request.
#[derive(Debug, Clone, Default)]
pub struct UpdateNamespaceConfig {
    /// New retention, when set.
    pub retention: Option<Duration>,
    /// New history archival state, when set.
    pub history_archival_state: Option<ArchivalState>,
    /// New history archival target, when set.
    pub history_archival_uri: Option<String>,
    /// New visibility archival state, when set.
    pub visibility_archival_state: Option<ArchivalState>,
    /// New visibility archival target, when set.
    pub visibility_archival_uri: Option<String>,
    /// Bad binaries to merge in (stamped with the handler clock).
    pub bad_binaries: HashMap<String, BadBinaryInfo>,
}

/// Replication fields of an update request.
#[derive(Debug, Clone, Default)]
pub struct UpdateReplicationConfig {
    /// New active cluster; triggers a failover when it differs.
    pub active_cluster: Option<String>,
    /// Replacement cluster list, when non-empty.
    pub clusters: Vec<String>,
    /// New replication state (handover entry/exit), when set.
    pub replication_state: Option<ReplicationState>,
}

/// Request to update a namespace.
#[derive(Debug, Clone, Default)]
pub struct UpdateNamespaceRequest {
    /// Target namespace name.
    pub name: String,
    /// Info updates.
    pub update_info: UpdateNamespaceInfo,
    /// Config updates.
    pub config: UpdateNamespaceConfig,
    /// Replication updates.
    pub replication_config: UpdateReplicationConfig,
    /// Promote a local namespace to global.
    pub promote_namespace: bool,
}

/// Capabilities derived from dynamic config, reported by describe.
#[derive(Debug, Clone, Default)]
pub struct NamespaceCapabilities {
    /// Eager workflow start enabled.
    pub eager_workflow_start: bool,
    /// Synchronous update enabled.
    pub sync_update: bool,
    /// Asynchronous update enabled.
    pub async_update: bool,
}

/// Response of describe.
#[derive(Debug, Clone)]
pub struct DescribeNamespaceResponse {
    /// The namespace record.
    pub record: NamespaceRecord,
    /// Derived capabilities.
    pub capabilities: NamespaceCapabilities,
}

/// The namespace admin handler.
pub struct NamespaceHandler {
    store: Arc<dyn MetadataStore>,
    cluster: Arc<ClusterMetadata>,
    config: Arc<DynamicConfig>,
    replicator: Arc<dyn NamespaceReplicator>,
}

impl NamespaceHandler {
    /// Create a handler.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cluster: Arc<ClusterMetadata>,
        config: Arc<DynamicConfig>,
        replicator: Arc<dyn NamespaceReplicator>,
    ) -> Self {
        Self {
            store,
            cluster,
            config,
            replicator,
        }
    }

    // ------------------------------------------------------------------
    // Register
    // ------------------------------------------------------------------

    /// Register a namespace.
    #[instrument(skip(self, request), fields(namespace = %request.name))]
    pub async fn register_namespace(&self, request: RegisterNamespaceRequest) -> Result<Uuid> {
        if request.name.is_empty() {
            return Err(NamespaceError::invalid("namespace name is required"));
        }
        self.validate_retention(request.retention, request.is_global)?;

        if request.is_global {
            if !self.cluster.is_master_cluster() {
                return Err(NamespaceError::NotMasterCluster {
                    current_cluster: self.cluster.current_cluster().to_string(),
                });
            }
            if !self.cluster.is_global_namespace_enabled() {
                return Err(NamespaceError::invalid(
                    "global namespaces require a multi-cluster deployment",
                ));
            }
        }

        let current = self.cluster.current_cluster().to_string();
        let clusters = if request.clusters.is_empty() {
            vec![current.clone()]
        } else {
            request.clusters.clone()
        };
        let active_cluster = request.active_cluster.clone().unwrap_or_else(|| current.clone());
        self.validate_replication_config(&clusters, &active_cluster, request.is_global)?;

        let failover_version = if request.is_global {
            self.cluster
                .next_failover_version(&active_cluster, 0)
                .map_err(|e| NamespaceError::invalid(e.to_string()))?
        } else {
            0
        };
        let metadata = self.store.get_metadata().await?;

        let record = NamespaceRecord {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            state: NamespaceState::Registered,
            description: request.description,
            owner_email: request.owner_email,
            data: request.data,
            config: NamespaceConfig {
                retention: request.retention,
                history_archival_state: request
                    .history_archival_state
                    .unwrap_or(ArchivalState::Disabled),
                history_archival_uri: request.history_archival_uri,
                visibility_archival_state: request
                    .visibility_archival_state
                    .unwrap_or(ArchivalState::Disabled),
                visibility_archival_uri: request.visibility_archival_uri,
                bad_binaries: HashMap::new(),
                workflow_rules: HashMap::new(),
            },
            replication_config: NamespaceReplicationConfig {
                active_cluster,
                clusters,
                replication_state: ReplicationState::Normal,
                failover_history: Vec::new(),
            },
            is_global: request.is_global,
            config_version: 0,
            failover_version,
            failover_notification_version: metadata.notification_version,
            notification_version: 0,
        };

        self.store.create_namespace(record.clone()).await?;
        info!(
            namespace_id = %record.id,
            is_global = record.is_global,
            "namespace registered"
        );

        if record.is_global {
            self.replicator
                .publish(NamespaceReplicationMessage {
                    operation: NamespaceOperation::Create,
                    record: record.clone(),
                })
                .await?;
        }
        Ok(record.id)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Update a namespace: info/config changes, cluster-list changes,
    /// failover (active-cluster change) and promotion to global.
    #[instrument(skip(self, request), fields(namespace = %request.name))]
    pub async fn update_namespace(&self, request: UpdateNamespaceRequest) -> Result<NamespaceRecord> {
        let metadata = self.store.get_metadata().await?;
        let mut record = self.store.get_namespace_by_name(&request.name).await?;
        let expected_notification_version = record.notification_version;

        let exiting_handover = request.replication_config.replication_state
            == Some(ReplicationState::Normal)
            && record.replication_config.replication_state == ReplicationState::Handover;
        if record.replication_config.replication_state == ReplicationState::Handover
            && !exiting_handover
        {
            return Err(NamespaceError::NotActive {
                namespace: record.name.clone(),
                active_cluster: record.replication_config.active_cluster.clone(),
            });
        }

        let mut config_changed = false;
        let mut replicated_change = false;

        // info
        if let Some(description) = &request.update_info.description {
            record.description = description.clone();
            config_changed = true;
        }
        if let Some(owner_email) = &request.update_info.owner_email {
            record.owner_email = owner_email.clone();
            config_changed = true;
        }
        if !request.update_info.data.is_empty() {
            record.data = merge_namespace_data(&record.data, &request.update_info.data);
            config_changed = true;
        }

        // config
        if let Some(retention) = request.config.retention {
            self.validate_retention(retention, record.is_global || request.promote_namespace)?;
            record.config.retention = retention;
            config_changed = true;
        }
        if let Some(state) = request.config.history_archival_state {
            record.config.history_archival_state = state;
            config_changed = true;
        }
        if let Some(uri) = &request.config.history_archival_uri {
            record.config.history_archival_uri = uri.clone();
            config_changed = true;
        }
        if let Some(state) = request.config.visibility_archival_state {
            record.config.visibility_archival_state = state;
            config_changed = true;
        }
        if let Some(uri) = &request.config.visibility_archival_uri {
            record.config.visibility_archival_uri = uri.clone();
            config_changed = true;
        }
        if !request.config.bad_binaries.is_empty() {
            record.config.bad_binaries = merge_bad_binaries(
                &record.config.bad_binaries,
                &request.config.bad_binaries,
                Utc::now(),
            );
            config_changed = true;
        }

        // promote local -> global; clusters and config version stay put
        if request.promote_namespace {
            if record.is_global {
                return Err(NamespaceError::invalid("namespace is already global"));
            }
            if !self.cluster.is_global_namespace_enabled() {
                return Err(NamespaceError::invalid(
                    "global namespaces require a multi-cluster deployment",
                ));
            }
            record.is_global = true;
            record.failover_version = self
                .cluster
                .next_failover_version(
                    &record.replication_config.active_cluster,
                    record.failover_version,
                )
                .map_err(|e| NamespaceError::invalid(e.to_string()))?;
            replicated_change = true;
        }

        // cluster list
        if !request.replication_config.clusters.is_empty() {
            let clusters = request.replication_config.clusters.clone();
            let active = request
                .replication_config
                .active_cluster
                .clone()
                .unwrap_or_else(|| record.replication_config.active_cluster.clone());
            self.validate_replication_config(&clusters, &active, record.is_global)?;
            record.replication_config.clusters = clusters;
            config_changed = true;
        }

        // failover: active cluster change
        if let Some(new_active) = &request.replication_config.active_cluster {
            if *new_active != record.replication_config.active_cluster {
                if !record.is_global {
                    return Err(NamespaceError::invalid(
                        "cannot change the active cluster of a local namespace",
                    ));
                }
                if !record
                    .replication_config
                    .clusters
                    .iter()
                    .any(|c| c == new_active)
                {
                    return Err(NamespaceError::invalid(format!(
                        "cluster '{new_active}' is not in the namespace's cluster list"
                    )));
                }
                let failover_version = self
                    .cluster
                    .next_failover_version(new_active, record.failover_version)
                    .map_err(|e| NamespaceError::invalid(e.to_string()))?;
                record.replication_config.active_cluster = new_active.clone();
                record.failover_version = failover_version;
                self.append_failover_history(&mut record, failover_version);
                replicated_change = true;
            }
        }

        // handover entry/exit
        if let Some(state) = request.replication_config.replication_state {
            if state != record.replication_config.replication_state {
                if !record.is_global {
                    return Err(NamespaceError::invalid(
                        "replication state only applies to global namespaces",
                    ));
                }
                record.replication_config.replication_state = state;
                replicated_change = true;
            }
        }

        if config_changed {
            record.config_version += 1;
        }
        if replicated_change {
            record.failover_notification_version = metadata.notification_version;
        }

        self.store
            .update_namespace(record.clone(), expected_notification_version)
            .await?;
        info!(
            namespace_id = %record.id,
            config_version = record.config_version,
            failover_version = record.failover_version,
            "namespace updated"
        );

        if record.is_global && (replicated_change || config_changed) {
            self.replicator
                .publish(NamespaceReplicationMessage {
                    operation: NamespaceOperation::Update,
                    record: record.clone(),
                })
                .await?;
        }
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Describe / deprecate / delete / list
    // ------------------------------------------------------------------

    /// Describe a namespace, including capabilities from dynamic config.
    pub async fn describe_namespace(&self, name: &str) -> Result<DescribeNamespaceResponse> {
        let record = self.store.get_namespace_by_name(name).await?;
        let scope = Constraints::namespace(name);
        let capabilities = NamespaceCapabilities {
            eager_workflow_start: self
                .config
                .get_bool("frontend.enableEagerWorkflowStart", &scope, true),
            sync_update: self
                .config
                .get_bool("frontend.enableUpdateWorkflowExecution", &scope, true),
            async_update: self.config.get_bool(
                "frontend.enableUpdateWorkflowExecutionAsyncAccepted",
                &scope,
                true,
            ),
        };
        Ok(DescribeNamespaceResponse {
            record,
            capabilities,
        })
    }

    /// Mark a namespace deprecated; no new workflows may start.
    #[instrument(skip(self))]
    pub async fn deprecate_namespace(&self, name: &str) -> Result<()> {
        let mut record = self.store.get_namespace_by_name(name).await?;
        let expected = record.notification_version;
        record.state = NamespaceState::Deprecated;
        record.config_version += 1;
        self.store.update_namespace(record.clone(), expected).await?;
        if record.is_global {
            self.replicator
                .publish(NamespaceReplicationMessage {
                    operation: NamespaceOperation::Update,
                    record,
                })
                .await?;
        }
        Ok(())
    }

    /// Mark a namespace deleted. The row is retained so peers converge; the
    /// registry stops serving it on the next refresh.
    #[instrument(skip(self))]
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut record = self.store.get_namespace_by_name(name).await?;
        let expected = record.notification_version;
        record.state = NamespaceState::Deleted;
        self.store.update_namespace(record.clone(), expected).await?;
        if record.is_global {
            self.replicator
                .publish(NamespaceReplicationMessage {
                    operation: NamespaceOperation::Delete,
                    record,
                })
                .await?;
        }
        Ok(())
    }

    /// Page through namespaces.
    pub async fn list_namespaces(
        &self,
        page_size: usize,
        next_page_token: Option<Vec<u8>>,
    ) -> Result<ListNamespacesResponse> {
        Ok(self
            .store
            .list_namespaces(ListNamespacesRequest {
                page_size,
                next_page_token,
                include_deleted: false,
            })
            .await?)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn validate_retention(&self, retention: Duration, is_global: bool) -> Result<()> {
        if retention.is_zero() {
            return Err(NamespaceError::invalid("retention must be positive"));
        }
        if is_global {
            if retention < MIN_RETENTION_GLOBAL {
                return Err(NamespaceError::invalid(
                    "retention of a global namespace must be at least one day",
                ));
            }
            if retention > MAX_RETENTION_GLOBAL {
                return Err(NamespaceError::invalid(
                    "retention of a global namespace must be at most ninety days",
                ));
            }
        } else if retention < MIN_RETENTION_LOCAL {
            return Err(NamespaceError::invalid(
                "retention must be at least one hour",
            ));
        }
        Ok(())
    }

    fn validate_replication_config(
        &self,
        clusters: &[String],
        active_cluster: &str,
        is_global: bool,
    ) -> Result<()> {
        if clusters.is_empty() {
            return Err(NamespaceError::invalid("cluster list must not be empty"));
        }
        for cluster in clusters {
            if !self.cluster.is_known_cluster(cluster) {
                return Err(NamespaceError::invalid(format!(
                    "unknown cluster '{cluster}'"
                )));
            }
        }
        if !clusters.iter().any(|c| c == active_cluster) {
            return Err(NamespaceError::invalid(format!(
                "active cluster '{active_cluster}' is not in the cluster list"
            )));
        }
        if !is_global {
            let current = self.cluster.current_cluster();
            if clusters.len() != 1 || clusters[0] != current {
                return Err(NamespaceError::invalid(format!(
                    "a local namespace must live only in the current cluster '{current}'"
                )));
            }
        }
        Ok(())
    }

    fn append_failover_history(&self, record: &mut NamespaceRecord, failover_version: i64) {
        let cap = self.config.get_int(
            keys::FAILOVER_HISTORY_MAX_SIZE,
            &Constraints::default(),
            keys::FAILOVER_HISTORY_MAX_SIZE_DEFAULT,
        ) as usize;
        let history = &mut record.replication_config.failover_history;
        history.push(FailoverHistoryEntry {
            failover_time: Utc::now(),
            failover_version,
        });
        while history.len() > cap {
            history.remove(0);
        }
    }
}
