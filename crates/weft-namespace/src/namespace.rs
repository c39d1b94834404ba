// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The namespace snapshot type plus merge and validation helpers.
//!
//! [`Namespace`] wraps the persisted record. Registry consumers receive it
//! behind an `Arc` and never mutate it; every change goes through the admin
//! handler, which builds a new record.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use weft_persistence::types::{
    BadBinaryInfo, NamespaceRecord, NamespaceState, ReplicationState, WorkflowRuleInfo,
};

/// Whether workflows of a namespace need cross-cluster replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPolicy {
    /// Local namespace, or global namespace present in a single cluster.
    OneCluster,
    /// Global namespace spanning several clusters.
    MultiCluster,
}

/// An immutable snapshot of one namespace.
#[derive(Debug, Clone)]
pub struct Namespace {
    record: NamespaceRecord,
}

impl Namespace {
    /// Wrap a persisted record.
    pub fn from_record(record: NamespaceRecord) -> Self {
        Self { record }
    }

    /// The underlying record.
    pub fn record(&self) -> &NamespaceRecord {
        &self.record
    }

    /// Namespace id.
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Lifecycle state.
    pub fn state(&self) -> NamespaceState {
        self.record.state
    }

    /// Whether the namespace is replicated across clusters.
    pub fn is_global(&self) -> bool {
        self.record.is_global
    }

    /// The single active (writer) cluster.
    pub fn active_cluster(&self) -> &str {
        &self.record.replication_config.active_cluster
    }

    /// Replication state (normal/handover).
    pub fn replication_state(&self) -> ReplicationState {
        self.record.replication_config.replication_state
    }

    /// Retention after workflow close.
    pub fn retention(&self) -> Duration {
        self.record.config.retention
    }

    /// Config version of the snapshot.
    pub fn config_version(&self) -> i64 {
        self.record.config_version
    }

    /// Failover version of the snapshot.
    pub fn failover_version(&self) -> i64 {
        self.record.failover_version
    }

    /// Whether this cluster is the namespace's active cluster.
    pub fn is_active_in(&self, cluster: &str) -> bool {
        if !self.record.is_global {
            return true;
        }
        self.record.replication_config.active_cluster == cluster
    }

    /// The replication policy, derived from globality and cluster count.
    pub fn replication_policy(&self) -> ReplicationPolicy {
        if self.record.is_global && self.record.replication_config.clusters.len() > 1 {
            ReplicationPolicy::MultiCluster
        } else {
            ReplicationPolicy::OneCluster
        }
    }
}

/// Whether a namespace change must be surfaced to state-change subscribers.
///
/// Anything that can affect whether the namespace is active on this cluster
/// counts: a new or deleted namespace, or a change to state, globality,
/// active cluster, or replication state.
pub fn state_changed(old: Option<&Namespace>, new: &Namespace) -> bool {
    match old {
        None => true,
        Some(old) => {
            old.state() != new.state()
                || old.is_global() != new.is_global()
                || old.active_cluster() != new.active_cluster()
                || old.replication_state() != new.replication_state()
        }
    }
}

/// Merge free-form namespace data. Keys present in `update` override `base`;
/// all other `base` keys survive.
pub fn merge_namespace_data(
    base: &HashMap<String, String>,
    update: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = base.clone();
    for (k, v) in update {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Merge bad-binary maps. Keys present in both are replaced by the update's
/// value; every key taken from `update` is stamped with `now`; keys only in
/// `base` keep their prior create time.
pub fn merge_bad_binaries(
    base: &HashMap<String, BadBinaryInfo>,
    update: &HashMap<String, BadBinaryInfo>,
    now: DateTime<Utc>,
) -> HashMap<String, BadBinaryInfo> {
    let mut merged = base.clone();
    for (k, v) in update {
        let mut stamped = v.clone();
        stamped.create_time = now;
        merged.insert(k.clone(), stamped);
    }
    merged
}

/// Remove the workflow rule with the oldest expiration among those already
/// expired at `now`. Nothing is removed when no rule is expired. Returns the
/// removed rule id.
pub fn remove_oldest_expired_workflow_rule(
    rules: &mut HashMap<String, WorkflowRuleInfo>,
    now: DateTime<Utc>,
) -> Option<String> {
    let oldest = rules
        .values()
        .filter_map(|r| r.expiration_time.map(|exp| (r.rule_id.clone(), exp)))
        .filter(|(_, exp)| *exp <= now)
        .min_by_key(|(_, exp)| *exp)
        .map(|(id, _)| id)?;
    rules.remove(&oldest);
    Some(oldest)
}
