// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dynamic configuration.
//!
//! A [`DynamicConfig`] is a keyed store of typed values with optional
//! constraint scoping. A lookup supplies the key, the caller's
//! [`Constraints`], and a default; the most specific matching override wins,
//! falling back to the default when no override matches. Subsystems resolve
//! their settings on every use, so operators can adjust a running cluster
//! without restarts.
//!
//! Keys are plain strings, namespaced by subsystem
//! (`history.cacheTTL`, `matching.longPollExpirationInterval`, ...). The
//! well-known keys and their defaults live in [`keys`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

/// A typed dynamic-config value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Boolean setting.
    Bool(bool),
    /// Integer setting.
    Int(i64),
    /// Floating-point setting.
    Float(f64),
    /// Duration setting.
    Duration(Duration),
    /// String setting.
    String(String),
    /// Structured setting (maps, lists).
    Json(JsonValue),
}

/// Constraint scope for a lookup or an override.
///
/// An override matches a lookup when every field the override pins equals the
/// corresponding lookup field. More pinned fields means more specific; the
/// most specific matching override wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Namespace name.
    pub namespace: Option<String>,
    /// Task queue name.
    pub task_queue: Option<String>,
    /// Task type within a queue family (workflow/activity/nexus).
    pub task_type: Option<String>,
    /// History shard id.
    pub shard_id: Option<i32>,
    /// Outbound destination.
    pub destination: Option<String>,
}

impl Constraints {
    /// Constraint scope pinned to a namespace.
    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            namespace: Some(name.into()),
            ..Self::default()
        }
    }

    /// Constraint scope pinned to a shard.
    pub fn shard(shard_id: i32) -> Self {
        Self {
            shard_id: Some(shard_id),
            ..Self::default()
        }
    }

    /// Constraint scope pinned to a task queue within a namespace.
    pub fn task_queue(namespace: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            task_queue: Some(task_queue.into()),
            ..Self::default()
        }
    }

    /// Constraint scope pinned to an outbound destination.
    pub fn destination(namespace: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            destination: Some(destination.into()),
            ..Self::default()
        }
    }

    fn specificity(&self) -> usize {
        [
            self.namespace.is_some(),
            self.task_queue.is_some(),
            self.task_type.is_some(),
            self.shard_id.is_some(),
            self.destination.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count()
    }

    fn matches(&self, lookup: &Constraints) -> bool {
        fn field_ok<T: PartialEq>(pinned: &Option<T>, actual: &Option<T>) -> bool {
            match pinned {
                None => true,
                Some(v) => actual.as_ref() == Some(v),
            }
        }
        field_ok(&self.namespace, &lookup.namespace)
            && field_ok(&self.task_queue, &lookup.task_queue)
            && field_ok(&self.task_type, &lookup.task_type)
            && field_ok(&self.shard_id, &lookup.shard_id)
            && field_ok(&self.destination, &lookup.destination)
    }
}

#[derive(Debug, Default)]
struct Overrides {
    // key -> overrides sorted most-specific first
    entries: HashMap<String, Vec<(Constraints, ConfigValue)>>,
}

/// Keyed dynamic configuration store.
///
/// Reads are lock-free in the common no-override case and take a shared lock
/// otherwise. Writes (operator updates) take the exclusive lock.
#[derive(Debug, Default)]
pub struct DynamicConfig {
    overrides: RwLock<Overrides>,
}

impl DynamicConfig {
    /// Create an empty store (all lookups resolve to their defaults).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install or replace an override for `key` under `constraints`.
    pub fn set(&self, key: &str, constraints: Constraints, value: ConfigValue) {
        let mut guard = self.overrides.write();
        let entries = guard.entries.entry(key.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|(c, _)| *c == constraints) {
            existing.1 = value;
            return;
        }
        entries.push((constraints, value));
        entries.sort_by(|a, b| b.0.specificity().cmp(&a.0.specificity()));
    }

    /// Remove every override for `key`.
    pub fn clear(&self, key: &str) {
        self.overrides.write().entries.remove(key);
    }

    fn resolve(&self, key: &str, lookup: &Constraints) -> Option<ConfigValue> {
        let guard = self.overrides.read();
        let entries = guard.entries.get(key)?;
        entries
            .iter()
            .find(|(c, _)| c.matches(lookup))
            .map(|(_, v)| v.clone())
    }

    /// Look up a boolean setting.
    pub fn get_bool(&self, key: &str, lookup: &Constraints, default: bool) -> bool {
        match self.resolve(key, lookup) {
            Some(ConfigValue::Bool(v)) => v,
            _ => default,
        }
    }

    /// Look up an integer setting.
    pub fn get_int(&self, key: &str, lookup: &Constraints, default: i64) -> i64 {
        match self.resolve(key, lookup) {
            Some(ConfigValue::Int(v)) => v,
            _ => default,
        }
    }

    /// Look up a float setting.
    pub fn get_float(&self, key: &str, lookup: &Constraints, default: f64) -> f64 {
        match self.resolve(key, lookup) {
            Some(ConfigValue::Float(v)) => v,
            Some(ConfigValue::Int(v)) => v as f64,
            _ => default,
        }
    }

    /// Look up a duration setting.
    pub fn get_duration(&self, key: &str, lookup: &Constraints, default: Duration) -> Duration {
        match self.resolve(key, lookup) {
            Some(ConfigValue::Duration(v)) => v,
            _ => default,
        }
    }

    /// Look up a string setting.
    pub fn get_string(&self, key: &str, lookup: &Constraints, default: &str) -> String {
        match self.resolve(key, lookup) {
            Some(ConfigValue::String(v)) => v,
            _ => default.to_string(),
        }
    }

    /// Look up a structured setting.
    pub fn get_json(&self, key: &str, lookup: &Constraints, default: JsonValue) -> JsonValue {
        match self.resolve(key, lookup) {
            Some(ConfigValue::Json(v)) => v,
            _ => default,
        }
    }
}

/// Well-known configuration keys and their defaults.
pub mod keys {
    use std::time::Duration;

    /// Mutable-state cache entry TTL.
    pub const HISTORY_CACHE_TTL: &str = "history.cacheTTL";
    /// Default for [`HISTORY_CACHE_TTL`].
    pub const HISTORY_CACHE_TTL_DEFAULT: Duration = Duration::from_secs(3600);

    /// Shard reacquire sweep interval.
    pub const ACQUIRE_SHARD_INTERVAL: &str = "history.acquireShardInterval";
    /// Default for [`ACQUIRE_SHARD_INTERVAL`].
    pub const ACQUIRE_SHARD_INTERVAL_DEFAULT: Duration = Duration::from_secs(60);

    /// Per persistence call timeout inside a shard.
    pub const SHARD_IO_TIMEOUT: &str = "history.shardIOTimeout";
    /// Default for [`SHARD_IO_TIMEOUT`].
    pub const SHARD_IO_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

    /// Pending task count that triggers slice split and reader throttling.
    pub const QUEUE_PENDING_TASK_CRITICAL_COUNT: &str = "history.queuePendingTaskCriticalCount";
    /// Default for [`QUEUE_PENDING_TASK_CRITICAL_COUNT`].
    pub const QUEUE_PENDING_TASK_CRITICAL_COUNT_DEFAULT: i64 = 9000;

    /// Pending task count at which the queue stops loading new tasks.
    pub const QUEUE_PENDING_TASKS_MAX_COUNT: &str = "history.queuePendingTasksMaxCount";
    /// Default for [`QUEUE_PENDING_TASKS_MAX_COUNT`].
    pub const QUEUE_PENDING_TASKS_MAX_COUNT_DEFAULT: i64 = 10000;

    /// Worker long-poll duration.
    pub const MATCHING_LONG_POLL_EXPIRATION: &str = "matching.longPollExpirationInterval";
    /// Default for [`MATCHING_LONG_POLL_EXPIRATION`].
    pub const MATCHING_LONG_POLL_EXPIRATION_DEFAULT: Duration = Duration::from_secs(60);

    /// Per-workflow history size hard cap in bytes.
    pub const LIMIT_HISTORY_SIZE_ERROR: &str = "limit.historySize.error";
    /// Default for [`LIMIT_HISTORY_SIZE_ERROR`].
    pub const LIMIT_HISTORY_SIZE_ERROR_DEFAULT: i64 = 50 * 1024 * 1024;

    /// Per-workflow history event count hard cap.
    pub const LIMIT_HISTORY_COUNT_ERROR: &str = "limit.historyCount.error";
    /// Default for [`LIMIT_HISTORY_COUNT_ERROR`].
    pub const LIMIT_HISTORY_COUNT_ERROR_DEFAULT: i64 = 50 * 1024;

    /// Per-namespace RPS per frontend instance.
    pub const FRONTEND_NAMESPACE_RPS: &str = "frontend.namespaceRPS";
    /// Default for [`FRONTEND_NAMESPACE_RPS`].
    pub const FRONTEND_NAMESPACE_RPS_DEFAULT: i64 = 2400;

    /// Namespace registry refresh interval.
    pub const NAMESPACE_CACHE_REFRESH_INTERVAL: &str = "system.namespaceCacheRefreshInterval";
    /// Default for [`NAMESPACE_CACHE_REFRESH_INTERVAL`].
    pub const NAMESPACE_CACHE_REFRESH_INTERVAL_DEFAULT: Duration = Duration::from_secs(2);

    /// Replication fetch cadence.
    pub const REPLICATION_FETCH_INTERVAL: &str = "history.replicationTaskFetcherAggregationInterval";
    /// Default for [`REPLICATION_FETCH_INTERVAL`].
    pub const REPLICATION_FETCH_INTERVAL_DEFAULT: Duration = Duration::from_secs(2);

    /// Bound on a namespace's failover history record.
    pub const FAILOVER_HISTORY_MAX_SIZE: &str = "system.failoverHistoryMaxSize";
    /// Default for [`FAILOVER_HISTORY_MAX_SIZE`].
    pub const FAILOVER_HISTORY_MAX_SIZE_DEFAULT: i64 = 5;

    /// Wait for replication-state convergence on writes to a handover namespace.
    pub const ENABLE_NAMESPACE_HANDOVER_WAIT: &str = "system.enableNamespaceHandoverWait";
    /// Default for [`ENABLE_NAMESPACE_HANDOVER_WAIT`].
    pub const ENABLE_NAMESPACE_HANDOVER_WAIT_DEFAULT: bool = false;

    /// Mask internal error details on the wire.
    pub const MASK_INTERNAL_ERROR_DETAILS: &str = "system.maskInternalErrorDetails";
    /// Default for [`MASK_INTERNAL_ERROR_DETAILS`].
    pub const MASK_INTERNAL_ERROR_DETAILS_DEFAULT: bool = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_when_no_override() {
        let cfg = DynamicConfig::new();
        assert_eq!(cfg.get_int("history.foo", &Constraints::default(), 7), 7);
        assert!(cfg.get_bool("history.bar", &Constraints::default(), true));
    }

    #[test]
    fn global_override_applies_everywhere() {
        let cfg = DynamicConfig::new();
        cfg.set("k", Constraints::default(), ConfigValue::Int(42));
        assert_eq!(cfg.get_int("k", &Constraints::default(), 0), 42);
        assert_eq!(cfg.get_int("k", &Constraints::namespace("ns1"), 0), 42);
    }

    #[test]
    fn most_specific_override_wins() {
        let cfg = DynamicConfig::new();
        cfg.set("k", Constraints::default(), ConfigValue::Int(1));
        cfg.set("k", Constraints::namespace("ns1"), ConfigValue::Int(2));
        cfg.set(
            "k",
            Constraints::task_queue("ns1", "tq1"),
            ConfigValue::Int(3),
        );

        assert_eq!(cfg.get_int("k", &Constraints::default(), 0), 1);
        assert_eq!(cfg.get_int("k", &Constraints::namespace("ns1"), 0), 2);
        assert_eq!(cfg.get_int("k", &Constraints::task_queue("ns1", "tq1"), 0), 3);
        // a different namespace only sees the global override
        assert_eq!(cfg.get_int("k", &Constraints::namespace("ns2"), 0), 1);
    }

    #[test]
    fn type_mismatch_falls_back_to_default() {
        let cfg = DynamicConfig::new();
        cfg.set("k", Constraints::default(), ConfigValue::String("x".into()));
        assert_eq!(cfg.get_int("k", &Constraints::default(), 9), 9);
    }

    #[test]
    fn replacing_an_override() {
        let cfg = DynamicConfig::new();
        cfg.set("k", Constraints::default(), ConfigValue::Int(1));
        cfg.set("k", Constraints::default(), ConfigValue::Int(2));
        assert_eq!(cfg.get_int("k", &Constraints::default(), 0), 2);
        cfg.clear("k");
        assert_eq!(cfg.get_int("k", &Constraints::default(), 0), 0);
    }

    #[test]
    fn shard_scoped_duration() {
        let cfg = DynamicConfig::new();
        cfg.set(
            keys::SHARD_IO_TIMEOUT,
            Constraints::shard(3),
            ConfigValue::Duration(Duration::from_secs(1)),
        );
        assert_eq!(
            cfg.get_duration(
                keys::SHARD_IO_TIMEOUT,
                &Constraints::shard(3),
                keys::SHARD_IO_TIMEOUT_DEFAULT
            ),
            Duration::from_secs(1)
        );
        assert_eq!(
            cfg.get_duration(
                keys::SHARD_IO_TIMEOUT,
                &Constraints::shard(4),
                keys::SHARD_IO_TIMEOUT_DEFAULT
            ),
            Duration::from_secs(5)
        );
    }
}
