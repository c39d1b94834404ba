// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-through namespace registry.
//!
//! Two concurrent maps (`name -> id`, `id -> Namespace`) serve the hot path.
//! A miss reads through to the store under a per-handle single-flight lock;
//! a confirmed `NotFound` is cached for a short TTL so storms of lookups for
//! a missing namespace don't hammer the store. Transient store errors are
//! never cached.
//!
//! A background refresher pages the full namespace table (including deleted
//! rows), rebuilds both maps by diffing against the current state, and
//! invokes state-change callbacks for namespaces that are new, removed, or
//! changed in state, globality, active cluster, or replication state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use weft_common::config::{keys, Constraints, DynamicConfig};
use weft_persistence::store::MetadataStore;
use weft_persistence::types::ListNamespacesRequest;
use weft_persistence::StoreError;

use crate::error::{NamespaceError, Result};
use crate::namespace::{state_changed, Namespace};

const REFRESH_PAGE_SIZE: usize = 1000;
const REFRESH_FAILURE_RETRY: Duration = Duration::from_secs(1);
const READTHROUGH_NOT_FOUND_TTL: Duration = Duration::from_secs(1);

/// Callback invoked on namespace state changes. The boolean is true when the
/// namespace was removed from the database.
pub type StateChangeCallback = Arc<dyn Fn(&Namespace, bool) + Send + Sync>;

#[derive(Default)]
struct Caches {
    by_name: HashMap<String, Uuid>,
    by_id: HashMap<Uuid, Arc<Namespace>>,
    callbacks: HashMap<String, StateChangeCallback>,
}

/// The namespace registry.
pub struct Registry {
    store: Arc<dyn MetadataStore>,
    config: Arc<DynamicConfig>,
    caches: RwLock<Caches>,
    // handles (name or id string) that recently read through to a NotFound
    negative: Mutex<HashMap<String, Instant>>,
    // per-handle single-flight locks for read-through
    request_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    refresh_trigger: Notify,
    shutdown: Arc<Notify>,
}

impl Registry {
    /// Create a registry. Call [`Registry::start`] to populate it and run the
    /// background refresher.
    pub fn new(store: Arc<dyn MetadataStore>, config: Arc<DynamicConfig>) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            caches: RwLock::new(Caches::default()),
            negative: Mutex::new(HashMap::new()),
            request_locks: Mutex::new(HashMap::new()),
            refresh_trigger: Notify::new(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Run the initial scan and spawn the refresh loop. Call on a clone of
    /// the registry handle; lookups keep working through the original.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        self.refresh().await?;
        info!("namespace registry started");
        Ok(tokio::spawn(async move { self.refresh_loop().await }))
    }

    /// Handle used to stop the refresh loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Ask the refresher to run ahead of its next tick.
    pub fn trigger_refresh(&self) {
        self.refresh_trigger.notify_one();
    }

    /// Number of entries in the by-name and by-id maps.
    pub fn cache_size(&self) -> (usize, usize) {
        let caches = self.caches.read();
        (caches.by_name.len(), caches.by_id.len())
    }

    /// Register a state-change callback under `key`, replacing any previous
    /// one. The callback is immediately invoked once for every namespace
    /// currently in the registry.
    pub fn register_state_change_callback(&self, key: impl Into<String>, cb: StateChangeCallback) {
        let existing: Vec<Arc<Namespace>>;
        {
            let mut caches = self.caches.write();
            caches.callbacks.insert(key.into(), cb.clone());
            existing = caches.by_id.values().cloned().collect();
        }
        for ns in existing {
            cb(&ns, false);
        }
    }

    /// Remove the callback registered under `key`.
    pub fn unregister_state_change_callback(&self, key: &str) {
        self.caches.write().callbacks.remove(key);
    }

    /// Look up a namespace by name, reading through to the store on a miss.
    pub async fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        if name.is_empty() {
            return Err(NamespaceError::invalid("namespace name is empty"));
        }
        self.get_or_read_through(Handle::name(name.to_string())).await
    }

    /// Look up a namespace by id, reading through to the store on a miss.
    pub async fn get_namespace_by_id(&self, id: Uuid) -> Result<Arc<Namespace>> {
        if id.is_nil() {
            return Err(NamespaceError::invalid("namespace id is empty"));
        }
        self.get_or_read_through(Handle::id(id)).await
    }

    /// Resolve a namespace name to its id.
    pub async fn get_namespace_id(&self, name: &str) -> Result<Uuid> {
        Ok(self.get_namespace(name).await?.id())
    }

    /// Resolve a namespace id to its name.
    pub async fn get_namespace_name(&self, id: Uuid) -> Result<String> {
        Ok(self.get_namespace_by_id(id).await?.name().to_string())
    }

    // ------------------------------------------------------------------
    // Read-through
    // ------------------------------------------------------------------

    async fn get_or_read_through(&self, handle: Handle) -> Result<Arc<Namespace>> {
        if let Some(result) = self.check_caches(&handle) {
            return result;
        }

        // single-flight per handle
        let lock = self.request_lock(handle.key());
        let _guard = lock.lock().await;

        // re-check in case another flight filled the cache while we waited
        if let Some(result) = self.check_caches(&handle) {
            self.cleanup_request_lock(&lock, handle.key());
            return result;
        }

        let result = self.read_through(&handle).await;
        self.cleanup_request_lock(&lock, handle.key());
        result
    }

    /// Check the main caches, then the negative read-through cache.
    /// `None` means both missed and the caller should read through.
    fn check_caches(&self, handle: &Handle) -> Option<Result<Arc<Namespace>>> {
        {
            let caches = self.caches.read();
            let hit = match &handle.kind {
                HandleKind::Name => caches
                    .by_name
                    .get(&handle.key)
                    .and_then(|id| caches.by_id.get(id))
                    .cloned(),
                HandleKind::Id(id) => caches.by_id.get(id).cloned(),
            };
            if let Some(ns) = hit {
                return Some(Ok(ns));
            }
        }

        let mut negative = self.negative.lock();
        if let Some(at) = negative.get(handle.key()) {
            if at.elapsed() < READTHROUGH_NOT_FOUND_TTL {
                return Some(Err(NamespaceError::NotFound {
                    namespace: handle.key().to_string(),
                }));
            }
            negative.remove(handle.key());
        }
        None
    }

    async fn read_through(&self, handle: &Handle) -> Result<Arc<Namespace>> {
        let fetched = match &handle.kind {
            HandleKind::Name => self.store.get_namespace_by_name(&handle.key).await,
            HandleKind::Id(id) => self.store.get_namespace_by_id(*id).await,
        };
        match fetched {
            Ok(record) => {
                let ns = Arc::new(Namespace::from_record(record));
                self.update_caches_single(ns.clone());
                Ok(ns)
            }
            Err(StoreError::NotFound(_)) => {
                // confirmed absence: cache it briefly
                self.negative
                    .lock()
                    .insert(handle.key().to_string(), Instant::now());
                Err(NamespaceError::NotFound {
                    namespace: handle.key().to_string(),
                })
            }
            // transient errors propagate uncached
            Err(err) => Err(err.into()),
        }
    }

    fn request_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.request_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cleanup_request_lock(&self, lock: &Arc<tokio::sync::Mutex<()>>, key: &str) {
        let mut locks = self.request_locks.lock();
        // map + our clone: nobody else is waiting
        if Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }

    /// Install one namespace fetched by read-through, unless the refresher
    /// already put a same-or-newer config version in place.
    fn update_caches_single(&self, ns: Arc<Namespace>) {
        let callbacks: Vec<StateChangeCallback>;
        {
            let mut caches = self.caches.write();
            if let Some(existing) = caches.by_id.get(&ns.id()) {
                if existing.config_version() >= ns.config_version() {
                    return;
                }
            }
            let old = caches.by_id.insert(ns.id(), ns.clone());
            caches.by_name.insert(ns.name().to_string(), ns.id());
            if !state_changed(old.as_deref(), &ns) {
                return;
            }
            callbacks = caches.callbacks.values().cloned().collect();
        }
        for cb in callbacks {
            cb(&ns, false);
        }
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    async fn refresh_loop(self: Arc<Self>) {
        loop {
            let interval = self.config.get_duration(
                keys::NAMESPACE_CACHE_REFRESH_INTERVAL,
                &Constraints::default(),
                keys::NAMESPACE_CACHE_REFRESH_INTERVAL_DEFAULT,
            );
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("namespace registry refresh loop stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = self.refresh_trigger.notified() => {}
            }

            while let Err(e) = self.refresh().await {
                error!(error = %e, "namespace cache refresh failed");
                tokio::select! {
                    _ = self.shutdown.notified() => return,
                    _ = tokio::time::sleep(REFRESH_FAILURE_RETRY) => {}
                }
            }
        }
    }

    /// One full refresh pass: page the store, rebuild both maps, fire
    /// callbacks for removed and state-changed namespaces.
    pub async fn refresh(&self) -> Result<()> {
        let mut from_db: Vec<Arc<Namespace>> = Vec::new();
        let mut request = ListNamespacesRequest {
            page_size: REFRESH_PAGE_SIZE,
            next_page_token: None,
            include_deleted: true,
        };
        loop {
            let response = self.store.list_namespaces(request.clone()).await?;
            from_db.extend(
                response
                    .namespaces
                    .into_iter()
                    .map(|r| Arc::new(Namespace::from_record(r))),
            );
            match response.next_page_token {
                Some(token) => request.next_page_token = Some(token),
                None => break,
            }
        }

        let mut new_by_name: HashMap<String, Uuid> = HashMap::with_capacity(from_db.len());
        let mut new_by_id: HashMap<Uuid, Arc<Namespace>> = HashMap::with_capacity(from_db.len());
        for ns in &from_db {
            new_by_name.insert(ns.name().to_string(), ns.id());
            new_by_id.insert(ns.id(), ns.clone());
        }

        let mut removed: Vec<Arc<Namespace>> = Vec::new();
        let mut changed: Vec<Arc<Namespace>> = Vec::new();
        let callbacks: Vec<StateChangeCallback>;
        {
            let mut caches = self.caches.write();
            for (id, old) in &caches.by_id {
                if !new_by_id.contains_key(id) {
                    removed.push(old.clone());
                }
            }
            for ns in &from_db {
                if state_changed(caches.by_id.get(&ns.id()).map(Arc::as_ref), ns) {
                    changed.push(ns.clone());
                }
            }
            caches.by_name = new_by_name;
            caches.by_id = new_by_id;
            callbacks = caches.callbacks.values().cloned().collect();
        }

        if !removed.is_empty() || !changed.is_empty() {
            warn!(
                removed = removed.len(),
                changed = changed.len(),
                "namespace state changes detected"
            );
        }
        for cb in &callbacks {
            for ns in &removed {
                cb(ns, true);
            }
            for ns in &changed {
                cb(ns, false);
            }
        }
        Ok(())
    }
}

/// A lookup handle plus its precomputed cache key.
struct Handle {
    kind: HandleKind,
    key: String,
}

enum HandleKind {
    Name,
    Id(Uuid),
}

impl Handle {
    fn name(name: String) -> Self {
        Self {
            kind: HandleKind::Name,
            key: name,
        }
    }

    fn id(id: Uuid) -> Self {
        Self {
            kind: HandleKind::Id(id),
            key: id.to_string(),
        }
    }

    fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use weft_persistence::types::{
        ArchivalState, NamespaceConfig, NamespaceRecord, NamespaceReplicationConfig,
        NamespaceState, ReplicationState,
    };
    use weft_persistence::{MemoryStore, MetadataStore};

    fn record(name: &str) -> NamespaceRecord {
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
                clusters: vec!["c1".into()],
                replication_state: ReplicationState::Normal,
                failover_history: vec![],
            },
            is_global: false,
            config_version: 0,
            failover_version: 0,
            failover_notification_version: 0,
            notification_version: 0,
        }
    }

    fn registry_with_store() -> (Arc<Registry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone(), DynamicConfig::new());
        (registry, store)
    }

    #[tokio::test]
    async fn read_through_populates_cache() {
        let (registry, store) = registry_with_store();
        store.create_namespace(record("ns1")).await.unwrap();

        let ns = registry.get_namespace("ns1").await.unwrap();
        assert_eq!(ns.name(), "ns1");
        assert_eq!(registry.cache_size(), (1, 1));

        // second lookup hits the cache; lookups by id resolve too
        let by_id = registry.get_namespace_by_id(ns.id()).await.unwrap();
        assert_eq!(by_id.name(), "ns1");
    }

    #[tokio::test]
    async fn confirmed_not_found_is_cached_briefly() {
        let (registry, store) = registry_with_store();

        let err = registry.get_namespace("missing").await.unwrap_err();
        assert!(matches!(err, NamespaceError::NotFound { .. }));

        // create the namespace; the negative cache still answers until TTL
        store.create_namespace(record("missing")).await.unwrap();
        let err = registry.get_namespace("missing").await.unwrap_err();
        assert!(matches!(err, NamespaceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn refresh_rebuilds_and_fires_callbacks() {
        let (registry, store) = registry_with_store();
        store.create_namespace(record("ns1")).await.unwrap();
        registry.refresh().await.unwrap();
        assert_eq!(registry.cache_size(), (1, 1));

        let seen: Arc<PlMutex<Vec<(String, bool)>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        registry.register_state_change_callback(
            "test",
            Arc::new(move |ns, deleted| {
                sink.lock().push((ns.name().to_string(), deleted));
            }),
        );
        // registration replays the existing set once
        assert_eq!(seen.lock().as_slice(), &[("ns1".to_string(), false)]);

        // a state change is surfaced on the next refresh
        let mut stored = store.get_namespace_by_name("ns1").await.unwrap();
        stored.state = NamespaceState::Deprecated;
        let version = stored.notification_version;
        store.update_namespace(stored, version).await.unwrap();
        registry.refresh().await.unwrap();
        assert!(seen
            .lock()
            .iter()
            .filter(|(n, d)| n == "ns1" && !d)
            .count()
            >= 2);

        // removal from the database is surfaced as deleted=true
        let id = store.get_namespace_by_name("ns1").await.unwrap().id;
        store.delete_namespace(id).await.unwrap();
        registry.refresh().await.unwrap();
        assert!(seen.lock().iter().any(|(n, d)| n == "ns1" && *d));
        assert_eq!(registry.cache_size(), (0, 0));
    }

    #[tokio::test]
    async fn pure_config_change_does_not_fire_callbacks() {
        let (registry, store) = registry_with_store();
        store.create_namespace(record("ns1")).await.unwrap();
        registry.refresh().await.unwrap();

        let seen: Arc<PlMutex<usize>> = Arc::new(PlMutex::new(0));
        let sink = seen.clone();
        registry.register_state_change_callback(
            "test",
            Arc::new(move |_, _| {
                *sink.lock() += 1;
            }),
        );
        let replayed = *seen.lock();

        let mut stored = store.get_namespace_by_name("ns1").await.unwrap();
        stored.description = "new description".into();
        stored.config_version += 1;
        let version = stored.notification_version;
        store.update_namespace(stored, version).await.unwrap();
        registry.refresh().await.unwrap();
        assert_eq!(*seen.lock(), replayed);
    }

    #[tokio::test]
    async fn unregistered_callback_stops_firing() {
        let (registry, store) = registry_with_store();
        let seen: Arc<PlMutex<usize>> = Arc::new(PlMutex::new(0));
        let sink = seen.clone();
        registry.register_state_change_callback(
            "test",
            Arc::new(move |_, _| {
                *sink.lock() += 1;
            }),
        );
        registry.unregister_state_change_callback("test");

        store.create_namespace(record("ns1")).await.unwrap();
        registry.refresh().await.unwrap();
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn empty_handles_are_rejected() {
        let (registry, _store) = registry_with_store();
        assert!(matches!(
            registry.get_namespace("").await,
            Err(NamespaceError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.get_namespace_by_id(Uuid::nil()).await,
            Err(NamespaceError::InvalidArgument { .. })
        ));
    }
}
