//! kdash store: per-(cluster, kind) watch cache.
//!
//! A cache has exactly one [`CacheWriter`] (owned by the watcher task draining the
//! watch stream) and any number of [`CacheReader`]s. Readers only ever receive copies.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use kdash_core::{namespace_filter, EventType, KdashError, KdashResult, KindOf, ObjectKey};
use kube::ResourceExt;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// A typed resource kdash can watch, cache and publish.
pub trait WatchedResource:
    KindOf + kube::Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static
{
}

impl<K> WatchedResource for K where
    K: KindOf + kube::Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static
{
}

pub fn object_key<K: kube::Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(obj.namespace().as_deref(), &obj.name_any())
}

/// Watcher lifecycle as seen through its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unstarted,
    Syncing,
    Synced,
    Running,
    Stopped,
}

impl SyncState {
    /// Initial list applied; reads are served from the cache.
    pub fn is_ready(&self) -> bool {
        matches!(self, SyncState::Synced | SyncState::Running)
    }
}

/// One change applied to the cache, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(K),
}

impl<K> Change<K> {
    pub fn event_type(&self) -> EventType {
        match self {
            Change::Added(_) => EventType::Added,
            Change::Updated { .. } => EventType::Updated,
            Change::Deleted(_) => EventType::Deleted,
        }
    }

    /// The object as of this change (the new value for updates, the last known value for deletes).
    pub fn object(&self) -> &K {
        match self {
            Change::Added(o) | Change::Deleted(o) => o,
            Change::Updated { new, .. } => new,
        }
    }
}

/// Subscriber invoked synchronously on the task that applies changes. Must not block.
pub trait ChangeHandler<K>: Send + Sync {
    fn on_change(&self, change: &Change<K>) -> KdashResult<()>;
}

impl<K, F> ChangeHandler<K> for F
where
    F: Fn(&Change<K>) -> KdashResult<()> + Send + Sync,
{
    fn on_change(&self, change: &Change<K>) -> KdashResult<()> {
        self(change)
    }
}

struct Shared<K> {
    label: String,
    items: RwLock<FxHashMap<ObjectKey, K>>,
    epoch: AtomicU64,
}

impl<K> Shared<K> {
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, K>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ObjectKey, K>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create an empty cache for one (cluster, kind) stream.
pub fn cache<K: WatchedResource>(cluster_id: &str) -> (CacheWriter<K>, CacheReader<K>) {
    let shared = Arc::new(Shared {
        label: format!("{}/{}", cluster_id, K::KIND),
        items: RwLock::new(FxHashMap::default()),
        epoch: AtomicU64::new(0),
    });
    let (state_tx, state_rx) = watch::channel(SyncState::Unstarted);
    (
        CacheWriter { shared: Arc::clone(&shared), state_tx },
        CacheReader { shared, state_rx },
    )
}

/// Exclusive write side. Dropping it stops the cache and discards its contents.
pub struct CacheWriter<K: WatchedResource> {
    shared: Arc<Shared<K>>,
    state_tx: watch::Sender<SyncState>,
}

impl<K: WatchedResource> CacheWriter<K> {
    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: SyncState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!(cache = %self.shared.label, from = ?prev, to = ?next, "cache state");
        }
    }

    fn bump(&self, len: usize) {
        self.shared.epoch.fetch_add(1, Ordering::Relaxed);
        gauge!("kdash_cache_objects", len as f64, "kind" => K::KIND.kind_name());
    }

    fn promote_running(&self) {
        if self.state() == SyncState::Synced {
            self.set_state(SyncState::Running);
        }
    }

    pub fn begin_sync(&mut self) {
        if self.state() == SyncState::Unstarted {
            self.set_state(SyncState::Syncing);
        }
    }

    /// Insert or replace one object. Re-delivery of an unchanged resourceVersion yields no change.
    pub fn apply(&mut self, obj: K) -> Option<Change<K>> {
        let key = object_key(&obj);
        let (change, len) = {
            let mut items = self.shared.write();
            let change = match items.insert(key, obj.clone()) {
                None => Some(Change::Added(obj)),
                Some(old) if old.resource_version().is_some() && old.resource_version() == obj.resource_version() => None,
                Some(old) => Some(Change::Updated { old, new: obj }),
            };
            (change, items.len())
        };
        if change.is_some() {
            self.bump(len);
        }
        self.promote_running();
        change
    }

    /// Remove one object. Deleting an unknown key yields no change.
    pub fn delete(&mut self, obj: K) -> Option<Change<K>> {
        let key = object_key(&obj);
        let (removed, len) = {
            let mut items = self.shared.write();
            let removed = items.remove(&key);
            (removed, items.len())
        };
        self.promote_running();
        match removed {
            Some(last) => {
                self.bump(len);
                Some(Change::Deleted(last))
            }
            None => {
                debug!(cache = %self.shared.label, key = %key, "delete for unknown object ignored");
                None
            }
        }
    }

    /// Replace the whole content with a full listing and mark the cache synced.
    ///
    /// Returns the changes relative to the previous content: adds and updates in listing
    /// order, then deletes for objects absent from the listing.
    pub fn replace(&mut self, objs: Vec<K>) -> Vec<Change<K>> {
        let mut changes = Vec::with_capacity(objs.len());
        let mut next: FxHashMap<ObjectKey, K> = FxHashMap::default();
        let len = {
            let mut items = self.shared.write();
            for obj in objs {
                let key = object_key(&obj);
                match items.remove(&key) {
                    None => changes.push(Change::Added(obj.clone())),
                    Some(old) if old.resource_version().is_some() && old.resource_version() == obj.resource_version() => {}
                    Some(old) => changes.push(Change::Updated { old, new: obj.clone() }),
                }
                next.insert(key, obj);
            }
            let mut gone: Vec<(ObjectKey, K)> = items.drain().collect();
            gone.sort_by(|a, b| a.0.cmp(&b.0));
            changes.extend(gone.into_iter().map(|(_, o)| Change::Deleted(o)));
            *items = next;
            items.len()
        };
        self.bump(len);
        if !self.state().is_ready() {
            info!(cache = %self.shared.label, objects = len, "cache synced");
            self.set_state(SyncState::Synced);
        } else {
            counter!("kdash_cache_relist_total", 1, "kind" => K::KIND.kind_name());
        }
        changes
    }

    pub fn reader(&self) -> CacheReader<K> {
        CacheReader { shared: Arc::clone(&self.shared), state_rx: self.state_tx.subscribe() }
    }
}

impl<K: WatchedResource> Drop for CacheWriter<K> {
    fn drop(&mut self) {
        self.shared.write().clear();
        self.set_state(SyncState::Stopped);
    }
}

/// Read side of a cache. Cheap to clone; every read returns owned copies.
pub struct CacheReader<K> {
    shared: Arc<Shared<K>>,
    state_rx: watch::Receiver<SyncState>,
}

impl<K> Clone for CacheReader<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), state_rx: self.state_rx.clone() }
    }
}

impl<K: WatchedResource> CacheReader<K> {
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    pub fn has_synced(&self) -> bool {
        self.state().is_ready()
    }

    /// Number of mutations applied so far.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_ready(&self) -> KdashResult<()> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(KdashError::NotReady(format!("{} cache not synced ({:?})", self.shared.label, state)))
        }
    }

    /// Objects in `namespace` (`None`, empty or "all" means every namespace), ordered by key.
    pub fn list(&self, namespace: Option<&str>) -> KdashResult<Vec<K>> {
        self.ensure_ready()?;
        let ns = namespace_filter(namespace);
        let items = self.shared.read();
        let mut out: Vec<(&ObjectKey, &K)> =
            items.iter().filter(|(k, _)| ns.map_or(true, |n| k.namespace.as_deref() == Some(n))).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        Ok(out.into_iter().map(|(_, o)| o.clone()).collect())
    }

    pub fn get(&self, key: &ObjectKey) -> KdashResult<K> {
        self.ensure_ready()?;
        self.shared
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| KdashError::NotFound(format!("{} {} not found", self.shared.label, key)))
    }

    /// Wait until the initial listing is applied, or fail with `NotReady` after `timeout`.
    pub async fn wait_synced(&self, timeout: Duration) -> KdashResult<()> {
        let mut rx = self.state_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_ready() || *s == SyncState::Stopped).await.map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(_) => Err(KdashError::NotReady(format!("{} stopped before sync", self.shared.label))),
            Err(_) => Err(KdashError::NotReady(format!(
                "{} not synced after {}ms",
                self.shared.label,
                timeout.as_millis()
            ))),
        }
    }
}
