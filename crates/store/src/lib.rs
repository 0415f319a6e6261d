//! Vigil in-RAM cache: the keyed store the synchronizer writes into and
//! the read-only lister reconcilers consult instead of the network.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use vigil_core::prelude::*;

mod sync;

pub use sync::{SyncConfig, SyncError, Synchronizer};

/// Latest known snapshot per key, written only by the synchronizer.
///
/// Staleness is decided per key: an incoming snapshot for a known uid with a
/// revision at or below the cached one is discarded, so subscribers observe
/// a monotonically non-decreasing view of each key. A changed uid means the
/// object was deleted and recreated, which is never stale.
pub struct CacheStore {
    map: RwLock<FxHashMap<ProjectKey, ProjectSnapshot>>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stale(cached: &ProjectSnapshot, incoming: &ProjectSnapshot) -> bool {
    cached.uid == incoming.uid && incoming.revision <= cached.revision
}

impl CacheStore {
    pub fn new() -> Self {
        Self { map: RwLock::new(FxHashMap::default()) }
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ProjectKey, ProjectSnapshot>> {
        self.map.read().expect("lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ProjectKey, ProjectSnapshot>> {
        self.map.write().expect("lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn upsert_locked(
        map: &mut FxHashMap<ProjectKey, ProjectSnapshot>,
        snapshot: ProjectSnapshot,
    ) -> Option<ChangeNotification> {
        match map.get(&snapshot.key) {
            Some(cached) if is_stale(cached, &snapshot) => None,
            Some(cached) => {
                let old = cached.clone();
                let new = snapshot.clone();
                map.insert(snapshot.key.clone(), snapshot);
                Some(ChangeNotification::Updated { old, new })
            }
            None => {
                map.insert(snapshot.key.clone(), snapshot.clone());
                Some(ChangeNotification::Added { snapshot })
            }
        }
    }

    /// Apply one watch event. Returns the notification to fan out, or
    /// `None` when the event is stale and must be discarded.
    pub fn apply_event(&self, event: RemoteEvent) -> Option<ChangeNotification> {
        let mut map = self.write();
        let out = match event {
            RemoteEvent::Added(s) | RemoteEvent::Modified(s) => Self::upsert_locked(&mut map, s),
            RemoteEvent::Deleted(s) => map
                .remove(&s.key)
                .map(|last| ChangeNotification::Deleted { last }),
        };
        gauge!("cache_size", map.len() as f64);
        out
    }

    /// Reconcile the cache against a fresh full List: upserts every listed
    /// snapshot and removes cached keys the list no longer contains.
    pub fn reconcile_list(&self, fresh: Vec<ProjectSnapshot>) -> Vec<ChangeNotification> {
        let mut map = self.write();
        let mut out = Vec::new();
        let mut seen: FxHashSet<ProjectKey> = FxHashSet::default();
        for snapshot in fresh {
            seen.insert(snapshot.key.clone());
            if let Some(n) = Self::upsert_locked(&mut map, snapshot) {
                out.push(n);
            }
        }
        let gone: Vec<ProjectKey> = map.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for key in gone {
            if let Some(last) = map.remove(&key) {
                out.push(ChangeNotification::Deleted { last });
            }
        }
        gauge!("cache_size", map.len() as f64);
        out
    }

    /// Synthesized `Updated` notification for every cached entry, used by
    /// the periodic resync to force re-reconciliation absent real changes.
    pub fn resync_notifications(&self) -> Vec<ChangeNotification> {
        self.read()
            .values()
            .map(|s| ChangeNotification::Updated { old: s.clone(), new: s.clone() })
            .collect()
    }

    fn get(&self, key: &ProjectKey) -> Option<ProjectSnapshot> {
        self.read().get(key).cloned()
    }
}

/// Read-only view over the cache. Never performs network I/O; a miss means
/// "not currently known", not "not yet fetched".
#[derive(Clone)]
pub struct Lister {
    store: Arc<CacheStore>,
}

impl Lister {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &ProjectKey) -> Option<ProjectSnapshot> {
        self.store.get(key)
    }

    pub fn list<F>(&self, predicate: F) -> Vec<ProjectSnapshot>
    where
        F: Fn(&ProjectSnapshot) -> bool,
    {
        self.store
            .read()
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect()
    }
}
