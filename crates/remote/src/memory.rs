//! In-memory Resource Service used by tests and the demo mode.
//!
//! Behaves like the real store where the controller can tell the
//! difference: revisions are allocated monotonically, updates are rejected
//! on a stale expected revision, and watch subscribers see the same event
//! stream a cluster would emit. Failures can be injected per call site to
//! exercise the retry paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use vigil_core::prelude::*;

use crate::{CancelHandle, ResourceService, StreamHandle};

const SUBSCRIBER_CAP: usize = 1024;

#[derive(Default)]
struct MemInner {
    items: BTreeMap<ProjectKey, ProjectSnapshot>,
    revision: u64,
    subscribers: Vec<mpsc::Sender<RemoteEvent>>,
    update_faults: VecDeque<ServiceError>,
    list_faults: u32,
    update_calls: u64,
}

impl MemInner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn broadcast(&mut self, ev: RemoteEvent) {
        // Drop subscribers that went away; try_send keeps the lock scope
        // free of awaits.
        self.subscribers.retain(|tx| match tx.try_send(ev.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("memory watch subscriber lagging; dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

pub struct MemoryService {
    inner: Mutex<MemInner>,
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryService {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemInner::default()) }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Insert a project directly, bypassing the create path. Handy for
    /// seeding demos and tests.
    pub fn seed_project(&self, name: &str, requester: Option<&str>) -> ProjectSnapshot {
        let mut annotations = AnnotationPairs::new();
        if let Some(req) = requester {
            annotations.push((vigil_core::anno::REQUESTER.to_string(), req.to_string()));
        }
        let mut inner = self.locked();
        let snapshot = ProjectSnapshot {
            key: ProjectKey::from(name),
            uid: *Uuid::new_v4().as_bytes(),
            revision: inner.next_revision(),
            phase: ProjectPhase::Active,
            labels: LabelPairs::new(),
            annotations,
            creation_ts: 0,
        };
        inner.items.insert(snapshot.key.clone(), snapshot.clone());
        inner.broadcast(RemoteEvent::Added(snapshot.clone()));
        snapshot
    }

    /// Remove a project and emit a Deleted event, as an external actor
    /// would. Deletion is not part of the controller-facing trait.
    pub fn delete(&self, key: &ProjectKey) -> Option<ProjectSnapshot> {
        let mut inner = self.locked();
        let last = inner.items.remove(key)?;
        inner.broadcast(RemoteEvent::Deleted(last.clone()));
        Some(last)
    }

    /// Queue errors consumed by subsequent `update` calls, in order.
    pub fn inject_update_faults(&self, faults: impl IntoIterator<Item = ServiceError>) {
        self.locked().update_faults.extend(faults);
    }

    /// Make the next `n` `list` calls fail with a transient error.
    pub fn fail_next_lists(&self, n: u32) {
        self.locked().list_faults = n;
    }

    /// Close every open watch stream, as a server-side timeout or
    /// disconnect would.
    pub fn disconnect_watchers(&self) {
        self.locked().subscribers.clear();
    }

    /// Number of live watch subscriptions.
    pub fn watcher_count(&self) -> usize {
        self.locked().subscribers.len()
    }

    pub fn update_calls(&self) -> u64 {
        self.locked().update_calls
    }

    /// Current stored snapshot, if any (direct read, no watch round trip).
    pub fn stored(&self, key: &ProjectKey) -> Option<ProjectSnapshot> {
        self.locked().items.get(key).cloned()
    }
}

#[async_trait::async_trait]
impl ResourceService for MemoryService {
    async fn list(&self) -> Result<Vec<ProjectSnapshot>, ServiceError> {
        let mut inner = self.locked();
        if inner.list_faults > 0 {
            inner.list_faults -= 1;
            return Err(ServiceError::Transient("injected list failure".into()));
        }
        Ok(inner.items.values().cloned().collect())
    }

    async fn get(&self, key: &ProjectKey) -> Result<ProjectSnapshot, ServiceError> {
        self.locked()
            .items
            .get(key)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound { key: key.clone() })
    }

    async fn watch(&self) -> Result<StreamHandle<RemoteEvent>, ServiceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAP);
        self.locked().subscribers.push(tx);
        Ok(StreamHandle { rx, cancel: CancelHandle::detached() })
    }

    async fn create(&self, snapshot: ProjectSnapshot) -> Result<ProjectSnapshot, ServiceError> {
        let mut inner = self.locked();
        if inner.items.contains_key(&snapshot.key) {
            return Err(ServiceError::Conflict(format!("{} already exists", snapshot.key)));
        }
        let created = ProjectSnapshot {
            uid: *Uuid::new_v4().as_bytes(),
            revision: inner.next_revision(),
            ..snapshot
        };
        inner.items.insert(created.key.clone(), created.clone());
        inner.broadcast(RemoteEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, snapshot: ProjectSnapshot) -> Result<ProjectSnapshot, ServiceError> {
        let mut inner = self.locked();
        inner.update_calls += 1;
        if let Some(fault) = inner.update_faults.pop_front() {
            return Err(fault);
        }
        let (current_uid, current_revision) = match inner.items.get(&snapshot.key) {
            Some(c) => (c.uid, c.revision),
            None => return Err(ServiceError::NotFound { key: snapshot.key.clone() }),
        };
        if current_revision != snapshot.revision {
            return Err(ServiceError::Conflict(format!(
                "expected revision {}, object is at {}",
                snapshot.revision, current_revision
            )));
        }
        let updated = ProjectSnapshot {
            uid: current_uid,
            revision: inner.next_revision(),
            ..snapshot
        };
        inner.items.insert(updated.key.clone(), updated.clone());
        inner.broadcast(RemoteEvent::Modified(updated.clone()));
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MemoryService {
        MemoryService::new()
    }

    #[tokio::test]
    async fn update_requires_current_revision() {
        let svc = service();
        let created = svc.seed_project("proj-a", Some("alice"));

        // Stale expected revision is a conflict.
        let stale = ProjectSnapshot { revision: created.revision + 99, ..created.clone() };
        assert!(matches!(svc.update(stale).await, Err(ServiceError::Conflict(_))));

        // Matching revision succeeds and bumps the version.
        let fresh = created.with_annotation(vigil_core::anno::DISPLAY_NAME, "alice's proj-a");
        let updated = svc.update(fresh).await.expect("update");
        assert!(updated.revision > created.revision);
        assert_eq!(
            updated.annotation(vigil_core::anno::DISPLAY_NAME),
            Some("alice's proj-a")
        );
    }

    #[tokio::test]
    async fn update_of_missing_key_is_not_found() {
        let svc = service();
        let ghost = ProjectSnapshot {
            key: "ghost".into(),
            uid: [0u8; 16],
            revision: 1,
            phase: ProjectPhase::Active,
            labels: LabelPairs::new(),
            annotations: AnnotationPairs::new(),
            creation_ts: 0,
        };
        assert!(matches!(
            svc.update(ghost).await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let svc = service();
        let created = svc.seed_project("proj-a", Some("alice"));
        svc.inject_update_faults([
            ServiceError::Transient("one".into()),
            ServiceError::Transient("two".into()),
        ]);

        let next = created.with_annotation(vigil_core::anno::DISPLAY_NAME, "x");
        assert!(matches!(svc.update(next.clone()).await, Err(ServiceError::Transient(m)) if m == "one"));
        assert!(matches!(svc.update(next.clone()).await, Err(ServiceError::Transient(m)) if m == "two"));
        assert!(svc.update(next).await.is_ok());
        assert_eq!(svc.update_calls(), 3);
    }

    #[tokio::test]
    async fn watch_sees_create_update_delete() {
        let svc = service();
        let mut handle = svc.watch().await.expect("watch");

        let created = svc.seed_project("proj-a", None);
        let updated = svc
            .update(created.with_annotation(vigil_core::anno::DISPLAY_NAME, "d"))
            .await
            .expect("update");
        svc.delete(&updated.key);

        assert!(matches!(handle.rx.recv().await, Some(RemoteEvent::Added(_))));
        assert!(matches!(handle.rx.recv().await, Some(RemoteEvent::Modified(_))));
        assert!(matches!(handle.rx.recv().await, Some(RemoteEvent::Deleted(_))));
    }

    #[tokio::test]
    async fn list_faults_then_recovers() {
        let svc = service();
        svc.seed_project("proj-a", None);
        svc.fail_next_lists(2);
        assert!(svc.list().await.is_err());
        assert!(svc.list().await.is_err());
        assert_eq!(svc.list().await.expect("list").len(), 1);
    }
}
