//! Vigil Resource Service boundary.
//!
//! The controller core only ever talks to [`ResourceService`]; the two
//! implementations here are the kube-backed [`KubeService`] used against a
//! real cluster and the in-memory [`MemoryService`] used by tests and the
//! demo mode.

#![forbid(unsafe_code)]

use tokio::sync::mpsc;
use vigil_core::prelude::*;

mod cluster;
mod memory;

pub use cluster::{snapshot_from_json, KubeService};
pub use memory::MemoryService;

/// Cancellation handle that aborts the underlying task, if any.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn detached() -> Self {
        Self { task: None }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle returned by watch endpoints.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// The remote authority holding canonical project state.
///
/// Implementations surface failures through the [`ServiceError`] taxonomy:
/// `NotFound` for vanished objects, `Conflict` for optimistic-concurrency
/// rejections, `Transient` for anything worth retrying, `Invalid` for
/// malformed state that retrying cannot fix.
#[async_trait::async_trait]
pub trait ResourceService: Send + Sync {
    /// Full snapshot of every project.
    async fn list(&self) -> Result<Vec<ProjectSnapshot>, ServiceError>;

    /// Fetch a single project by key.
    async fn get(&self, key: &ProjectKey) -> Result<ProjectSnapshot, ServiceError>;

    /// Long-lived event stream. The stream may end at any time (timeout,
    /// disconnect); the consumer is expected to re-list and re-watch.
    async fn watch(&self) -> Result<StreamHandle<RemoteEvent>, ServiceError>;

    /// Create a project; identity fields (uid, revision) are assigned by the
    /// service.
    async fn create(&self, snapshot: ProjectSnapshot) -> Result<ProjectSnapshot, ServiceError>;

    /// Conditional update: `snapshot.revision` is the expected current
    /// version, and a mismatch is rejected with `Conflict`.
    async fn update(&self, snapshot: ProjectSnapshot) -> Result<ProjectSnapshot, ServiceError>;
}
