//! Vigil core types: keys, snapshots, change notifications, and the
//! service error taxonomy shared by every crate in the workspace.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Object identity parsed from `metadata.uid`.
pub type Uid = [u8; 16];

/// Label pairs as observed on the remote object.
pub type LabelPairs = SmallVec<[(String, String); 8]>;
/// Annotation pairs as observed on the remote object.
pub type AnnotationPairs = SmallVec<[(String, String); 4]>;

/// Well-known annotation names consumed and written by the reconciler.
pub mod anno {
    pub const DISPLAY_NAME: &str = "projects.vigil.dev/display-name";
    pub const REQUESTER: &str = "projects.vigil.dev/requester";
    pub const DESCRIPTION: &str = "projects.vigil.dev/description";
}

/// Cluster-unique addressing unit for a project. The sole key used by the
/// cache, the lister, and the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ProjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Remote lifecycle phase of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectPhase {
    Pending,
    Active,
    Terminating,
    /// Server reported a phase this build does not know about.
    Unknown,
}

impl ProjectPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Active" => Self::Active,
            "Terminating" => Self::Terminating,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Terminating => "Terminating",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Immutable-at-capture copy of a project's fields at a point in time.
///
/// `revision` is the monotonic per-key observation version; the cache uses
/// it to discard stale events, and the update path sends it back as the
/// expected version for optimistic concurrency. Consumers must not mutate a
/// snapshot read from the cache; [`ProjectSnapshot::with_annotation`] is the
/// copy-on-write path for submitting changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub key: ProjectKey,
    pub uid: Uid,
    pub revision: u64,
    pub phase: ProjectPhase,
    pub labels: LabelPairs,
    pub annotations: AnnotationPairs,
    pub creation_ts: i64,
}

impl ProjectSnapshot {
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Copy-on-write: returns a new snapshot with `name` set to `value`,
    /// replacing an existing pair if present.
    pub fn with_annotation(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        let mut next = self.clone();
        match next.annotations.iter_mut().find(|(k, _)| *k == name) {
            Some(pair) => pair.1 = value,
            None => next.annotations.push((name, value)),
        }
        next
    }
}

/// Event shape on the Resource Service watch wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteEvent {
    Added(ProjectSnapshot),
    Modified(ProjectSnapshot),
    Deleted(ProjectSnapshot),
}

impl RemoteEvent {
    pub fn snapshot(&self) -> &ProjectSnapshot {
        match self {
            Self::Added(s) | Self::Modified(s) | Self::Deleted(s) => s,
        }
    }

    pub fn key(&self) -> &ProjectKey {
        &self.snapshot().key
    }
}

/// Change emitted by the cache synchronizer for every observed or
/// resync-synthesized transition, consumed by a single dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeNotification {
    Added { snapshot: ProjectSnapshot },
    Updated { old: ProjectSnapshot, new: ProjectSnapshot },
    Deleted { last: ProjectSnapshot },
}

impl ChangeNotification {
    pub fn key(&self) -> &ProjectKey {
        match self {
            Self::Added { snapshot } => &snapshot.key,
            Self::Updated { new, .. } => &new.key,
            Self::Deleted { last } => &last.key,
        }
    }

    pub fn into_key(self) -> ProjectKey {
        match self {
            Self::Added { snapshot } => snapshot.key,
            Self::Updated { new, .. } => new.key,
            Self::Deleted { last } => last.key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }
}

/// Errors crossing the Resource Service boundary.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ServiceError {
    #[error("not found: {key}")]
    NotFound { key: ProjectKey },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ServiceError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }
}

pub mod prelude {
    pub use super::{
        AnnotationPairs, ChangeNotification, LabelPairs, ProjectKey, ProjectPhase,
        ProjectSnapshot, RemoteEvent, ServiceError, Uid,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(name: &str) -> ProjectSnapshot {
        ProjectSnapshot {
            key: ProjectKey::from(name),
            uid: [7u8; 16],
            revision: 1,
            phase: ProjectPhase::Active,
            labels: LabelPairs::new(),
            annotations: AnnotationPairs::new(),
            creation_ts: 0,
        }
    }

    #[test]
    fn annotation_lookup_and_copy_on_write() {
        let s = snap("a").with_annotation(anno::REQUESTER, "alice");
        assert_eq!(s.annotation(anno::REQUESTER), Some("alice"));
        assert_eq!(s.annotation(anno::DISPLAY_NAME), None);

        let s2 = s.with_annotation(anno::REQUESTER, "bob");
        // original untouched, replacement in the copy
        assert_eq!(s.annotation(anno::REQUESTER), Some("alice"));
        assert_eq!(s2.annotation(anno::REQUESTER), Some("bob"));
        assert_eq!(s2.annotations.len(), 1);
    }

    #[test]
    fn phase_parse_round_trip() {
        assert_eq!(ProjectPhase::parse("Active"), ProjectPhase::Active);
        assert_eq!(ProjectPhase::parse("Terminating"), ProjectPhase::Terminating);
        assert_eq!(ProjectPhase::parse("SomethingNew"), ProjectPhase::Unknown);
        assert_eq!(ProjectPhase::Active.to_string(), "Active");
    }

    #[test]
    fn notification_key_accessors() {
        let a = snap("a");
        let b = snap("b");
        let n = ChangeNotification::Updated { old: a, new: b };
        assert_eq!(n.key().as_str(), "b");
        assert_eq!(n.kind(), "updated");
        assert_eq!(n.into_key().as_str(), "b");
    }

    #[test]
    fn error_retryability() {
        assert!(ServiceError::Transient("timeout".into()).is_retryable());
        assert!(ServiceError::Conflict("rv mismatch".into()).is_retryable());
        assert!(!ServiceError::NotFound { key: "x".into() }.is_retryable());
        assert!(!ServiceError::Invalid("bad phase".into()).is_retryable());
    }
}
