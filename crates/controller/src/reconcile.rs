//! The corrective action, as a pure function of an observed snapshot.

use tracing::debug;
use vigil_core::{anno, ProjectPhase, ProjectSnapshot};

/// Compute the update a project needs, if any.
///
/// A project with an empty or absent display-name annotation gets it
/// derived from the requester annotation as `"<requester>'s <name>"`.
/// Terminating projects are left alone. Returns `None` when the observed
/// state is already the desired state, which is what makes the reconcile
/// idempotent.
pub fn desired_update(snapshot: &ProjectSnapshot) -> Option<ProjectSnapshot> {
    if snapshot.phase == ProjectPhase::Terminating {
        debug!(key = %snapshot.key, "terminating; skipping");
        return None;
    }
    if snapshot
        .annotation(anno::DISPLAY_NAME)
        .is_some_and(|dn| !dn.is_empty())
    {
        return None;
    }
    let requester = snapshot.annotation(anno::REQUESTER).unwrap_or_default();
    let display_name = format!("{}'s {}", requester, snapshot.key);
    Some(snapshot.with_annotation(anno::DISPLAY_NAME, display_name))
}
