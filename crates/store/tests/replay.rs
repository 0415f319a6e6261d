#![forbid(unsafe_code)]

use vigil_core::prelude::*;
use vigil_store::{CacheStore, Lister};

fn uid(n: u8) -> Uid {
    let mut u = [0u8; 16];
    u[0] = n;
    u
}

fn snap(name: &str, id: u8, revision: u64) -> ProjectSnapshot {
    ProjectSnapshot {
        key: ProjectKey::from(name),
        uid: uid(id),
        revision,
        phase: ProjectPhase::Active,
        labels: LabelPairs::new(),
        annotations: AnnotationPairs::new(),
        creation_ts: 0,
    }
}

#[test]
fn replay_basic_sequence() {
    let store = CacheStore::new();

    // add a
    let n = store.apply_event(RemoteEvent::Added(snap("a", 1, 1)));
    assert!(matches!(n, Some(ChangeNotification::Added { .. })));
    assert_eq!(store.len(), 1);

    // update a
    let n = store.apply_event(RemoteEvent::Modified(snap("a", 1, 2)));
    match n {
        Some(ChangeNotification::Updated { old, new }) => {
            assert_eq!(old.revision, 1);
            assert_eq!(new.revision, 2);
        }
        other => panic!("expected Updated, got {other:?}"),
    }

    // delete a
    let n = store.apply_event(RemoteEvent::Deleted(snap("a", 1, 3)));
    assert!(matches!(n, Some(ChangeNotification::Deleted { .. })));
    assert!(store.is_empty());

    // deleting again is a no-op
    let n = store.apply_event(RemoteEvent::Deleted(snap("a", 1, 3)));
    assert!(n.is_none());
}

#[test]
fn stale_events_are_discarded() {
    let store = std::sync::Arc::new(CacheStore::new());
    let lister = Lister::new(store.clone());
    store.apply_event(RemoteEvent::Added(snap("a", 1, 5)));

    // same uid, older or equal revision: stale, nothing emitted, cache kept
    assert!(store.apply_event(RemoteEvent::Modified(snap("a", 1, 4))).is_none());
    assert!(store.apply_event(RemoteEvent::Modified(snap("a", 1, 5))).is_none());
    assert_eq!(lister.get(&"a".into()).expect("cached").revision, 5);
}

#[test]
fn uid_replacement_is_not_stale() {
    let store = CacheStore::new();
    store.apply_event(RemoteEvent::Added(snap("a", 1, 10)));

    // delete+recreate can surface with a lower revision but a new uid
    let n = store.apply_event(RemoteEvent::Modified(snap("a", 2, 3)));
    match n {
        Some(ChangeNotification::Updated { new, .. }) => {
            assert_eq!(new.uid, uid(2));
            assert_eq!(new.revision, 3);
        }
        other => panic!("expected Updated, got {other:?}"),
    }
}

#[test]
fn reconcile_list_prunes_missing_keys() {
    let store = CacheStore::new();
    let first = store.reconcile_list(vec![snap("a", 1, 1), snap("b", 2, 1)]);
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|n| n.kind() == "added"));

    // fresh list lost "b" and advanced "a"
    let second = store.reconcile_list(vec![snap("a", 1, 2)]);
    let kinds: Vec<_> = second.iter().map(|n| (n.kind(), n.key().to_string())).collect();
    assert!(kinds.contains(&("updated", "a".to_string())));
    assert!(kinds.contains(&("deleted", "b".to_string())));
    assert_eq!(store.len(), 1);
}

#[test]
fn reconcile_list_keeps_newer_cache_silent() {
    let store = CacheStore::new();
    store.apply_event(RemoteEvent::Added(snap("a", 1, 9)));

    // a list result older than what the watch already delivered
    let notifs = store.reconcile_list(vec![snap("a", 1, 8)]);
    assert!(notifs.is_empty());
}

#[test]
fn resync_re_emits_every_cached_entry() {
    let store = CacheStore::new();
    store.reconcile_list(vec![snap("a", 1, 1), snap("b", 2, 1)]);

    let notifs = store.resync_notifications();
    assert_eq!(notifs.len(), 2);
    for n in notifs {
        match n {
            ChangeNotification::Updated { old, new } => assert_eq!(old, new),
            other => panic!("expected Updated, got {other:?}"),
        }
    }
}

#[test]
fn lister_reads_are_copies() {
    let store = std::sync::Arc::new(CacheStore::new());
    let lister = Lister::new(store.clone());

    store.apply_event(RemoteEvent::Added(snap("a", 1, 1)));
    let got = lister.get(&"a".into()).expect("cached");
    assert_eq!(got.key.as_str(), "a");

    // filter view
    store.apply_event(RemoteEvent::Added(snap("b", 2, 1)));
    let all = lister.list(|_| true);
    assert_eq!(all.len(), 2);
    let only_b = lister.list(|s| s.key.as_str() == "b");
    assert_eq!(only_b.len(), 1);

    assert!(lister.get(&"missing".into()).is_none());
}
