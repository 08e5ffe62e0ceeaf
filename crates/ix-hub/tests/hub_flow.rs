//! End-to-end hub behavior against a fake remote.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{FakeRemote, ModuleShape};
use ix_hub::{
    BranchPolicy, CacheKey, Hub, HubConfig, HubError, Job, LoadRequest, LockManager, ModuleOrigin,
    ReferenceKind, Role,
};

const SAMPLE: &str = "org/sample-component";
const SAMPLE_URL: &str = "https://github.com/org/sample-component.git";
const FULL_COMMIT: &str = "abc1230000000000000000000000000000000000";

fn hub_with(config: HubConfig, remote: &FakeRemote) -> Hub {
    Hub::builder(config)
        .resolver(remote.clone())
        .fetcher(remote.clone())
        .build()
        .unwrap()
}

fn hub(root: &Path, remote: &FakeRemote) -> Hub {
    hub_with(HubConfig::new(root), remote)
}

fn at(revision: &str) -> LoadRequest {
    LoadRequest::new(SAMPLE).revision(revision)
}

fn forcing(request: &LoadRequest) -> LoadRequest {
    request.clone().force_reload(true)
}

fn workflow_remote() -> FakeRemote {
    let remote = FakeRemote::new(ModuleShape::single(Role::Workflow, "SampleWorkflow"));
    remote.tag("v1.0.0", "abc123");
    remote
}

#[test]
fn tagged_remote_loads_once_and_is_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let remote = workflow_remote();
    let hub = hub(&root, &remote);
    let request = at("v1.0.0").expect_role(Role::Workflow);

    let first = hub.resolve_and_load(&request).unwrap();
    assert_eq!(first.role(), Role::Workflow);
    assert_eq!(first.implementation(), "SampleWorkflow");
    assert_eq!(remote.fetch_calls(), 1);
    assert_eq!(remote.resolve_calls(), 1);

    let resolved = hub.resolve(&request).unwrap();
    assert_eq!(
        resolved.cache_key,
        CacheKey::derive(ReferenceKind::Remote, SAMPLE, SAMPLE_URL, "abc123")
    );
    assert_eq!(resolved.origin, ModuleOrigin::Cached);
    assert_eq!(resolved.resolved, "abc123");
    let path = resolved.path.unwrap();
    assert!(path.starts_with(root.join("objects")));

    // With the cache gone, a repeated call must be served from memory.
    fs::remove_dir_all(&root).unwrap();
    let second = hub.resolve_and_load(&request).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(remote.fetch_calls(), 1);
    assert_eq!(remote.resolve_calls(), 1);

    let spec = second.invoke(&Job::new("nightly")).unwrap();
    assert_eq!(spec.operation, "create_workflow");
    assert_eq!(spec.params["commit"], "abc123");
}

#[test]
fn pinned_tag_skips_the_remote_in_a_new_hub() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    let request = at("v1.0.0");
    let first = hub(dir.path(), &remote).resolve(&request).unwrap();

    let later = workflow_remote();
    let second = hub(dir.path(), &later).resolve(&request).unwrap();
    assert_eq!(first.cache_key, second.cache_key);
    assert_eq!(first.path, second.path);
    assert_eq!(later.resolve_calls(), 0);
    assert_eq!(later.fetch_calls(), 0);
}

#[test]
fn concurrent_first_use_fetches_once_within_a_hub() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    remote.set_fetch_delay(Duration::from_millis(150));
    let hub = Arc::new(hub(dir.path(), &remote));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let hub = hub.clone();
            thread::spawn(move || hub.resolve_and_load(&at("v1.0.0")).unwrap())
        })
        .collect();
    let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(remote.fetch_calls(), 1);
    assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(hub.cached_entries().unwrap().len(), 1);
}

#[test]
fn concurrent_first_use_fetches_once_across_hubs() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    remote.set_fetch_delay(Duration::from_millis(150));
    let root = dir.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let remote = remote.clone();
            let root = root.clone();
            thread::spawn(move || {
                let hub = hub(&root, &remote);
                hub.resolve(&at("v1.0.0")).unwrap()
            })
        })
        .collect();
    let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(remote.fetch_calls(), 1);
    assert!(resolved.windows(2).all(|w| w[0].path == w[1].path));
}

#[test]
fn offline_uses_pinned_entries_without_the_resolver() {
    let dir = tempfile::tempdir().unwrap();
    let online = workflow_remote();
    online.branch("main", "def456");
    online.tag("v1.1.0", FULL_COMMIT);
    let h = hub(dir.path(), &online);
    h.resolve(&at("v1.0.0")).unwrap();
    h.resolve(&at("main")).unwrap();
    h.resolve(&at("v1.1.0")).unwrap();

    let offline = workflow_remote();
    let h = hub_with(HubConfig::new(dir.path()).with_offline(true), &offline);
    let tagged = h.resolve_and_load(&at("v1.0.0")).unwrap();
    assert_eq!(tagged.implementation(), "SampleWorkflow");
    let branch = h.resolve(&at("main")).unwrap();
    assert_eq!(branch.resolved, "def456");
    // A full commit id published under a tag needs no pin of its own.
    let upper = FULL_COMMIT.to_ascii_uppercase();
    let by_commit = h.resolve(&at(&upper)).unwrap();
    assert_eq!(by_commit.resolved, FULL_COMMIT);
    assert_eq!(
        by_commit.cache_key,
        CacheKey::derive(ReferenceKind::Remote, SAMPLE, SAMPLE_URL, FULL_COMMIT)
    );
    assert_eq!(offline.resolve_calls(), 0);
    assert_eq!(offline.fetch_calls(), 0);

    let err = h.resolve(&at("v2.0.0")).unwrap_err();
    assert!(matches!(err, HubError::Offline { .. }), "{err}");
    let unpublished = "0".repeat(40);
    let err = h.resolve(&at(&unpublished)).unwrap_err();
    assert!(matches!(err, HubError::Offline { .. }), "{err}");
}

#[test]
fn offline_with_empty_cache_fails_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    let h = hub_with(HubConfig::new(dir.path()).with_offline(true), &remote);
    let err = h.resolve_and_load(&at("v1.0.0")).unwrap_err();
    match err {
        HubError::Offline { reference } => assert_eq!(reference, "org/sample-component@v1.0.0"),
        other => panic!("unexpected: {other}"),
    }
    assert_eq!(remote.resolve_calls(), 0);
    assert_eq!(remote.fetch_calls(), 0);
}

#[test]
fn refresh_policy_follows_a_moving_branch() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    remote.branch("main", "c1");
    let h = hub(dir.path(), &remote);
    let request = at("main");

    let first = h.resolve_and_load(&request).unwrap();
    // Unchanged branch: re-resolved, not re-fetched.
    let again = h.resolve_and_load(&request).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(remote.resolve_calls(), 2);
    assert_eq!(remote.fetch_calls(), 1);

    remote.branch("main", "c2");
    let moved = h.resolve_and_load(&request).unwrap();
    assert!(!Arc::ptr_eq(&first, &moved));
    assert_eq!(remote.fetch_calls(), 2);
    let spec = moved.invoke(&Job::new("j")).unwrap();
    assert_eq!(spec.params["commit"], "c2");
}

#[test]
fn pinned_policy_holds_a_branch_until_forced() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    remote.branch("main", "c1");
    let h = hub_with(
        HubConfig::new(dir.path()).with_branch_policy(BranchPolicy::Pinned),
        &remote,
    );
    let request = at("main");

    let first = h.resolve_and_load(&request).unwrap();
    remote.branch("main", "c2");
    let still = h.resolve_and_load(&request).unwrap();
    assert!(Arc::ptr_eq(&first, &still));
    assert_eq!(remote.resolve_calls(), 1);

    // A fresh hub on the same cache honours the on-disk pin.
    let other = hub_with(
        HubConfig::new(dir.path()).with_branch_policy(BranchPolicy::Pinned),
        &remote,
    );
    assert_eq!(other.resolve(&request).unwrap().resolved, "c1");
    assert_eq!(remote.resolve_calls(), 1);

    let forced = h.resolve_and_load(&forcing(&request)).unwrap();
    assert!(!Arc::ptr_eq(&first, &forced));
    assert_eq!(remote.resolve_calls(), 2);
    assert_eq!(remote.fetch_calls(), 2);
    let spec = forced.invoke(&Job::new("j")).unwrap();
    assert_eq!(spec.params["commit"], "c2");

    // The refreshed pin is what later plain calls see. A hub that already
    // resolved the branch keeps its own memo.
    assert_eq!(h.resolve(&request).unwrap().resolved, "c2");
    assert_eq!(other.resolve(&request).unwrap().resolved, "c1");
    let fresh = hub_with(
        HubConfig::new(dir.path()).with_branch_policy(BranchPolicy::Pinned),
        &remote,
    );
    assert_eq!(fresh.resolve(&request).unwrap().resolved, "c2");
    assert_eq!(remote.resolve_calls(), 2);
}

#[test]
fn force_reload_refetches_an_unchanged_tag() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    let h = hub(dir.path(), &remote);
    let request = at("v1.0.0");

    let before = h.resolve(&request).unwrap();
    let first = h.resolve_and_load(&request).unwrap();
    let forced = h.resolve_and_load(&forcing(&request)).unwrap();
    let after = h.resolve(&request).unwrap();

    assert_eq!(remote.fetch_calls(), 2);
    assert!(!Arc::ptr_eq(&first, &forced));
    assert_eq!(before.cache_key, after.cache_key);
    assert_ne!(before.path, after.path);
    // The old object stays readable until pruned.
    assert!(before.path.as_ref().unwrap().is_dir());
    let report = h.prune_cache().unwrap();
    assert_eq!(report.objects_removed, 1);
    assert!(!before.path.as_ref().unwrap().exists());
    assert!(after.path.as_ref().unwrap().is_dir());
}

#[test]
fn discovery_with_zero_one_or_two_implementations() {
    let load = |shape: ModuleShape| {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new(shape);
        remote.tag("v1", "0123abcd");
        hub(dir.path(), &remote).resolve_and_load(&at("v1"))
    };

    let one = load(ModuleShape::single(Role::Agent, "OnlyAgent")).unwrap();
    assert_eq!(one.implementation(), "OnlyAgent");

    let none = ModuleShape {
        implementations: vec![],
        ..ModuleShape::single(Role::Agent, "unused")
    };
    match load(none).unwrap_err() {
        HubError::NoImplementationFound {
            role,
            cache_key,
            ..
        } => {
            assert_eq!(role, Role::Agent);
            assert!(cache_key.starts_with("remote--org--sample-component--"));
        }
        other => panic!("unexpected: {other}"),
    }

    let two = ModuleShape {
        implementations: vec!["First".into(), "Second".into()],
        ..ModuleShape::single(Role::Agent, "unused")
    };
    match load(two.clone()).unwrap_err() {
        HubError::AmbiguousImplementation { candidates, .. } => {
            assert_eq!(candidates, vec!["First", "Second"]);
        }
        other => panic!("unexpected: {other}"),
    }

    let named = ModuleShape {
        explicit: Some("Second".into()),
        ..two
    };
    assert_eq!(load(named).unwrap().implementation(), "Second");
}

#[test]
fn invalid_fetched_tree_is_never_published() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new(ModuleShape {
        broken: true,
        ..ModuleShape::single(Role::Agent, "A")
    });
    remote.tag("v1", "beef");
    let h = hub(dir.path(), &remote);
    let err = h.resolve(&at("v1")).unwrap_err();
    assert!(matches!(err, HubError::InvalidModule { .. }), "{err}");
    assert!(h.cached_entries().unwrap().is_empty());

    remote.set_shape(ModuleShape::single(Role::Agent, "A"));
    h.resolve(&at("v1")).unwrap();
    assert_eq!(h.cached_entries().unwrap().len(), 1);
}

#[test]
fn held_lock_times_out_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    let h = hub_with(
        HubConfig::new(dir.path()).with_lock_timeout(Duration::from_millis(200)),
        &remote,
    );
    let key = CacheKey::derive(ReferenceKind::Remote, SAMPLE, SAMPLE_URL, "abc123");
    let holder = LockManager::new(h.cache().locks_dir(), Duration::from_secs(1));
    let guard = holder.acquire(&key).unwrap();

    let err = h.resolve(&at("v1.0.0")).unwrap_err();
    match &err {
        HubError::LockTimeout {
            reference,
            cache_key,
            ..
        } => {
            assert_eq!(reference, "org/sample-component@v1.0.0");
            assert_eq!(cache_key, key.as_str());
        }
        other => panic!("unexpected: {other}"),
    }
    assert!(err.is_transient());
    assert_eq!(remote.fetch_calls(), 0);

    drop(guard);
    h.resolve(&at("v1.0.0")).unwrap();
    assert_eq!(remote.fetch_calls(), 1);
}

#[test]
fn corrupt_pointer_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    let request = at("v1.0.0");
    let resolved = hub(dir.path(), &remote).resolve(&request).unwrap();

    let name = format!("{}.json", resolved.cache_key);
    let pointer = dir.path().join("entries").join(name);
    fs::write(&pointer, "{ not json").unwrap();

    let err = hub(dir.path(), &remote).resolve(&request).unwrap_err();
    match err {
        HubError::CorruptCacheEntry { cache_key, .. } => {
            assert_eq!(cache_key, resolved.cache_key.as_str())
        }
        other => panic!("unexpected: {other}"),
    }
}

#[test]
fn clearing_one_revision_forces_a_refetch() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    remote.tag("v2.0.0", "fed987");
    let h = hub(dir.path(), &remote);
    let v1 = at("v1.0.0");
    let v2 = at("v2.0.0");
    let first = h.resolve_and_load(&v1).unwrap();
    h.resolve_and_load(&v2).unwrap();
    assert_eq!(remote.fetch_calls(), 2);

    assert_eq!(h.clear_cache(Some(SAMPLE), Some("v1.0.0")).unwrap(), 1);
    assert_eq!(h.cached_entries().unwrap().len(), 1);

    let reloaded = h.resolve_and_load(&v1).unwrap();
    assert!(!Arc::ptr_eq(&first, &reloaded));
    assert_eq!(remote.fetch_calls(), 3);
    h.resolve_and_load(&v2).unwrap();
    assert_eq!(remote.fetch_calls(), 3);

    assert_eq!(h.clear_cache(None, None).unwrap(), 2);
    assert!(h.cached_entries().unwrap().is_empty());
    assert!(h.registry().is_empty());
}

#[test]
fn unknown_revision_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let remote = workflow_remote();
    let err = hub(dir.path(), &remote).resolve(&at("v9")).unwrap_err();
    assert!(matches!(err, HubError::RevisionNotFound { .. }), "{err}");
    assert!(!err.is_transient());
}
