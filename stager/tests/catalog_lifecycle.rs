//! End-to-end catalog lifecycle: new, build, and per-target test sessions
//! against a local fixture repository and a fake agent gateway.

use std::fs;
use std::path::Path;

use stager::catalog::Catalog;
use stager::session::{RepoSource, SessionStore};
use stager::test_support::{FakeGateway, fixture_store, init_fixture_repo};

struct Harness {
    store: SessionStore,
    catalog: Catalog,
    source: RepoSource,
}

fn harness(temp: &Path) -> Harness {
    let origin = temp.join("origin-widget");
    init_fixture_repo(&origin);
    Harness {
        store: fixture_store(temp),
        catalog: Catalog::new(temp.join("catalog")),
        source: RepoSource::local("acme", "widget", &origin),
    }
}

#[test]
fn full_lifecycle_new_build_test() {
    let temp = tempfile::tempdir().expect("tempdir");
    let h = harness(temp.path());
    let gateway = FakeGateway::appending(temp.path(), "agent work\n");

    let build_id = h.catalog.catalog_new(&h.store, &h.source).expect("new");
    h.catalog
        .catalog_build(&h.store, &gateway, &h.source)
        .expect("build");
    let child = h
        .catalog
        .catalog_test(&h.store, &gateway, &h.source, "src/util.c:parse_time")
        .expect("test");

    assert_ne!(build_id, child);
    // The build session froze when its first child was forked.
    assert!(h.store.has_child(build_id));
    assert!(!h.store.has_child(child));

    // Catalog layout is inspectable on disk.
    let entry = temp.path().join("catalog/acme/widget");
    assert!(entry.join("build/built").exists());
    assert!(entry.join("test/src/util.c/parse_time/finished").exists());

    // The child carries the build session's transcript, rewritten to its id.
    let child_transcript =
        fs::read_to_string(h.store.session_dir(child).join("rollout.jsonl")).expect("read");
    assert!(child_transcript.contains("agent work"));
    assert!(child_transcript.contains(&child.to_string()));
    assert!(!child_transcript.contains(&build_id.to_string()));
}

#[test]
fn lifecycle_enforces_state_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let h = harness(temp.path());
    let gateway = FakeGateway::appending(temp.path(), "work\n");

    let err = h
        .catalog
        .catalog_build(&h.store, &gateway, &h.source)
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    h.catalog.catalog_new(&h.store, &h.source).expect("new");
    let err = h
        .catalog
        .catalog_test(&h.store, &gateway, &h.source, "lib.c:fmt")
        .unwrap_err();
    assert!(err.to_string().contains("not built"));
}

#[test]
fn targets_get_isolated_checkouts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let h = harness(temp.path());
    let gateway = FakeGateway::appending(temp.path(), "work\n");

    h.catalog.catalog_new(&h.store, &h.source).expect("new");
    h.catalog
        .catalog_build(&h.store, &gateway, &h.source)
        .expect("build");
    let a = h
        .catalog
        .catalog_test(&h.store, &gateway, &h.source, "lib.c:parse")
        .expect("a");
    let b = h
        .catalog
        .catalog_test(&h.store, &gateway, &h.source, "lib.c:fmt")
        .expect("b");

    // Each target owns a full checkout; mutating one leaves the other alone.
    let a_repo = h.store.session_dir(a).join("repo/widget");
    let b_repo = h.store.session_dir(b).join("repo/widget");
    fs::write(a_repo.join("scratch.txt"), "a only\n").expect("write");
    assert!(!b_repo.join("scratch.txt").exists());
    assert!(b_repo.join("README.md").exists());
}
