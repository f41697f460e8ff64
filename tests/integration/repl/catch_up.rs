//! Catch-up scenarios: fresh pulls, skip-known, odd advertisements.

use seabed::core::{DocId, RevId};
use seabed::repl::ActivityLevel;
use seabed::store::Store;
use seabed::test_harness::PullRig;
use seabed::wire::{Profile, WireResponse};

use crate::fixtures::{WAIT, continuous_options, fast_limits, seq};

#[test]
fn simple_catch_up_commits_and_checkpoints() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([
        ["s1", "docA", "1-aa", false, 10],
        ["s2", "docB", "1-bb", false, 12],
    ]));
    let reply = rig.peer.wait_response(changes, WAIT);
    assert_eq!(reply, WireResponse::Json(serde_json::json!([[], []])));

    rig.deliver_changes(serde_json::json!([]));
    rig.deliver_rev("docA", "1-aa", "s1", b"{\"n\":1}");
    rig.deliver_rev("docB", "1-bb", "s2", b"{\"n\":2}");

    let documents = rig.delegate.wait_documents(2, WAIT);
    assert!(documents.iter().all(|rev| rev.succeeded()));
    assert!(documents.iter().all(|rev| rev.sequence.is_some()));
    assert!(rig.store.has_rev(&DocId::from("docA"), &RevId::from("1-aa")));
    assert!(rig.store.has_rev(&DocId::from("docB"), &RevId::from("1-bb")));

    rig.wait_checkpoint(&seq("s2"), WAIT);
    rig.wait_level(ActivityLevel::Idle, WAIT);

    let progress = rig.puller.status().progress;
    assert_eq!(progress.completed, progress.total);
    assert_eq!(progress.total, 22);

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn known_revision_completes_without_a_rev_round_trip() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.store
        .insert_rev(&DocId::from("docA"), &RevId::from("1-aa"), None, b"{}");
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 10]]));
    let reply = rig.peer.wait_response(changes, WAIT);
    assert_eq!(reply, WireResponse::Json(serde_json::json!([[]])));

    rig.deliver_changes(serde_json::json!([]));
    rig.wait_checkpoint(&seq("s1"), WAIT);
    rig.wait_level(ActivityLevel::Idle, WAIT);
    assert!(rig.delegate.documents().is_empty());

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn ancestors_are_offered_for_updated_documents() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.store
        .insert_rev(&DocId::from("docA"), &RevId::from("1-aa"), None, b"{}");
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "2-bb", false, 8]]));
    let reply = rig.peer.wait_response(changes, WAIT);
    assert_eq!(reply, WireResponse::Json(serde_json::json!([["1-aa"]])));

    rig.deliver_rev_with_history("docA", "2-bb", "s1", "1-aa", b"{\"n\":2}");
    let documents = rig.delegate.wait_documents(1, WAIT);
    assert!(documents[0].succeeded());
    assert_eq!(
        rig.store.leaf_rev(&DocId::from("docA")),
        Some(RevId::from("2-bb"))
    );

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn empty_sequence_is_counted_but_never_checkpointed() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    rig.deliver_changes(serde_json::json!([
        [null, "docA", "1-aa", false, 10],
        ["s2", "docB", "1-bb", false, 12],
    ]));
    rig.deliver_changes(serde_json::json!([]));
    rig.deliver_rev("docA", "1-aa", "", b"{\"n\":1}");
    rig.deliver_rev("docB", "1-bb", "s2", b"{\"n\":2}");

    let documents = rig.delegate.wait_documents(2, WAIT);
    assert!(documents.iter().all(|rev| rev.succeeded()));

    rig.wait_checkpoint(&seq("s2"), WAIT);
    rig.wait_level(ActivityLevel::Idle, WAIT);

    // The untracked body still counts toward progress.
    let progress = rig.puller.status().progress;
    assert_eq!(progress.completed, progress.total);
    assert_eq!(progress.total, 22);
    for checkpoint in rig.delegate.checkpoints() {
        assert_eq!(checkpoint.last_sequence, seq("s2"));
    }

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn referenced_blobs_are_fetched_before_commit() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.peer.add_blob("sha256-photo", b"jpeg bytes");
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 64]]));
    rig.peer.wait_response(changes, WAIT);
    rig.deliver_changes(serde_json::json!([]));
    rig.deliver_rev(
        "docA",
        "1-aa",
        "s1",
        br#"{"photo":{"@type":"blob","digest":"sha256-photo"}}"#,
    );

    let documents = rig.delegate.wait_documents(1, WAIT);
    assert!(documents[0].succeeded());
    assert!(
        rig.store
            .has_blob(&seabed::core::BlobDigest::new("sha256-photo"))
    );
    rig.wait_checkpoint(&seq("s1"), WAIT);

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn malformed_changes_body_is_rejected_without_state_change() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    let bad = rig.deliver(Profile::Changes, &[], b"{\"not\":\"an array\"}");
    let reply = rig.peer.wait_response(bad, WAIT);
    let WireResponse::Error(error) = reply else {
        panic!("expected error reply, got {reply:?}");
    };
    assert_eq!(error.code, 400);
    assert!(rig.delegate.documents().is_empty());
    assert!(rig.delegate.checkpoints().is_empty());

    rig.puller.stop();
    rig.puller.join();
}
