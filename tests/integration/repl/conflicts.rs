//! Conflict-free sessions and the proposeChanges flow.

use seabed::config::{PullMode, PullOptions};
use seabed::core::{DocId, RevId};
use seabed::test_harness::PullRig;
use seabed::wire::WireResponse;

use crate::fixtures::{WAIT, fast_limits};

fn passive_no_conflict_options() -> PullOptions {
    PullOptions {
        mode: PullMode::Passive,
        no_incoming_conflicts: true,
        ..PullOptions::default()
    }
}

#[test]
fn plain_changes_is_rejected_in_no_conflict_mode() {
    let rig = PullRig::new(passive_no_conflict_options(), fast_limits());
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 10]]));
    let reply = rig.peer.wait_response(changes, WAIT);
    let WireResponse::Error(error) = reply else {
        panic!("expected 409 reply, got {reply:?}");
    };
    assert_eq!(error.code, 409);
    assert!(rig.delegate.documents().is_empty());
    assert_eq!(rig.store.rev_count(), 0);

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn propose_changes_answers_per_descriptor_statuses() {
    let rig = PullRig::new(passive_no_conflict_options(), fast_limits());
    rig.store
        .insert_rev(&DocId::from("docA"), &RevId::from("1-aa"), None, b"{}");
    rig.puller.start();

    let propose = rig.deliver_propose_changes(serde_json::json!([
        ["s1", "docA", "1-aa", false, 10],
        ["s2", "docA", "1-zz", false, 10],
        ["s3", "docB", "1-bb", false, 10],
    ]));
    let reply = rig.peer.wait_response(propose, WAIT);
    assert_eq!(reply, WireResponse::Json(serde_json::json!([304, 409])));

    rig.deliver_rev("docB", "1-bb", "s3", b"{\"n\":1}");
    let documents = rig.delegate.wait_documents(1, WAIT);
    assert!(documents[0].succeeded());
    assert!(rig.store.has_rev(&DocId::from("docB"), &RevId::from("1-bb")));

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn accepted_proposal_extends_the_document_line() {
    let rig = PullRig::new(passive_no_conflict_options(), fast_limits());
    rig.store
        .insert_rev(&DocId::from("docA"), &RevId::from("1-aa"), None, b"{}");
    rig.puller.start();

    let propose =
        rig.deliver_propose_changes(serde_json::json!([["s9", "docA", "2-bb", false, 6]]));
    let reply = rig.peer.wait_response(propose, WAIT);
    assert_eq!(reply, WireResponse::Json(serde_json::json!([])));

    rig.deliver_rev_with_history("docA", "2-bb", "s9", "1-aa", b"{\"n\":2}");
    let documents = rig.delegate.wait_documents(1, WAIT);
    assert!(documents[0].succeeded());
    assert_eq!(
        rig.store.leaf_rev(&DocId::from("docA")),
        Some(RevId::from("2-bb"))
    );

    rig.puller.stop();
    rig.puller.join();
}
