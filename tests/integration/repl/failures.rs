//! Transient failures, retry safety, and out-of-order completion.

use seabed::core::{DocId, RevId};
use seabed::repl::ActivityLevel;
use seabed::store::StoreError;
use seabed::test_harness::PullRig;

use crate::fixtures::{WAIT, continuous_options, fast_limits, seq};

#[test]
fn transient_commit_failure_keeps_sequence_pending() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();
    rig.store
        .fail_next_commit(StoreError::Busy("commit contention".into()));

    rig.deliver_changes(serde_json::json!([["s3", "docC", "1-cc", false, 20]]));
    rig.deliver_changes(serde_json::json!([]));
    rig.deliver_rev("docC", "1-cc", "s3", b"{\"n\":3}");

    let documents = rig.delegate.wait_documents(1, WAIT);
    let failed = &documents[0];
    assert!(failed.error.is_some());
    assert!(failed.error_is_transient);
    assert!(!rig.store.has_rev(&DocId::from("docC"), &RevId::from("1-cc")));

    rig.wait_level(ActivityLevel::Idle, WAIT);

    // The checkpoint must not move past the failed sequence...
    assert!(
        rig.delegate
            .checkpoints()
            .iter()
            .all(|checkpoint| checkpoint.last_sequence != seq("s3"))
    );
    // ...but its bytes still count toward progress.
    let progress = rig.puller.status().progress;
    assert_eq!(progress.completed, progress.total);

    rig.puller.stop();
    rig.puller.join();

    // A later session over the same store re-requests and lands the revision.
    let retry = PullRig::with_store(continuous_options(), fast_limits(), rig.store.clone());
    retry.puller.start();
    let changes = retry.deliver_changes(serde_json::json!([["s3", "docC", "1-cc", false, 20]]));
    retry.peer.wait_response(changes, WAIT);
    retry.deliver_rev("docC", "1-cc", "s3", b"{\"n\":3}");

    let documents = retry.delegate.wait_documents(1, WAIT);
    assert!(documents[0].succeeded());
    assert!(retry.store.has_rev(&DocId::from("docC"), &RevId::from("1-cc")));
    retry.wait_checkpoint(&seq("s3"), WAIT);

    retry.puller.stop();
    retry.puller.join();
}

#[test]
fn out_of_order_completion_defers_the_checkpoint() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    rig.deliver_changes(serde_json::json!([
        ["s4", "docD", "1-dd", false, 4],
        ["s5", "docE", "1-ee", false, 5],
        ["s6", "docF", "1-ff", false, 6],
    ]));
    rig.deliver_changes(serde_json::json!([]));

    // s5 lands first; the watermark must hold until s4 completes.
    rig.deliver_rev("docE", "1-ee", "s5", b"{\"n\":5}");
    rig.delegate.wait_documents(1, WAIT);
    assert!(
        rig.delegate
            .checkpoints()
            .iter()
            .all(|checkpoint| checkpoint.last_sequence != seq("s5"))
    );

    rig.deliver_rev("docD", "1-dd", "s4", b"{\"n\":4}");
    rig.wait_checkpoint(&seq("s5"), WAIT);

    rig.deliver_rev("docF", "1-ff", "s6", b"{\"n\":6}");
    rig.wait_checkpoint(&seq("s6"), WAIT);
    rig.wait_level(ActivityLevel::Idle, WAIT);

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn norev_completes_the_sequence_without_a_document() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 10]]));
    rig.peer.wait_response(changes, WAIT);

    let norev = rig.deliver_norev("docA", "s1");
    rig.peer.wait_response(norev, WAIT);
    rig.deliver_changes(serde_json::json!([]));

    rig.wait_checkpoint(&seq("s1"), WAIT);
    rig.wait_level(ActivityLevel::Idle, WAIT);
    assert!(rig.delegate.documents().is_empty());

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn disconnect_drains_and_stops() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 10]]));
    rig.peer.wait_response(changes, WAIT);

    rig.peer.disconnect();
    rig.puller.disconnected();

    rig.wait_level(ActivityLevel::Stopped, WAIT);
    rig.puller.join();

    // The un-arrived revision stays pending; no checkpoint moved past it.
    assert!(
        rig.delegate
            .checkpoints()
            .iter()
            .all(|checkpoint| checkpoint.last_sequence != seq("s1"))
    );
}

#[test]
fn fatal_subscription_error_stops_the_session() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.peer.reject_sub_changes(seabed::core::ErrorPayload::new(
        seabed::core::ErrorDomain::Http,
        401,
        "unauthorized",
    ));
    rig.puller.start();

    rig.wait_level(ActivityLevel::Stopped, WAIT);
    rig.puller.join();
}
