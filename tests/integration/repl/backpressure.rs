//! Flow-control behavior under a flood of rev messages.

use std::collections::HashSet;
use std::time::Duration;

use seabed::core::{DocId, Limits, RevId};
use seabed::repl::ActivityLevel;
use seabed::test_harness::PullRig;

use crate::fixtures::{WAIT, continuous_options, seq};

const REVS: usize = 60;

fn tight_limits() -> Limits {
    Limits {
        max_active_incoming_revs: 5,
        max_unfinished_incoming_revs: 20,
        insert_batch_revs: 8,
        insert_batch_latency_ms: 5,
        incoming_rev_workers: 4,
        ..Limits::default()
    }
}

#[test]
fn rev_flood_drains_without_deadlock() {
    let rig = PullRig::new(continuous_options(), tight_limits());
    rig.puller.start();

    let entries: Vec<serde_json::Value> = (0..REVS)
        .map(|i| serde_json::json!([format!("s{i:03}"), format!("doc{i:03}"), "1-aa", false, 4]))
        .collect();
    let changes = rig.deliver_changes(serde_json::Value::Array(entries));
    rig.peer.wait_response(changes, WAIT);
    rig.deliver_changes(serde_json::json!([]));

    for i in 0..REVS {
        rig.deliver_rev(
            &format!("doc{i:03}"),
            "1-aa",
            &format!("s{i:03}"),
            b"{\"n\":1}",
        );
    }

    let documents = rig.delegate.wait_documents(REVS, Duration::from_secs(20));
    assert!(documents.iter().all(|rev| rev.succeeded()));

    // Exactly one notification per admitted revision.
    std::thread::sleep(Duration::from_millis(50));
    let documents = rig.delegate.documents();
    assert_eq!(documents.len(), REVS);
    let distinct: HashSet<String> = documents.iter().map(|rev| rev.doc_id.to_string()).collect();
    assert_eq!(distinct.len(), REVS);

    for i in 0..REVS {
        assert!(rig.store.has_rev(
            &DocId::from(format!("doc{i:03}").as_str()),
            &RevId::from("1-aa")
        ));
    }

    rig.wait_checkpoint(&seq(&format!("s{:03}", REVS - 1)), WAIT);
    rig.wait_level(ActivityLevel::Idle, WAIT);

    rig.puller.stop();
    rig.puller.join();
}

#[test]
fn same_document_revisions_notify_in_pipeline_order() {
    let rig = PullRig::new(continuous_options(), tight_limits());
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([
        ["s1", "docA", "1-aa", false, 4],
        ["s2", "docA", "2-bb", false, 4],
        ["s3", "docA", "3-cc", false, 4],
    ]));
    rig.peer.wait_response(changes, WAIT);
    rig.deliver_changes(serde_json::json!([]));

    rig.deliver_rev("docA", "1-aa", "s1", b"{\"n\":1}");
    rig.deliver_rev_with_history("docA", "2-bb", "s2", "1-aa", b"{\"n\":2}");
    rig.deliver_rev_with_history("docA", "3-cc", "s3", "2-bb,1-aa", b"{\"n\":3}");

    let documents = rig.delegate.wait_documents(3, WAIT);
    let order: Vec<String> = documents.iter().map(|rev| rev.rev_id.to_string()).collect();
    assert_eq!(order, vec!["1-aa", "2-bb", "3-cc"]);

    rig.wait_checkpoint(&seq("s3"), WAIT);
    rig.puller.stop();
    rig.puller.join();
}
