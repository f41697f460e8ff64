//! Checkpoint persistence and resumption.

use seabed::config::PullOptions;
use seabed::repl::ActivityLevel;
use seabed::test_harness::PullRig;
use seabed::wire::Profile;

use crate::fixtures::{WAIT, continuous_options, fast_limits, seq};

#[test]
fn resumed_session_subscribes_from_stored_checkpoint() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();

    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 10]]));
    rig.peer.wait_response(changes, WAIT);
    rig.deliver_changes(serde_json::json!([]));
    rig.deliver_rev("docA", "1-aa", "s1", b"{\"n\":1}");
    rig.wait_checkpoint(&seq("s1"), WAIT);
    rig.puller.stop();
    rig.puller.join();

    let resumed = PullRig::with_store(continuous_options(), fast_limits(), rig.store.clone());
    resumed.puller.start();
    resumed.wait_level(ActivityLevel::Busy, WAIT);

    let requests = resumed.peer.requests();
    let sub_changes = requests
        .iter()
        .find(|request| request.profile == Some(Profile::SubChanges))
        .expect("subChanges request");
    assert_eq!(sub_changes.properties.get("since").unwrap(), "s1");
    assert_eq!(sub_changes.properties.get("continuous").unwrap(), "true");

    resumed.puller.stop();
    resumed.puller.join();
}

#[test]
fn differently_configured_session_starts_fresh() {
    let rig = PullRig::new(continuous_options(), fast_limits());
    rig.puller.start();
    let changes = rig.deliver_changes(serde_json::json!([["s1", "docA", "1-aa", false, 10]]));
    rig.peer.wait_response(changes, WAIT);
    rig.deliver_rev("docA", "1-aa", "s1", b"{\"n\":1}");
    rig.wait_checkpoint(&seq("s1"), WAIT);
    rig.puller.stop();
    rig.puller.join();

    // A channel filter changes the fingerprint, so the checkpoint is ignored.
    let mut filtered = continuous_options();
    filtered.channels.push("news".to_string());
    let fresh = PullRig::with_store(filtered, fast_limits(), rig.store.clone());
    fresh.puller.start();
    fresh.wait_level(ActivityLevel::Busy, WAIT);

    let requests = fresh.peer.requests();
    let sub_changes = requests
        .iter()
        .find(|request| request.profile == Some(Profile::SubChanges))
        .expect("subChanges request");
    assert!(!sub_changes.properties.contains_key("since"));
    assert_eq!(
        sub_changes.properties.get("filter").unwrap(),
        "sync_gateway/bychannel"
    );
    assert_eq!(sub_changes.properties.get("channels").unwrap(), "news");

    fresh.puller.stop();
    fresh.puller.join();
}

#[test]
fn doc_id_filter_rides_in_the_subscription_body() {
    let options = PullOptions {
        doc_ids: vec!["docA".to_string(), "docB".to_string()],
        ..continuous_options()
    };
    let rig = PullRig::new(options, fast_limits());
    rig.puller.start();
    rig.wait_level(ActivityLevel::Busy, WAIT);

    let requests = rig.peer.requests();
    let sub_changes = requests
        .iter()
        .find(|request| request.profile == Some(Profile::SubChanges))
        .expect("subChanges request");
    let body: serde_json::Value = serde_json::from_slice(&sub_changes.body).unwrap();
    assert_eq!(body, serde_json::json!({"docIDs": ["docA", "docB"]}));

    rig.puller.stop();
    rig.puller.join();
}
