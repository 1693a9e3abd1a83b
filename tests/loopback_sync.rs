use std::sync::Arc;
use std::time::Duration;

use dx_sync::object::ValueKind;
use dx_sync::sync::{apply_remote_change, sync_state, ApplyOutcome};
use dx_sync::{
    ChangeNotification, EngineObject, LoopbackHub, ObjectId, SyncBuilder, SyncClient,
};
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};

fn element(id: &str) -> Arc<EngineObject> {
    EngineObject::builder(id, "demo.Element")
        .value("Name", ValueKind::Text, "")
        .value("Opacity", ValueKind::Float, 1.0)
        .value("Transform", ValueKind::Structured, json!({ "x": 0, "y": 0 }))
        .value("Tag", ValueKind::Structured, json!(null))
        .build()
}

fn project(children: &[Arc<EngineObject>]) -> Arc<EngineObject> {
    children
        .iter()
        .fold(
            EngineObject::builder("project-1", "demo.Project").value("Name", ValueKind::Text, ""),
            |builder, child| builder.child(child.clone()),
        )
        .build()
}

async fn client(hub: &Arc<LoopbackHub>, name: &str, session: &str) -> SyncClient {
    let client = SyncBuilder::new()
        .loopback(hub.clone())
        .source_id(name)
        .build()
        .expect("build client");
    client.join(session).await.expect("join session");
    client
}

/// Poll until `check` holds or two seconds pass
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alice_edit_reaches_bob() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S").await;
    let bob = client(&hub, "Bob", "S").await;

    let alice_project = project(&[]);
    let bob_project = project(&[]);
    alice.sync_project(alice_project.clone()).await.unwrap();
    bob.sync_project(bob_project.clone()).await.unwrap();

    let mut bob_remote = bob.manager.remote_changes();
    alice_project.set("Name", "Hello").unwrap();

    let change = timeout(Duration::from_secs(2), bob_remote.recv())
        .await
        .expect("change delivered")
        .unwrap();
    assert_eq!(change.change_source, "Alice");
    assert_eq!(change.sequence_number, Some(1));
    assert_eq!(change.object_type_name.as_deref(), Some("demo.Project"));
    assert_eq!(change.session_id, "S");

    assert!(eventually(|| bob_project.get("Name") == json!("Hello")).await);

    let alice_state = sync_state(&*alice_project).unwrap();
    let bob_state = sync_state(&*bob_project).unwrap();
    assert_eq!(alice_state.local_sequence(), 1);
    assert_eq!(bob_state.last_remote_sequence(), Some(1));
    // Applying a remote change never produces an outbound one
    assert_eq!(bob_state.local_sequence(), 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn applied_changes_do_not_echo_back() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S").await;
    let bob = client(&hub, "Bob", "S").await;

    let alice_project = project(&[]);
    let bob_project = project(&[]);
    alice.sync_project(alice_project.clone()).await.unwrap();
    bob.sync_project(bob_project.clone()).await.unwrap();

    let mut alice_remote = alice.manager.remote_changes();
    alice_project.set("Name", "Ping").unwrap();
    assert!(eventually(|| bob_project.get("Name") == json!("Ping")).await);

    sleep(Duration::from_millis(100)).await;
    assert!(alice_remote.try_recv().is_err(), "bob re-broadcast an applied change");
    assert_eq!(sync_state(&*bob_project).unwrap().local_sequence(), 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_and_old_sequences_are_ignored() {
    let hub = Arc::new(LoopbackHub::new());
    let bob = client(&hub, "Bob", "S").await;
    let target = project(&[]);
    bob.sync_project(target.clone()).await.unwrap();
    let state = sync_state(&*target).unwrap();

    let change = |value: &str, seq: u64| {
        ChangeNotification::new("project-1", "Name", json!(value))
            .with_source("Alice")
            .with_sequence(seq)
    };

    assert_eq!(apply_remote_change(&*target, &state, &change("five", 5)), ApplyOutcome::Applied);
    assert_eq!(
        apply_remote_change(&*target, &state, &change("five again", 5)),
        ApplyOutcome::Stale { sequence: 5, last: 5 }
    );
    assert_eq!(
        apply_remote_change(&*target, &state, &change("three", 3)),
        ApplyOutcome::Stale { sequence: 3, last: 5 }
    );
    assert_eq!(target.get("Name"), json!("five"));
    assert_eq!(state.last_remote_sequence(), Some(5));

    // Changes without a sequence number always apply
    let unsequenced = ChangeNotification::new("project-1", "Name", json!("unsequenced"));
    assert_eq!(apply_remote_change(&*target, &state, &unsequenced), ApplyOutcome::Applied);
    assert_eq!(state.last_remote_sequence(), Some(5));

    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn structured_values_and_unknown_properties() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S").await;
    let bob = client(&hub, "Bob", "S").await;

    let alice_element = element("element-1");
    let bob_element = element("element-1");
    alice.sync_project(project(&[alice_element.clone()])).await.unwrap();
    bob.sync_project(project(&[bob_element.clone()])).await.unwrap();

    alice_element.set("Transform", json!({ "x": 12, "y": -4 })).unwrap();
    assert!(eventually(|| bob_element.get("Transform") == json!({ "x": 12, "y": -4 })).await);

    let state = sync_state(&*bob_element).unwrap();
    let bogus = ChangeNotification::new("element-1", "DoesNotExist", json!(1)).with_sequence(100);
    assert_eq!(apply_remote_change(&*bob_element, &state, &bogus), ApplyOutcome::UnknownProperty);
    let mistyped = ChangeNotification::new("element-1", "Opacity", json!("opaque")).with_sequence(101);
    assert_eq!(apply_remote_change(&*bob_element, &state, &mistyped), ApplyOutcome::ConversionFailed);
    assert_eq!(bob_element.get("Opacity"), json!(1.0));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn structured_strings_arrive_unchanged() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S").await;
    let bob = client(&hub, "Bob", "S").await;

    let alice_element = element("element-1");
    let bob_element = element("element-1");
    alice.sync_project(project(&[alice_element.clone()])).await.unwrap();
    bob.sync_project(project(&[bob_element.clone()])).await.unwrap();

    for value in [json!("plain"), json!("42"), json!(42), json!([1, "two"])] {
        alice_element.set("Tag", value.clone()).unwrap();
        assert!(
            eventually(|| bob_element.get("Tag") == value).await,
            "{value} did not arrive intact"
        );
    }
    assert_eq!(sync_state(&*bob_element).unwrap().last_remote_sequence(), Some(4));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn orchestrator_follows_structural_changes() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S").await;
    let bob = client(&hub, "Bob", "S").await;

    let alice_project = project(&[element("element-1")]);
    let bob_project = project(&[element("element-1")]);
    alice.sync_project(alice_project.clone()).await.unwrap();
    bob.sync_project(bob_project.clone()).await.unwrap();
    assert_eq!(alice.orchestrator.tracked_count(), 2);

    // A child added after the project started syncing is picked up
    let alice_late = element("element-2");
    let bob_late = element("element-2");
    alice_project.add_child(alice_late.clone());
    bob_project.add_child(bob_late.clone());
    let late_id = ObjectId::from("element-2");
    assert!(alice.orchestrator.is_object_synchronized(&late_id));
    assert!(bob.orchestrator.is_object_synchronized(&late_id));

    alice_late.set("Name", "Late").unwrap();
    assert!(eventually(|| bob_late.get("Name") == json!("Late")).await);

    // Once removed, it no longer sends anything
    alice_project.remove_child(&late_id);
    assert!(!alice.orchestrator.is_object_synchronized(&late_id));
    assert!(!alice.manager.is_registered(&late_id));

    let mut bob_remote = bob.manager.remote_changes();
    alice_late.set("Name", "Detached").unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(bob_remote.try_recv().is_err());
    assert_eq!(bob_late.get("Name"), json!("Late"));

    alice.shutdown().await;
    bob.shutdown().await;
    assert_eq!(alice.orchestrator.tracked_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_are_isolated() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S1").await;
    let mallory = client(&hub, "Mallory", "S2").await;

    let alice_project = project(&[]);
    let mallory_project = project(&[]);
    alice.sync_project(alice_project.clone()).await.unwrap();
    mallory.sync_project(mallory_project.clone()).await.unwrap();

    alice_project.set("Name", "Private").unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(mallory_project.get("Name"), json!(""));

    alice.shutdown().await;
    mallory.shutdown().await;
    assert_eq!(hub.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_after_stop_are_not_sent() {
    let hub = Arc::new(LoopbackHub::new());
    let alice = client(&hub, "Alice", "S").await;
    let bob = client(&hub, "Bob", "S").await;

    let alice_project = project(&[]);
    let bob_project = project(&[]);
    alice.sync_project(alice_project.clone()).await.unwrap();
    bob.sync_project(bob_project.clone()).await.unwrap();

    alice.shutdown().await;
    alice_project.set("Name", "Offline").unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bob_project.get("Name"), json!(""));
    assert_eq!(hub.member_count("S"), 1);

    bob.shutdown().await;
}
