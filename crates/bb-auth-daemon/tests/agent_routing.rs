//! Provider arbitration, event steering, and the authorization gate,
//! exercised through the full agent.

mod common;

use serde_json::json;

use common::Harness;

#[tokio::test]
async fn provider_priority_election() {
    let mut harness = Harness::new();
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    harness
        .send(&a, json!({ "type": "ui.register", "name": "a", "priority": 10 }))
        .await;
    let reply = a.expect("ui.registered");
    assert_eq!(reply["active"], true);
    assert_eq!(reply["priority"], 10);

    harness
        .send(&b, json!({ "type": "ui.register", "name": "b", "priority": 20 }))
        .await;
    let reply = b.expect("ui.registered");
    assert_eq!(reply["active"], true);
    assert!(harness.agent.core().has_active_provider());

    // Election changed hands, so a heartbeat from A reports inactive.
    harness.send(&a, json!({ "type": "ui.heartbeat" })).await;
    let reply = a.expect("ok");
    assert_eq!(reply["active"], false);

    // Dropping B hands the role back to A.
    harness.send(&b, json!({ "type": "ui.unregister" })).await;
    b.expect("ok");
    harness.send(&a, json!({ "type": "ui.heartbeat" })).await;
    let reply = a.expect("ok");
    assert_eq!(reply["active"], true);
}

#[tokio::test]
async fn session_events_steer_to_active_provider_only() {
    let mut harness = Harness::new();

    let mut provider = harness.connect().await;
    let mut sub1 = harness.connect().await;
    let mut sub2 = harness.connect().await;
    let mut waiter = harness.connect().await;
    let keyring = harness.connect().await;

    harness
        .send(
            &provider,
            json!({ "type": "ui.register", "name": "shell", "kind": "quickshell" }),
        )
        .await;
    provider.expect("ui.registered");

    harness.send(&sub1, json!({ "type": "subscribe" })).await;
    sub1.expect("subscribed");
    harness.send(&sub2, json!({ "type": "subscribe" })).await;
    sub2.expect("subscribed");

    // The registration's ui.active broadcast is still queued; drain it,
    // then the next `next` parks the waiter.
    harness.send(&waiter, json!({ "type": "next" })).await;
    waiter.expect("ui.active");
    harness.send(&waiter, json!({ "type": "next" })).await;
    waiter.expect_none();

    harness
        .send(
            &keyring,
            json!({
                "type": "keyring_request",
                "cookie": "k1",
                "title": "Unlock Keyring",
                "message": "An application wants access",
            }),
        )
        .await;

    // session.created goes to the provider and the parked waiter; the
    // plain subscribers see nothing.
    let created = provider.expect("session.created");
    assert_eq!(created["id"], "k1");
    provider.expect("session.updated");

    let polled = waiter.expect("session.created");
    assert_eq!(polled["id"], "k1");
    waiter.expect_none();

    sub1.expect_none();
    sub2.expect_none();
}

#[tokio::test]
async fn non_session_events_broadcast_to_subscribers() {
    let mut harness = Harness::new();

    let mut sub1 = harness.connect().await;
    let mut sub2 = harness.connect().await;
    let mut provider = harness.connect().await;

    harness.send(&sub1, json!({ "type": "subscribe" })).await;
    sub1.expect("subscribed");
    harness.send(&sub2, json!({ "type": "subscribe" })).await;
    sub2.expect("subscribed");

    // Registration flips the election and broadcasts ui.active.
    harness
        .send(&provider, json!({ "type": "ui.register", "name": "shell" }))
        .await;
    provider.expect("ui.registered");

    let status = sub1.expect("ui.active");
    assert_eq!(status["active"], true);
    assert_eq!(status["provider"]["name"], "shell");
    sub2.expect("ui.active");

    // The provider is not a subscriber; it only saw its own reply.
    provider.expect_none();
}

#[tokio::test]
async fn authorization_gate_rejects_inactive_provider() {
    let mut harness = Harness::new();

    let mut active = harness.connect().await;
    let mut inactive = harness.connect().await;
    let keyring = harness.connect().await;

    harness
        .send(&active, json!({ "type": "ui.register", "name": "a", "priority": 20 }))
        .await;
    active.expect("ui.registered");
    harness
        .send(&inactive, json!({ "type": "ui.register", "name": "b", "priority": 10 }))
        .await;
    inactive.expect("ui.registered");

    harness
        .send(
            &keyring,
            json!({ "type": "keyring_request", "cookie": "k1", "title": "t", "message": "m" }),
        )
        .await;

    harness
        .send(
            &inactive,
            json!({ "type": "session.respond", "id": "k1", "response": "pw" }),
        )
        .await;
    let reply = inactive.expect("error");
    assert_eq!(reply["message"], "Not active UI provider");

    // Session is still open; the active provider can finish it.
    assert_eq!(harness.agent.core().session_count(), 1);
    harness
        .send(
            &active,
            json!({ "type": "session.respond", "id": "k1", "response": "pw" }),
        )
        .await;
    active.drain();
    assert_eq!(harness.agent.core().session_count(), 0);
}

#[tokio::test]
async fn subscribe_replays_live_sessions() {
    let mut harness = Harness::new();
    let keyring = harness.connect().await;

    harness
        .send(
            &keyring,
            json!({ "type": "keyring_request", "cookie": "k1", "title": "t", "message": "m" }),
        )
        .await;

    let mut late = harness.connect().await;
    harness.send(&late, json!({ "type": "subscribe" })).await;

    let created = late.expect("session.created");
    assert_eq!(created["id"], "k1");
    assert_eq!(created["source"], "keyring");
    late.expect("session.updated");

    let reply = late.expect("subscribed");
    assert_eq!(reply["sessionCount"], 1);
    // Not a registered provider, so no `active` flag.
    assert!(reply.get("active").is_none());
}

#[tokio::test]
async fn ping_reports_capabilities_and_provider() {
    let mut harness = Harness::new();
    let mut client = harness.connect().await;

    harness.send(&client, json!({ "type": "ping" })).await;
    let pong = client.expect("pong");
    assert_eq!(pong["version"], "2.0");
    assert_eq!(pong["capabilities"], json!(["polkit", "keyring", "pinentry"]));
    assert!(pong.get("provider").is_none());

    let mut provider = harness.connect().await;
    harness
        .send(&provider, json!({ "type": "ui.register", "name": "shell" }))
        .await;
    provider.expect("ui.registered");

    harness.send(&client, json!({ "type": "ping" })).await;
    let pong = client.expect("pong");
    assert_eq!(pong["provider"]["name"], "shell");
}

#[tokio::test]
async fn unknown_type_and_unknown_session_errors() {
    let mut harness = Harness::new();
    let mut client = harness.connect().await;

    harness.send(&client, json!({ "type": "frobnicate" })).await;
    let reply = client.expect("error");
    assert_eq!(reply["message"], "Unknown type");

    harness
        .send(&client, json!({ "type": "session.respond", "id": "ghost", "response": "x" }))
        .await;
    let reply = client.expect("error");
    assert_eq!(reply["message"], "Unknown session");

    harness
        .send(&client, json!({ "type": "session.cancel", "id": "ghost" }))
        .await;
    let reply = client.expect("error");
    assert_eq!(reply["message"], "Unknown session");
}

#[tokio::test]
async fn heartbeat_from_unregistered_client_fails() {
    let mut harness = Harness::new();
    let mut client = harness.connect().await;

    harness.send(&client, json!({ "type": "ui.heartbeat" })).await;
    let reply = client.expect("error");
    assert_eq!(reply["message"], "Unknown provider");
}

#[tokio::test]
async fn next_returns_queued_event_immediately() {
    let mut harness = Harness::new();
    let keyring = harness.connect().await;
    let mut poller = harness.connect().await;

    harness
        .send(
            &keyring,
            json!({ "type": "keyring_request", "cookie": "k1", "title": "t", "message": "m" }),
        )
        .await;

    // Two events are queued: created and updated.
    harness.send(&poller, json!({ "type": "next" })).await;
    assert_eq!(poller.expect("session.created")["id"], "k1");
    harness.send(&poller, json!({ "type": "next" })).await;
    poller.expect("session.updated");
}
