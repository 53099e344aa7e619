//! Cluster tests
//!
//! Two servers sharing one in-memory pub/sub backend behave like a single
//! fleet: events and revocations published on either reach connections on
//! both.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use pulsehub::cluster::{MemoryPubSub, PubSub};
use pulsehub::protocol::{Broadcast, Event};

use common::{store, TestClient, TestServer};

async fn fleet() -> (TestServer, TestServer) {
    let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
    let sessions = store();
    let a = TestServer::start("server-a", sessions.clone(), Some(pubsub.clone()), 100).await;
    let b = TestServer::start("server-b", sessions, Some(pubsub), 100).await;
    (a, b)
}

#[tokio::test]
async fn test_publish_reaches_both_servers() {
    let (a, b) = fleet().await;
    let mut alice = TestClient::connect_as(a.addr, "tok-alice").await;
    let mut bob = TestClient::connect_as(b.addr, "tok-bob").await;

    // bob already saw one event, so his sequence runs ahead of alice's
    b.server
        .publish(Event::new("direct", Broadcast::User("bob".to_string())))
        .await;
    let event = bob.event().await.expect("no direct event");
    assert_eq!(event["event"], "direct");
    assert_eq!(event["seq"], 1);

    a.server
        .publish(Event::new("posted", Broadcast::All).with("post_id", "p1"))
        .await;

    let event = alice.event().await.expect("alice missed the event");
    assert_eq!(event["event"], "posted");
    assert_eq!(event["seq"], 1);

    let event = bob.event().await.expect("bob missed the event");
    assert_eq!(event["event"], "posted");
    assert_eq!(event["seq"], 2);
    assert_eq!(event["data"]["post_id"], "p1");

    // delivered once each, no echo back through the backend
    assert!(alice.recv_within(Duration::from_millis(300)).await.is_none());
    assert!(bob.recv_within(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_user_event_follows_user_across_servers() {
    let (a, b) = fleet().await;
    let mut alice_a = TestClient::connect_as(a.addr, "tok-alice").await;
    let mut alice_b = TestClient::connect_as(b.addr, "tok-alice").await;
    let mut bob = TestClient::connect_as(b.addr, "tok-bob").await;

    b.server
        .publish(Event::new("inbox_ping", Broadcast::User("alice".to_string())))
        .await;

    for client in [&mut alice_a, &mut alice_b] {
        let event = client.event().await.expect("no event");
        assert_eq!(event["event"], "inbox_ping");
        assert_eq!(event["seq"], 1);
    }
    assert!(bob.recv_within(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_typing_crosses_servers() {
    let (a, b) = fleet().await;
    let mut alice = TestClient::connect_as(a.addr, "tok-alice").await;
    let mut carol = TestClient::connect_as(b.addr, "tok-carol").await;

    alice
        .request("user_typing", 1, json!({"team_id": "t1"}))
        .await;
    assert_eq!(alice.reply().await["status"], "OK");

    let typing = carol.event().await.expect("carol missed typing");
    assert_eq!(typing["event"], "typing");
    assert_eq!(typing["data"]["user_id"], "alice");
    assert_eq!(typing["data"]["team_id"], "t1");
}

#[tokio::test]
async fn test_revoke_on_one_server_reaches_the_other() {
    let (a, b) = fleet().await;
    let mut alice = TestClient::connect_as(a.addr, "tok-alice").await;

    // prime alice's cached session on server a
    alice.request("ping", 1, json!({})).await;
    assert_eq!(alice.reply().await["status"], "OK");

    b.server.revoke_user_sessions("alice").await.unwrap();

    // invalidation travels through the backend asynchronously
    let mut revoked = false;
    for seq in 2..50 {
        alice.request("ping", seq, json!({})).await;
        let reply = alice.reply().await;
        if reply["error"]["kind"] == "not_authenticated" {
            revoked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(revoked, "server a kept serving a revoked session");
}

#[tokio::test]
async fn test_stopped_peer_does_not_block_publish() {
    let (a, b) = fleet().await;
    let mut alice = TestClient::connect_as(a.addr, "tok-alice").await;

    b.server.shutdown().await;

    a.server.publish(Event::new("posted", Broadcast::All)).await;
    let event = alice.event().await.expect("local delivery stalled");
    assert_eq!(event["event"], "posted");
}
