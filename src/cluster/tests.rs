//! Cluster bridge tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::connection::test_support::authed_conn;
use crate::connection::{ConnectionSettings, OutboundMessage};
use crate::hub::HubSettings;
use crate::protocol::Broadcast;
use crate::session::{MemorySessionStore, SessionStore};

fn hubs() -> Arc<HubSet> {
    Arc::new(HubSet::start(HubSettings::with_count(2), None))
}

fn bridge(server_id: &str, hubs: Arc<HubSet>, bus: &MemoryPubSub) -> ClusterBridge {
    let pubsub: Arc<dyn PubSub> = Arc::new(bus.clone());
    ClusterBridge::new(server_id, hubs, Some(pubsub), None)
}

fn delivery(kind: &str, origin: &str, payload: Vec<u8>) -> Delivery {
    Delivery {
        topic: kind.to_string(),
        payload: Bytes::from(ClusterMessage::new(kind, origin, payload).encode().unwrap()),
    }
}

async fn next_event(rx: &mut mpsc::Receiver<OutboundMessage>) -> Option<Arc<Event>> {
    loop {
        match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(OutboundMessage::Event(event))) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

struct Counting(Arc<AtomicUsize>);

#[async_trait]
impl ClusterHandler for Counting {
    async fn handle(&self, _message: &ClusterMessage) -> Result<(), ClusterError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Unreachable;

#[async_trait]
impl PubSub for Unreachable {
    async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), PubSubError> {
        Err(PubSubError::Timeout)
    }

    async fn subscribe(&self, _topics: &[String]) -> Result<mpsc::Receiver<Delivery>, PubSubError> {
        Err(PubSubError::Closed)
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn test_own_messages_are_discarded() {
    let hubs = hubs();
    let bridge = bridge("app-1", hubs.clone(), &MemoryPubSub::new());
    let event = serde_json::to_vec(&Event::new("posted", Broadcast::All)).unwrap();

    assert_eq!(
        bridge.dispatch(&delivery(kinds::PUBLISH, "app-1", event.clone())).await,
        Dispatch::SelfEcho
    );
    assert_eq!(
        bridge.dispatch(&delivery(kinds::PUBLISH, "app-2", event)).await,
        Dispatch::Applied
    );
    hubs.stop().await;
}

#[tokio::test]
async fn test_dispatch_rejects_garbage_and_unknown_kinds() {
    let hubs = hubs();
    let bridge = bridge("app-1", hubs.clone(), &MemoryPubSub::new());

    let garbage = Delivery {
        topic: kinds::PUBLISH.to_string(),
        payload: Bytes::from_static(b"\xff\xff\xff"),
    };
    assert_eq!(bridge.dispatch(&garbage).await, Dispatch::Failed);

    // well-framed, but the payload is not an event
    assert_eq!(
        bridge
            .dispatch(&delivery(kinds::PUBLISH, "app-2", b"not json".to_vec()))
            .await,
        Dispatch::Failed
    );

    assert_eq!(
        bridge.dispatch(&delivery("custom", "app-2", vec![])).await,
        Dispatch::Unhandled
    );

    let seen = Arc::new(AtomicUsize::new(0));
    bridge.register_cluster_handler("custom", Arc::new(Counting(seen.clone())));
    assert_eq!(
        bridge.dispatch(&delivery("custom", "app-2", vec![])).await,
        Dispatch::Applied
    );
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    hubs.stop().await;
}

#[tokio::test]
async fn test_publish_reaches_peer_once_and_self_once() {
    let bus = MemoryPubSub::new();
    let store = Arc::new(MemorySessionStore::new());

    let hubs_a = hubs();
    let hubs_b = hubs();
    let a = bridge("app-1", hubs_a.clone(), &bus);
    let b = bridge("app-2", hubs_b.clone(), &bus);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let (local, mut local_rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());
    let (remote, mut remote_rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());
    hubs_a.register(local).await.unwrap();
    hubs_b.register(remote).await.unwrap();
    assert_eq!(next_event(&mut local_rx).await.unwrap().kind(), "hello");
    assert_eq!(next_event(&mut remote_rx).await.unwrap().kind(), "hello");

    a.publish(Arc::new(
        Event::new("posted", Broadcast::User("u1".to_string())).with("post_id", "p1"),
    ))
    .await;

    let remote_event = next_event(&mut remote_rx).await.expect("peer delivery");
    assert_eq!(remote_event.kind(), "posted");
    assert_eq!(remote_event.data()["post_id"], "p1");

    let local_event = next_event(&mut local_rx).await.expect("local delivery");
    assert_eq!(local_event.kind(), "posted");

    // the echo of our own publish must not produce a second copy
    tokio::time::sleep(Duration::from_millis(50)).await;
    hubs_a.connection_count().await;
    assert!(local_rx.try_recv().is_err());

    a.shutdown().await;
    b.shutdown().await;
    hubs_a.stop().await;
    hubs_b.stop().await;
}

#[tokio::test]
async fn test_invalidation_propagates_to_peer() {
    let bus = MemoryPubSub::new();
    let store = Arc::new(MemorySessionStore::new());

    let hubs_a = hubs();
    let hubs_b = hubs();
    let a = bridge("app-1", hubs_a.clone(), &bus);
    let b = bridge("app-2", hubs_b.clone(), &bus);
    b.start().await.unwrap();

    let (remote, _remote_rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());
    hubs_b.register(remote.clone()).await.unwrap();
    assert!(remote.is_authenticated().await);

    store.invalidate_for_user("u1").await.unwrap();
    a.invalidate_user_connections("u1").await;

    let mut revoked = false;
    for _ in 0..50 {
        if !remote.is_authenticated().await {
            revoked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(revoked);
    assert!(remote.session_token().is_none());

    b.shutdown().await;
    hubs_a.stop().await;
    hubs_b.stop().await;
}

#[tokio::test]
async fn test_publish_failure_is_not_fatal() {
    let hubs = hubs();
    let store = Arc::new(MemorySessionStore::new());
    let pubsub: Arc<dyn PubSub> = Arc::new(Unreachable);
    let bridge = ClusterBridge::new("app-1", hubs.clone(), Some(pubsub), None);

    assert!(matches!(bridge.start().await, Err(ClusterError::PubSub(_))));

    let (conn, mut rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());
    hubs.register(conn).await.unwrap();
    bridge
        .publish(Arc::new(Event::new("posted", Broadcast::All)))
        .await;

    assert_eq!(next_event(&mut rx).await.unwrap().kind(), "hello");
    assert_eq!(next_event(&mut rx).await.unwrap().kind(), "posted");
    hubs.stop().await;
}

#[tokio::test]
async fn test_standalone_bridge() {
    let hubs = hubs();
    let bridge = ClusterBridge::new("solo", hubs.clone(), None, None);
    assert!(!bridge.is_clustered());
    assert!(bridge.start().await.is_ok());
    bridge.publish_cluster("custom", vec![1, 2, 3]).await;
    bridge.shutdown().await;
    hubs.stop().await;
}
