//! Request router tests

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use super::*;
use crate::cluster::ClusterBridge;
use crate::connection::test_support::{anonymous_conn, authed_conn};
use crate::connection::{ConnectionSettings, OutboundEncoder};
use crate::hub::HubSettings;
use crate::protocol::{Broadcast, Event};
use crate::session::{MemorySessionStore, Session, SessionStore};

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        data: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        Ok(json!({"user_id": ctx.session.user_id, "echo": data}))
    }
}

struct FailingHandler;

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(
        &self,
        _ctx: &RequestContext,
        _data: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        Err(ClientError::internal("db at 10.1.2.3 refused connection"))
    }
}

fn setup() -> (Arc<MemorySessionStore>, Arc<HubSet>, RequestRouter) {
    let store = Arc::new(MemorySessionStore::new());
    let hubs = Arc::new(HubSet::start(HubSettings::with_count(2), None));
    let router = RequestRouter::new(hubs.clone(), None);
    router.register("echo", Arc::new(EchoHandler));
    router.register("fail", Arc::new(FailingHandler));
    router.register("ping", Arc::new(PingHandler));
    (store, hubs, router)
}

fn request(raw: Value) -> Request {
    serde_json::from_value(raw).unwrap()
}

/// Next reply as wire JSON, skipping events
fn reply(rx: &mut mpsc::Receiver<OutboundMessage>) -> Value {
    let mut encoder = OutboundEncoder::new();
    loop {
        let message = rx.try_recv().expect("no reply queued");
        if matches!(message, OutboundMessage::Event(_)) {
            continue;
        }
        return serde_json::from_str(&encoder.encode(&message).unwrap()).unwrap();
    }
}

#[tokio::test]
async fn test_handler_reply() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());

    router
        .serve(&conn, request(json!({"action": "echo", "seq": 4, "data": {"x": 1}})))
        .await;

    assert_eq!(
        reply(&mut rx),
        json!({"status": "OK", "seq": 4, "data": {"user_id": "u1", "echo": {"x": 1}}})
    );
    hubs.stop().await;
}

#[tokio::test]
async fn test_rejections_before_dispatch() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());

    router
        .serve(&conn, request(json!({"action": "echo", "seq": 0})))
        .await;
    assert_eq!(
        reply(&mut rx),
        json!({"seq": 0, "error": {"kind": "bad_seq", "message": "seq must be a positive integer"}})
    );

    router
        .serve(&conn, request(json!({"action": "", "seq": 2})))
        .await;
    assert_eq!(reply(&mut rx)["error"]["kind"], "bad_action");

    router
        .serve(&conn, request(json!({"action": "nope", "seq": 3})))
        .await;
    let unknown = reply(&mut rx);
    assert_eq!(unknown["seq"], 3);
    assert_eq!(unknown["error"]["kind"], "bad_action");
    hubs.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_rejected() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = anonymous_conn(&store);

    router
        .serve(&conn, request(json!({"action": "echo", "seq": 1})))
        .await;
    let rejected = reply(&mut rx);
    assert_eq!(rejected["seq"], 1);
    assert_eq!(rejected["error"]["kind"], "not_authenticated");
    hubs.stop().await;
}

#[tokio::test]
async fn test_revoked_session_rejected() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());

    store.invalidate_for_user("u1").await.unwrap();
    conn.invalidate_cache();
    router
        .serve(&conn, request(json!({"action": "echo", "seq": 1})))
        .await;
    assert_eq!(reply(&mut rx)["error"]["kind"], "not_authenticated");
    assert!(conn.session_token().is_none());
    hubs.stop().await;
}

#[tokio::test]
async fn test_internal_detail_never_reaches_client() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());

    router
        .serve(&conn, request(json!({"action": "fail", "seq": 9})))
        .await;
    let failed = reply(&mut rx);
    assert_eq!(
        failed,
        json!({"seq": 9, "error": {"kind": "internal", "message": "internal server error"}})
    );
    assert!(!failed.to_string().contains("10.1.2.3"));
    hubs.stop().await;
}

#[tokio::test]
async fn test_ping() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = authed_conn(&store, "u1", &[], ConnectionSettings::default());

    router
        .serve(&conn, request(json!({"action": "ping", "seq": 1})))
        .await;
    let pong = reply(&mut rx);
    assert_eq!(pong["status"], "OK");
    assert_eq!(pong["data"]["text"], "pong");
    assert_eq!(pong["data"]["version"], env!("CARGO_PKG_VERSION"));
    assert!(pong["data"]["server_time"].as_u64().unwrap() > 0);
    hubs.stop().await;
}

#[tokio::test]
async fn test_authentication_challenge_moves_connection() {
    let (store, hubs, router) = setup();
    store.insert(Session::new("tok-late", "late-user"));

    let (conn, mut rx) = anonymous_conn(&store);
    hubs.register(conn.clone()).await.unwrap();

    router
        .serve(
            &conn,
            request(json!({"action": "authentication_challenge", "seq": 1, "data": {"token": "tok-late"}})),
        )
        .await;
    assert_eq!(&*conn.user_id(), "late-user");
    assert_eq!(hubs.connection_count().await, 1);

    // reachable as that user now, greeted by the re-registration
    hubs.broadcast(Arc::new(Event::new(
        "posted",
        Broadcast::User("late-user".to_string()),
    )))
    .await
    .unwrap();
    hubs.connection_count().await;

    let mut kinds = Vec::new();
    let mut responses = Vec::new();
    while let Ok(message) = rx.try_recv() {
        match message {
            OutboundMessage::Event(event) => kinds.push(event.kind().to_string()),
            OutboundMessage::Response(response) => responses.push(response.seq),
            OutboundMessage::Error(err) => panic!("unexpected error {:?}", err),
        }
    }
    assert_eq!(responses, vec![1]);
    assert_eq!(kinds, vec!["hello", "posted"]);
    hubs.stop().await;
}

#[tokio::test]
async fn test_reauthentication_greets_once_per_move() {
    let (store, hubs, router) = setup();
    store.insert(Session::new("tok-first", "first-user"));
    store.insert(Session::new("tok-second", "second-user"));

    let (conn, mut rx) = anonymous_conn(&store);
    hubs.register(conn.clone()).await.unwrap();

    for (seq, token) in [(1, "tok-first"), (2, "tok-second")] {
        router
            .serve(
                &conn,
                request(json!({"action": "authentication_challenge", "seq": seq, "data": {"token": token}})),
            )
            .await;
    }
    assert_eq!(&*conn.user_id(), "second-user");
    assert_eq!(hubs.connection_count().await, 1);

    let mut hellos = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let OutboundMessage::Event(event) = message {
            assert_eq!(event.kind(), "hello");
            hellos.push(event.target_user().map(str::to_string));
        }
    }
    assert_eq!(
        hellos,
        vec![
            Some("first-user".to_string()),
            Some("second-user".to_string())
        ]
    );
    hubs.stop().await;
}

#[tokio::test]
async fn test_authentication_challenge_bad_token() {
    let (store, hubs, router) = setup();
    let (conn, mut rx) = anonymous_conn(&store);

    router
        .serve(
            &conn,
            request(json!({"action": "authentication_challenge", "seq": 2, "data": {"token": "nope"}})),
        )
        .await;
    assert_eq!(reply(&mut rx)["error"]["kind"], "not_authenticated");

    router
        .serve(
            &conn,
            request(json!({"action": "authentication_challenge", "seq": 3})),
        )
        .await;
    assert_eq!(reply(&mut rx)["error"]["kind"], "bad_request");
    assert!(!conn.is_authenticated().await);
    hubs.stop().await;
}

#[tokio::test]
async fn test_user_typing() {
    let (store, hubs, router) = setup();
    let bridge = Arc::new(ClusterBridge::new("local", hubs.clone(), None, None));
    router.register("user_typing", Arc::new(TypingHandler::new(bridge)));

    let (typist, mut typist_rx) = authed_conn(&store, "u1", &["t1"], ConnectionSettings::default());
    let (teammate, mut teammate_rx) =
        authed_conn(&store, "u2", &["t1"], ConnectionSettings::default());
    let (outsider, mut outsider_rx) =
        authed_conn(&store, "u3", &["t9"], ConnectionSettings::default());
    for conn in [typist.clone(), teammate, outsider] {
        hubs.register(conn).await.unwrap();
    }
    hubs.connection_count().await;
    typist_rx.try_recv().unwrap();
    teammate_rx.try_recv().unwrap();
    outsider_rx.try_recv().unwrap();

    router
        .serve(
            &typist,
            request(json!({"action": "user_typing", "seq": 5, "data": {"team_id": "t1"}})),
        )
        .await;
    hubs.connection_count().await;

    match teammate_rx.try_recv() {
        Ok(OutboundMessage::Event(event)) => {
            assert_eq!(event.kind(), "typing");
            assert_eq!(event.data()["user_id"], "u1");
            assert_eq!(event.data()["parent_id"], "");
        }
        other => panic!("expected typing event, got {:?}", other),
    }
    assert!(outsider_rx.try_recv().is_err());

    router
        .serve(
            &typist,
            request(json!({"action": "user_typing", "seq": 6, "data": {"team_id": "t9"}})),
        )
        .await;
    let mut forbidden = None;
    while let Ok(message) = typist_rx.try_recv() {
        if let OutboundMessage::Error(err) = message {
            forbidden = Some(err);
        }
    }
    assert_eq!(forbidden.map(|e| e.seq), Some(6));
    hubs.stop().await;
}
