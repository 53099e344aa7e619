//! Shared helpers for end-to-end tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pulsehub::cluster::PubSub;
use pulsehub::config::Config;
use pulsehub::server::{Server, ServerSettings};
use pulsehub::session::{MemorySessionStore, Session, SessionStore};

pub const WS_PATH: &str = "/api/v4/websocket";

/// A running server and what tests need to reach it
pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub async fn start(
        server_id: &str,
        store: Arc<MemorySessionStore>,
        pubsub: Option<Arc<dyn PubSub>>,
        max_connections: usize,
    ) -> Self {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".parse().unwrap();
        config.server.hubs = Some(2);
        config.server.max_connections = max_connections;
        config.server.shutdown_timeout = Duration::from_secs(5);

        let mut settings = ServerSettings::from_config(&config);
        settings.server_id = server_id.to_string();

        let sessions: Arc<dyn SessionStore> = store;
        let server = Arc::new(Server::new(settings, sessions, pubsub, None));
        server.start().await.unwrap();

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run(listener));

        Self { server, addr }
    }

    /// Wait until every hub has processed what was sent to it so far
    pub async fn settle(&self) {
        self.server.hubs().connection_count().await;
    }
}

/// Session store with alice and carol in team t1, bob in t2
pub fn store() -> Arc<MemorySessionStore> {
    let store = Arc::new(MemorySessionStore::new());
    store.insert(Session::new("tok-alice", "alice").with_teams(["t1"]));
    store.insert(Session::new("tok-bob", "bob").with_teams(["t2"]));
    store.insert(Session::new("tok-carol", "carol").with_teams(["t1"]));
    store
}

/// WebSocket client speaking the JSON protocol
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, token: Option<&str>) -> Self {
        let query = token.map(|t| format!("?token={}", t)).unwrap_or_default();
        let url = format!("ws://{}{}{}", addr, WS_PATH, query);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("Failed to connect");
        Self { ws }
    }

    /// Connect with a token and consume the hello event
    pub async fn connect_as(addr: SocketAddr, token: &str) -> Self {
        let mut client = Self::connect(addr, Some(token)).await;
        let hello = client.recv().await.expect("no hello");
        assert_eq!(hello["event"], "hello");
        assert_eq!(hello["seq"], 0);
        client
    }

    pub async fn request(&mut self, action: &str, seq: i64, data: Value) {
        let text = json!({"action": action, "seq": seq, "data": data}).to_string();
        self.send_text(text).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws
            .send(Message::Text(text))
            .await
            .expect("Failed to send");
    }

    /// Next JSON message, or None on close or after 5s
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_within(Duration::from_secs(5)).await
    }

    pub async fn recv_within(&mut self, limit: Duration) -> Option<Value> {
        loop {
            match timeout(limit, self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(serde_json::from_str(&text).expect("invalid JSON from server"))
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                _ => return None,
            }
        }
    }

    /// Next reply to a request, skipping events
    pub async fn reply(&mut self) -> Value {
        loop {
            let message = self.recv().await.expect("no reply");
            if message.get("event").is_none() {
                return message;
            }
        }
    }

    /// Next event, skipping replies
    pub async fn event(&mut self) -> Option<Value> {
        loop {
            let message = self.recv().await?;
            if message.get("event").is_some() {
                return Some(message);
            }
        }
    }

    /// Read until the server closes, returning its close frame if any
    pub async fn closed(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            match timeout(Duration::from_secs(5), self.ws.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| f.into_owned()),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return None,
                Err(_) => panic!("server did not close the connection"),
            }
        }
    }
}
