//! Server
//!
//! Owns the hub set, request router and cluster bridge, accepts WebSocket
//! connections, and exposes the interface domain code uses to publish
//! events and revoke sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterBridge, ClusterError, ClusterHandler, PubSub};
use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionSettings, Pump, WebConn};
use crate::hub::{HubSet, HubSettings};
use crate::metrics::Metrics;
use crate::protocol::Event;
use crate::router::{PingHandler, RequestHandler, RequestRouter, TypingHandler};
use crate::session::{SessionError, SessionStore};
use crate::transport::{accept_with_path, configure_stream};

/// Deadline for the WebSocket upgrade handshake
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server settings derived from configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Identity stamped on cluster messages
    pub server_id: String,
    pub bind: SocketAddr,
    pub ws_path: String,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub hubs: HubSettings,
    pub connection: ConnectionSettings,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        let server_id = match config.cluster() {
            Some(cluster) => cluster.get_server_id(),
            None => crate::config::ClusterConfig::default().get_server_id(),
        };

        Self {
            server_id,
            bind: config.server.bind,
            ws_path: config.server.ws_path.clone(),
            max_connections: config.server.max_connections,
            max_message_size: config.connection.max_message_size,
            hubs: HubSettings::from_config(&config.server),
            connection: ConnectionSettings::from_config(&config.connection, &config.session),
        }
    }
}

/// Releases a live-connection slot when dropped
struct Slot {
    live: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The real-time event server
pub struct Server {
    settings: ServerSettings,
    connection_settings: Arc<ConnectionSettings>,
    hubs: Arc<HubSet>,
    router: Arc<RequestRouter>,
    bridge: Arc<ClusterBridge>,
    sessions: Arc<dyn SessionStore>,
    metrics: Option<Arc<Metrics>>,
    next_conn_id: AtomicU64,
    live: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Server {
    /// Start the hubs and wire up the built-in request handlers.
    ///
    /// Without a pub/sub backend the server runs standalone.
    pub fn new(
        settings: ServerSettings,
        sessions: Arc<dyn SessionStore>,
        pubsub: Option<Arc<dyn PubSub>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let hubs = Arc::new(HubSet::start(settings.hubs.clone(), metrics.clone()));
        let router = Arc::new(RequestRouter::new(hubs.clone(), metrics.clone()));
        let bridge = Arc::new(ClusterBridge::new(
            settings.server_id.clone(),
            hubs.clone(),
            pubsub,
            metrics.clone(),
        ));

        router.register("ping", Arc::new(PingHandler));
        router.register("user_typing", Arc::new(TypingHandler::new(bridge.clone())));

        info!(
            "Server '{}' started {} hubs",
            settings.server_id,
            hubs.len()
        );

        Self {
            connection_settings: Arc::new(settings.connection.clone()),
            settings,
            hubs,
            router,
            bridge,
            sessions,
            metrics,
            next_conn_id: AtomicU64::new(1),
            live: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.settings.server_id
    }

    pub fn hubs(&self) -> &Arc<HubSet> {
        &self.hubs
    }

    pub fn bridge(&self) -> &Arc<ClusterBridge> {
        &self.bridge
    }

    /// Register a handler for a client request action
    pub fn register_request_handler(
        &self,
        action: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.router.register(action, handler);
    }

    /// Register a handler for a cluster event kind; call before [`start`](Self::start)
    pub fn register_cluster_handler(
        &self,
        event_kind: impl Into<String>,
        handler: Arc<dyn ClusterHandler>,
    ) {
        self.bridge.register_cluster_handler(event_kind, handler);
    }

    /// Deliver an event to eligible connections on every server
    pub async fn publish(&self, event: Event) {
        self.bridge.publish(Arc::new(event)).await;
    }

    /// Force every connection of a user, on every server, to revalidate its session
    pub async fn invalidate_user_connections(&self, user_id: &str) {
        self.bridge.invalidate_user_connections(user_id).await;
    }

    /// Revoke a user's sessions in the store and everywhere they are cached
    pub async fn revoke_user_sessions(&self, user_id: &str) -> Result<(), SessionError> {
        self.sessions.invalidate_for_user(user_id).await?;
        self.invalidate_user_connections(user_id).await;
        Ok(())
    }

    /// Subscribe to cluster topics
    pub async fn start(&self) -> Result<(), ClusterError> {
        self.bridge.start().await
    }

    /// Bind the configured WebSocket address
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(self.settings.bind).await?;
        info!(
            "WebSocket listening on {} (path: {})",
            listener.local_addr()?,
            self.settings.ws_path
        );
        Ok(listener)
    }

    /// Accept connections until shutdown
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("New WebSocket connection from {}", addr);
                    if let Err(e) = configure_stream(&stream) {
                        debug!("Failed to configure socket from {}: {}", addr, e);
                    }
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_socket(stream).await });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Stopped accepting connections");
        Ok(())
    }

    /// Upgrade one socket and pump it until it closes
    pub async fn serve_socket<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upgrade = match tokio::time::timeout(
            UPGRADE_TIMEOUT,
            accept_with_path(stream, &self.settings.ws_path, self.settings.max_message_size),
        )
        .await
        {
            Ok(Ok(upgrade)) => upgrade,
            Ok(Err(e)) => {
                debug!("WebSocket upgrade failed: {}", e);
                return;
            }
            Err(_) => {
                debug!("WebSocket upgrade timed out");
                return;
            }
        };
        let mut socket = upgrade.socket;

        let Some(_slot) = self.claim_slot() else {
            warn!(
                "Refusing connection: {} live connections",
                self.settings.max_connections
            );
            if let Some(ref m) = self.metrics {
                m.connection_rejected();
            }
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "server at connection limit".into(),
            };
            let _ = socket.close(Some(frame)).await;
            return;
        };

        let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let (conn, queue) = WebConn::new(id, self.connection_settings.clone(), self.sessions.clone());

        if let Some(token) = upgrade.token {
            match conn.lookup_session(&token).await {
                Ok(session) => conn.install_session(&token, session),
                Err(e) => debug!("{} presented an unusable token: {}", id, e),
            }
        }

        if let Err(e) = self.hubs.register(conn.clone()).await {
            debug!("Dropping {}: {}", id, e);
            let _ = socket.close(None).await;
            return;
        }
        if let Some(ref m) = self.metrics {
            m.connection_opened();
        }
        debug!("{} open for '{}'", id, conn.user_id());

        Pump::new(conn, queue, self.hubs.clone(), self.router.clone())
            .run(socket)
            .await;

        if let Some(ref m) = self.metrics {
            m.connection_closed();
        }
        debug!("{} closed", id);
    }

    fn claim_slot(&self) -> Option<Slot> {
        let previous = self.live.fetch_add(1, Ordering::AcqRel);
        let slot = Slot {
            live: self.live.clone(),
        };
        if previous >= self.settings.max_connections {
            return None;
        }
        Some(slot)
    }

    /// Number of sockets currently being served
    pub fn connection_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Stop accepting, close every connection, then leave the cluster
    pub async fn shutdown(&self) {
        info!("Shutting down server '{}'", self.settings.server_id);
        self.shutdown.cancel();
        self.hubs.stop().await;
        self.bridge.shutdown().await;
        info!("Server '{}' stopped", self.settings.server_id);
    }
}
