//! Cluster Module
//!
//! Keeps hubs on different server processes in step. Locally published
//! events are fanned out to the local [`HubSet`] and published on a
//! cluster topic named after the event kind; peers re-run the fan-out on
//! receipt. Every message carries its origin server id so a server never
//! re-applies its own messages.
//!
//! # Usage
//!
//! ```toml
//! # pulsehub.toml
//! [[cluster]]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["app1:7946", "app2:7946"]
//! ```

mod gossip;
mod peer;
mod protocol;
mod pubsub;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::{HubError, HubSet};
use crate::metrics::Metrics;
use crate::protocol::Event;

pub use gossip::GossipPubSub;
pub use peer::{ClusterPeer, InboundCallback, PeerStatus};
pub use protocol::{ClusterMessage, PeerFrame, CLUSTER_PROTOCOL_VERSION};
pub use pubsub::{Delivery, MemoryPubSub, PubSub, PubSubError};

// Re-export cluster config
pub use crate::config::ClusterConfig;

#[cfg(test)]
mod tests;

/// Cluster event kinds handled by every server
pub mod kinds {
    /// Payload is a JSON [`Event`](crate::protocol::Event) to fan out locally
    pub const PUBLISH: &str = "publish";
    /// Payload is `{"user_id": ...}`; drops cached sessions for that user
    pub const INVALIDATE_USER_CONNECTIONS: &str = "invalidate_user_connections";
}

/// Cluster error types
#[derive(Debug)]
pub enum ClusterError {
    /// Pub/sub backend failure
    PubSub(PubSubError),
    /// Cluster message framing could not be decoded
    Message(bincode::error::DecodeError),
    /// Cluster message framing could not be encoded
    Encode(bincode::error::EncodeError),
    /// Handler payload was not valid JSON for its kind
    Payload(serde_json::Error),
    /// Local hubs rejected the operation
    Hub(HubError),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::PubSub(e) => write!(f, "Pub/sub error: {}", e),
            ClusterError::Message(e) => write!(f, "Message decode error: {}", e),
            ClusterError::Encode(e) => write!(f, "Message encode error: {}", e),
            ClusterError::Payload(e) => write!(f, "Payload error: {}", e),
            ClusterError::Hub(e) => write!(f, "Hub error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<PubSubError> for ClusterError {
    fn from(e: PubSubError) -> Self {
        ClusterError::PubSub(e)
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClusterError::Message(e)
    }
}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClusterError::Encode(e)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Payload(e)
    }
}

impl From<HubError> for ClusterError {
    fn from(e: HubError) -> Self {
        ClusterError::Hub(e)
    }
}

/// Handler for cluster messages of one event kind
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    async fn handle(&self, message: &ClusterMessage) -> Result<(), ClusterError>;
}

/// Re-runs the local fan-out for events published by peers
struct FanoutHandler {
    hubs: Arc<HubSet>,
}

#[async_trait]
impl ClusterHandler for FanoutHandler {
    async fn handle(&self, message: &ClusterMessage) -> Result<(), ClusterError> {
        let event: Event = serde_json::from_slice(&message.payload)?;
        self.hubs.broadcast(Arc::new(event)).await?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct InvalidateUser {
    user_id: String,
}

/// Drops cached sessions of a user revoked on a peer
struct InvalidateUserHandler {
    hubs: Arc<HubSet>,
}

#[async_trait]
impl ClusterHandler for InvalidateUserHandler {
    async fn handle(&self, message: &ClusterMessage) -> Result<(), ClusterError> {
        let payload: InvalidateUser = serde_json::from_slice(&message.payload)?;
        self.hubs.invalidate_user(&payload.user_id).await?;
        Ok(())
    }
}

/// What the subscriber did with one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Applied,
    SelfEcho,
    Unhandled,
    Failed,
}

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn ClusterHandler>>>>;

/// Inbound side of the bridge, shared with the subscriber task
#[derive(Clone)]
struct Inbound {
    server_id: Arc<str>,
    handlers: HandlerMap,
    metrics: Option<Arc<Metrics>>,
}

impl Inbound {
    async fn dispatch(&self, delivery: &Delivery) -> Dispatch {
        let message = match ClusterMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Cluster: undecodable message on '{}': {}", delivery.topic, e);
                return Dispatch::Failed;
            }
        };

        if message.origin_server_id == *self.server_id {
            return Dispatch::SelfEcho;
        }

        let handler = self.handlers.read().get(&message.event_kind).cloned();
        let Some(handler) = handler else {
            debug!("Cluster: no handler for '{}'", message.event_kind);
            return Dispatch::Unhandled;
        };

        if let Some(ref m) = self.metrics {
            m.cluster_message_received();
        }
        match handler.handle(&message).await {
            Ok(()) => Dispatch::Applied,
            Err(e) => {
                warn!(
                    "Cluster: '{}' from {} failed: {}",
                    message.event_kind, message.origin_server_id, e
                );
                Dispatch::Failed
            }
        }
    }
}

/// Cluster-wide publish and subscribe for one server
pub struct ClusterBridge {
    server_id: Arc<str>,
    hubs: Arc<HubSet>,
    pubsub: Option<Arc<dyn PubSub>>,
    inbound: Inbound,
    metrics: Option<Arc<Metrics>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterBridge {
    /// Create a bridge; without a pub/sub backend it only fans out locally
    pub fn new(
        server_id: impl Into<String>,
        hubs: Arc<HubSet>,
        pubsub: Option<Arc<dyn PubSub>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let server_id: Arc<str> = Arc::from(server_id.into());

        let mut handlers: HashMap<String, Arc<dyn ClusterHandler>> = HashMap::new();
        handlers.insert(
            kinds::PUBLISH.to_string(),
            Arc::new(FanoutHandler { hubs: hubs.clone() }),
        );
        handlers.insert(
            kinds::INVALIDATE_USER_CONNECTIONS.to_string(),
            Arc::new(InvalidateUserHandler { hubs: hubs.clone() }),
        );

        Self {
            inbound: Inbound {
                server_id: server_id.clone(),
                handlers: Arc::new(RwLock::new(handlers)),
                metrics: metrics.clone(),
            },
            server_id,
            hubs,
            pubsub,
            metrics,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_clustered(&self) -> bool {
        self.pubsub.is_some()
    }

    /// Register a handler for an event kind, replacing any previous one.
    ///
    /// Only kinds registered before [`start`](Self::start) are subscribed.
    pub fn register_cluster_handler(
        &self,
        event_kind: impl Into<String>,
        handler: Arc<dyn ClusterHandler>,
    ) {
        let event_kind = event_kind.into();
        if self.task.lock().is_some() {
            warn!(
                "Cluster handler for '{}' registered after subscribe; its topic is not subscribed",
                event_kind
            );
        }
        self.inbound.handlers.write().insert(event_kind, handler);
    }

    /// Fan an event out locally and to every peer
    pub async fn publish(&self, event: Arc<Event>) {
        if let Err(e) = self.hubs.broadcast(event.clone()).await {
            warn!("Local fan-out of '{}' failed: {}", event.kind(), e);
        }
        if let Some(ref m) = self.metrics {
            m.event_published();
        }

        if self.pubsub.is_none() {
            return;
        }
        match serde_json::to_vec(&*event) {
            Ok(payload) => self.publish_cluster(kinds::PUBLISH, payload).await,
            Err(e) => error!("Failed to serialize '{}' for the cluster: {}", event.kind(), e),
        }
    }

    /// Drop cached sessions of a user on this server and every peer
    pub async fn invalidate_user_connections(&self, user_id: &str) {
        if let Err(e) = self.hubs.invalidate_user(user_id).await {
            warn!("Local invalidation of '{}' failed: {}", user_id, e);
        }

        if self.pubsub.is_none() {
            return;
        }
        let payload = InvalidateUser {
            user_id: user_id.to_string(),
        };
        match serde_json::to_vec(&payload) {
            Ok(payload) => {
                self.publish_cluster(kinds::INVALIDATE_USER_CONNECTIONS, payload)
                    .await
            }
            Err(e) => error!("Failed to serialize invalidation for '{}': {}", user_id, e),
        }
    }

    /// Publish a message of `event_kind` to peers only.
    ///
    /// Failures are logged and counted; the caller carries on.
    pub async fn publish_cluster(&self, event_kind: &str, payload: Vec<u8>) {
        let Some(ref pubsub) = self.pubsub else {
            return;
        };

        let message = ClusterMessage::new(event_kind, &*self.server_id, payload);
        let result = match message.encode() {
            Ok(bytes) => pubsub
                .publish(event_kind, Bytes::from(bytes))
                .await
                .map_err(ClusterError::from),
            Err(e) => Err(ClusterError::from(e)),
        };

        match result {
            Ok(()) => {
                if let Some(ref m) = self.metrics {
                    m.cluster_message_sent();
                }
            }
            Err(e) => {
                warn!("Cluster publish of '{}' failed: {}", event_kind, e);
                if let Some(ref m) = self.metrics {
                    m.cluster_publish_error();
                }
            }
        }
    }

    /// Subscribe to every registered kind and start the subscriber task
    pub async fn start(&self) -> Result<(), ClusterError> {
        let Some(ref pubsub) = self.pubsub else {
            return Ok(());
        };

        let mut topics: Vec<String> = self.inbound.handlers.read().keys().cloned().collect();
        topics.sort();
        let deliveries = pubsub.subscribe(&topics).await?;
        info!(
            "Cluster bridge '{}' subscribed to {:?}",
            self.server_id, topics
        );

        let task = tokio::spawn(subscriber_loop(
            deliveries,
            self.inbound.clone(),
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stop the subscriber task and release the backend
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Some(ref pubsub) = self.pubsub {
            pubsub.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn dispatch(&self, delivery: &Delivery) -> Dispatch {
        self.inbound.dispatch(delivery).await
    }
}

async fn subscriber_loop(
    mut deliveries: mpsc::Receiver<Delivery>,
    inbound: Inbound,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            delivery = deliveries.recv() => delivery,
        };

        let Some(delivery) = delivery else {
            warn!("Cluster subscription for '{}' ended", inbound.server_id);
            break;
        };
        inbound.dispatch(&delivery).await;
    }
    debug!("Cluster subscriber for '{}' stopped", inbound.server_id);
}
