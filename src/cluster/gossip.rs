//! Gossip pub/sub backend
//!
//! Servers discover each other through chitchat (UDP gossip). Each one
//! advertises the address of its peer listener and the topics it
//! subscribes to; messages then travel over direct TCP links, and only
//! to servers that advertise the topic.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;

use super::peer::{read_frame, write_frame, ClusterPeer, InboundCallback, PeerStatus, HANDSHAKE_TIMEOUT};
use super::protocol::{PeerFrame, CLUSTER_PROTOCOL_VERSION};
use super::pubsub::{Delivery, PubSub, PubSubError, DELIVERY_QUEUE_SIZE};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";
const KEY_TOPICS: &str = "topics";

const CLUSTER_ID: &str = "pulsehub";

/// Gossip-discovered, TCP-linked pub/sub
pub struct GossipPubSub {
    server_id: String,
    config: ClusterConfig,
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    /// Dropping the handle stops the gossip task
    handle: Mutex<Option<ChitchatHandle>>,
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    local_topics: Arc<RwLock<HashSet<String>>>,
    inbound: InboundCallback,
    deliveries: Mutex<Option<mpsc::Receiver<Delivery>>>,
    shutdown: CancellationToken,
}

impl GossipPubSub {
    /// Join the gossip cluster and start accepting peer links
    pub async fn start(config: ClusterConfig) -> Result<Self, PubSubError> {
        let server_id = config.get_server_id();
        let gossip_advertise_addr = config.get_gossip_advertise_addr();
        let peer_advertise_addr = config.get_peer_advertise_addr();

        info!(
            "Starting cluster node: {} (gossip_advertise={}, peer_advertise={})",
            server_id, gossip_advertise_addr, peer_advertise_addr
        );

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: config.phi_threshold,
            initial_interval: config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId::new(server_id.clone(), 0, gossip_advertise_addr),
            cluster_id: CLUSTER_ID.to_string(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![
            (KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string()),
            (KEY_TOPICS.to_string(), "[]".to_string()),
        ];

        let handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| PubSubError::Gossip(e.to_string()))?;
        let chitchat = handle.chitchat();

        let listener = TcpListener::bind(config.peer_addr).await?;
        info!(
            "Cluster pub/sub listening on gossip={}, peer={}",
            config.gossip_addr, config.peer_addr
        );

        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_SIZE);
        let local_topics = Arc::new(RwLock::new(HashSet::new()));
        let inbound = inbound_callback(tx, local_topics.clone());

        let pubsub = Self {
            server_id,
            config,
            chitchat,
            handle: Mutex::new(Some(handle)),
            peers: Arc::new(DashMap::new()),
            local_topics,
            inbound,
            deliveries: Mutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(peer_listener_loop(
            listener,
            pubsub.inbound.clone(),
            pubsub.server_id.clone(),
            pubsub.shutdown.clone(),
        ));
        tokio::spawn(gossip_watcher_loop(
            pubsub.chitchat.clone(),
            pubsub.peers.clone(),
            pubsub.config.clone(),
            pubsub.inbound.clone(),
            pubsub.server_id.clone(),
            pubsub.shutdown.clone(),
        ));

        Ok(pubsub)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected)
            .count()
    }

    /// Advertise the local topic set through gossip
    async fn advertise_topics(&self, topics: &HashSet<String>) {
        let mut sorted: Vec<&String> = topics.iter().collect();
        sorted.sort();
        let json = serde_json::to_string(&sorted).unwrap_or_else(|_| "[]".to_string());

        debug!("Cluster: advertising topics {}", json);
        self.chitchat
            .lock()
            .await
            .self_node_state()
            .set(KEY_TOPICS.to_string(), json);
    }
}

#[async_trait]
impl PubSub for GossipPubSub {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PubSubError> {
        if self.shutdown.is_cancelled() {
            return Err(PubSubError::Closed);
        }

        for peer in self.peers.iter() {
            let peer = peer.value();
            if peer.status() != PeerStatus::Connected || !peer.wants(topic) {
                continue;
            }
            if let Err(e) = peer.send(topic, payload.clone()) {
                warn!(
                    "Failed to forward '{}' to peer '{}': {}",
                    topic,
                    peer.server_id(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<mpsc::Receiver<Delivery>, PubSubError> {
        let rx = self.deliveries.lock().take().ok_or(PubSubError::Closed)?;

        let topics: HashSet<String> = topics.iter().cloned().collect();
        *self.local_topics.write() = topics.clone();
        self.advertise_topics(&topics).await;

        Ok(rx)
    }

    async fn close(&self) {
        info!("Stopping cluster pub/sub");
        self.shutdown.cancel();

        let peers: Vec<Arc<ClusterPeer>> = self.peers.iter().map(|p| p.value().clone()).collect();
        for peer in peers {
            peer.stop().await;
        }
        self.peers.clear();

        self.handle.lock().take();
    }
}

/// Deliver inbound peer messages for locally subscribed topics
fn inbound_callback(
    tx: mpsc::Sender<Delivery>,
    local_topics: Arc<RwLock<HashSet<String>>>,
) -> InboundCallback {
    Arc::new(move |topic: String, payload: Bytes| {
        if !local_topics.read().contains(&topic) {
            debug!("Cluster inbound: not subscribed to '{}'", topic);
            return;
        }
        if let Err(e) = tx.try_send(Delivery { topic, payload }) {
            warn!("Cluster inbound: dropping delivery: {}", e);
        }
    })
}

/// Accept incoming peer links
async fn peer_listener_loop(
    listener: TcpListener,
    inbound: InboundCallback,
    local_server_id: String,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);
                    let inbound = inbound.clone();
                    let server_id = local_server_id.clone();
                    let shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_incoming_peer(stream, inbound, server_id, shutdown).await {
                            debug!("Incoming peer connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
        }
    }
}

/// Run the accepting side of a peer link
async fn handle_incoming_peer(
    stream: TcpStream,
    inbound: InboundCallback,
    local_server_id: String,
    shutdown: CancellationToken,
) -> Result<(), PubSubError> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(64 * 1024);

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half, &mut read_buf))
        .await
        .map_err(|_| PubSubError::Timeout)??;

    let peer_server_id = match hello {
        Some(PeerFrame::Hello { server_id, version }) => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(PubSubError::Protocol(format!(
                    "Protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )));
            }
            server_id
        }
        Some(other) => {
            return Err(PubSubError::Protocol(format!(
                "Expected Hello, got {}",
                other.type_name()
            )))
        }
        None => return Err(PubSubError::Closed),
    };

    info!("Incoming cluster peer: {}", peer_server_id);

    write_frame(
        &mut write_half,
        &PeerFrame::HelloAck {
            server_id: local_server_id,
            version: CLUSTER_PROTOCOL_VERSION,
        },
    )
    .await?;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write_frame(&mut write_half, &PeerFrame::Goodbye).await;
                return Ok(());
            }
            frame = read_frame(&mut read_half, &mut read_buf) => frame?,
        };

        match frame {
            Some(PeerFrame::Message { topic, body }) => {
                debug!(
                    "Cluster inbound: '{}' from peer {} ({} bytes)",
                    topic,
                    peer_server_id,
                    body.len()
                );
                inbound(topic, Bytes::from(body));
            }
            Some(PeerFrame::Ping) => write_frame(&mut write_half, &PeerFrame::Pong).await?,
            Some(PeerFrame::Goodbye) | None => {
                info!("Cluster peer '{}' disconnected", peer_server_id);
                return Ok(());
            }
            Some(other) => {
                debug!(
                    "Cluster peer '{}': ignoring {} frame",
                    peer_server_id,
                    other.type_name()
                );
            }
        }
    }
}

/// Watch gossip state for peers joining, changing topics, or leaving
async fn gossip_watcher_loop(
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    config: ClusterConfig,
    inbound: InboundCallback,
    local_server_id: String,
    shutdown: CancellationToken,
) {
    let mut known_nodes: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.gossip_interval) => {}
        }

        let cluster_state = chitchat.lock().await.state_snapshot();

        for node_state in &cluster_state.node_states {
            let node_id = node_state.chitchat_id().node_id.clone();
            if node_id == local_server_id {
                continue;
            }

            if !known_nodes.contains(&node_id) {
                let peer_addr = node_state
                    .get(KEY_PEER_ADDR)
                    .and_then(|addr| addr.parse::<SocketAddr>().ok());

                if let Some(peer_addr) = peer_addr {
                    info!(
                        "Discovered new cluster peer: {} at peer={} gossip={}",
                        node_id,
                        peer_addr,
                        node_state.chitchat_id().gossip_advertise_addr
                    );
                    known_nodes.insert(node_id.clone());

                    let peer = ClusterPeer::new(node_id.clone(), peer_addr, local_server_id.clone())
                        .spawn(inbound.clone());
                    peers.insert(node_id.clone(), peer);
                }
            }

            if let Some(peer) = peers.get(&node_id) {
                if let Some(json) = node_state.get(KEY_TOPICS) {
                    match serde_json::from_str::<Vec<String>>(json) {
                        Ok(topics) => peer.update_remote_topics(topics),
                        Err(e) => warn!("Cluster peer '{}' advertised bad topics: {}", node_id, e),
                    }
                }
            }
        }

        let current_nodes: HashSet<&str> = cluster_state
            .node_states
            .iter()
            .map(|ns| ns.chitchat_id().node_id.as_str())
            .collect();

        let departed: Vec<String> = known_nodes
            .iter()
            .filter(|n| !current_nodes.contains(n.as_str()))
            .cloned()
            .collect();

        for node_id in departed {
            info!("Cluster peer '{}' left the cluster", node_id);
            known_nodes.remove(&node_id);
            if let Some((_, peer)) = peers.remove(&node_id) {
                peer.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_inbound_filters_unsubscribed_topics() {
        let (tx, mut rx) = mpsc::channel(4);
        let topics = Arc::new(RwLock::new(HashSet::from(["publish".to_string()])));
        let inbound = inbound_callback(tx, topics);

        inbound("other".to_string(), Bytes::from_static(b"x"));
        inbound("publish".to_string(), Bytes::from_static(b"y"));

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.topic, "publish");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incoming_peer_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let topics = Arc::new(RwLock::new(HashSet::from(["publish".to_string()])));
        let shutdown = CancellationToken::new();
        tokio::spawn(peer_listener_loop(
            listener,
            inbound_callback(tx, topics),
            "app-1".to_string(),
            shutdown.clone(),
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = BytesMut::new();

        write_frame(
            &mut write_half,
            &PeerFrame::Hello {
                server_id: "app-2".to_string(),
                version: CLUSTER_PROTOCOL_VERSION,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            read_frame(&mut read_half, &mut buf).await.unwrap(),
            Some(PeerFrame::HelloAck {
                server_id: "app-1".to_string(),
                version: CLUSTER_PROTOCOL_VERSION
            })
        );

        write_frame(
            &mut write_half,
            &PeerFrame::Message {
                topic: "publish".to_string(),
                body: b"payload".to_vec(),
            },
        )
        .await
        .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&delivery.payload[..], b"payload");

        write_frame(&mut write_half, &PeerFrame::Ping).await.unwrap();
        assert_eq!(
            read_frame(&mut read_half, &mut buf).await.unwrap(),
            Some(PeerFrame::Pong)
        );

        shutdown.cancel();
        assert_eq!(
            read_frame(&mut read_half, &mut buf).await.unwrap(),
            Some(PeerFrame::Goodbye)
        );
    }

    #[tokio::test]
    async fn test_incoming_peer_version_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        tokio::spawn(peer_listener_loop(
            listener,
            inbound_callback(tx, Arc::new(RwLock::new(HashSet::new()))),
            "app-1".to_string(),
            CancellationToken::new(),
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        write_frame(
            &mut write_half,
            &PeerFrame::Hello {
                server_id: "app-2".to_string(),
                version: CLUSTER_PROTOCOL_VERSION + 1,
            },
        )
        .await
        .unwrap();

        // The link is dropped without an ack
        let mut buf = BytesMut::new();
        let reply = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut read_half, &mut buf))
            .await
            .unwrap();
        assert!(matches!(reply, Ok(None) | Err(_)));
    }
}
