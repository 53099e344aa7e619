//! Cluster Peer
//!
//! Outbound TCP link to another server in the cluster. Messages are only
//! forwarded for topics the remote server advertises through gossip.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::{
    frame_message, read_frame_length, PeerFrame, CLUSTER_PROTOCOL_VERSION, MAX_FRAME_SIZE,
};
use super::pubsub::PubSubError;

/// Handshake and connect deadline
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const PING_INTERVAL: Duration = Duration::from_secs(15);
const COMMAND_QUEUE_SIZE: usize = 1000;

/// Callback for topic messages received from a peer
pub type InboundCallback = Arc<dyn Fn(String, Bytes) + Send + Sync>;

/// Peer link status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next reconnect attempt
    Backoff,
}

/// Commands sent to the peer connection task
#[derive(Debug)]
enum PeerCommand {
    Message { topic: String, body: Bytes },
    Shutdown,
}

/// A link to another cluster server
pub struct ClusterPeer {
    /// Remote server ID
    server_id: String,
    /// Remote peer address for TCP connection
    peer_addr: SocketAddr,
    status: Arc<RwLock<PeerStatus>>,
    command_tx: Option<mpsc::Sender<PeerCommand>>,
    /// Topics the remote server subscribes to (updated via gossip)
    remote_topics: RwLock<HashSet<String>>,
    local_server_id: String,
}

impl ClusterPeer {
    pub fn new(server_id: String, peer_addr: SocketAddr, local_server_id: String) -> Self {
        Self {
            server_id,
            peer_addr,
            status: Arc::new(RwLock::new(PeerStatus::Disconnected)),
            command_tx: None,
            remote_topics: RwLock::new(HashSet::new()),
            local_server_id,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Replace the remote topic set (called when gossip state changes)
    pub fn update_remote_topics(&self, topics: Vec<String>) {
        let mut remote = self.remote_topics.write();
        remote.clear();
        remote.extend(topics);
    }

    /// Whether the remote server subscribes to this topic
    pub fn wants(&self, topic: &str) -> bool {
        self.remote_topics.read().contains(topic)
    }

    /// Queue a topic message for this peer without waiting
    pub fn send(&self, topic: &str, body: Bytes) -> Result<(), PubSubError> {
        let tx = self.command_tx.as_ref().ok_or(PubSubError::Closed)?;
        tx.try_send(PeerCommand::Message {
            topic: topic.to_string(),
            body,
        })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                PubSubError::Protocol(format!("peer '{}' send queue is full", self.server_id))
            }
            mpsc::error::TrySendError::Closed(_) => PubSubError::Closed,
        })
    }

    /// Spawn the connection task and return the peer ready to use
    pub fn spawn(mut self, inbound: InboundCallback) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        self.command_tx = Some(tx);

        let server_id = self.server_id.clone();
        let local_server_id = self.local_server_id.clone();
        let peer_addr = self.peer_addr;
        let status = self.status.clone();

        tokio::spawn(async move {
            Self::connection_loop(server_id, local_server_id, peer_addr, status, rx, inbound)
                .await;
        });

        Arc::new(self)
    }

    /// Ask the connection task to say Goodbye and exit
    pub async fn stop(&self) {
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(PeerCommand::Shutdown).await;
        }
        info!("ClusterPeer '{}': Stopped", self.server_id);
    }

    /// Run the connection loop with reconnection
    async fn connection_loop(
        server_id: String,
        local_server_id: String,
        peer_addr: SocketAddr,
        status: Arc<RwLock<PeerStatus>>,
        mut command_rx: mpsc::Receiver<PeerCommand>,
        inbound: InboundCallback,
    ) {
        let mut retry_interval = Duration::from_secs(1);
        let max_retry = Duration::from_secs(30);

        loop {
            *status.write() = PeerStatus::Connecting;
            debug!("ClusterPeer '{}': Connecting to {}", server_id, peer_addr);

            match Self::connect_and_run(
                &server_id,
                &local_server_id,
                peer_addr,
                &status,
                &mut command_rx,
                &inbound,
            )
            .await
            {
                Ok(()) => {
                    info!("ClusterPeer '{}': Disconnected gracefully", server_id);
                    *status.write() = PeerStatus::Disconnected;
                    return;
                }
                Err(e) => {
                    error!("ClusterPeer '{}': Connection failed: {}", server_id, e);
                    *status.write() = PeerStatus::Backoff;

                    debug!(
                        "ClusterPeer '{}': Reconnecting in {:?}",
                        server_id, retry_interval
                    );

                    // Commands queued while disconnected are dropped; delivery is best effort
                    let deadline = tokio::time::Instant::now() + retry_interval;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => break,
                            cmd = command_rx.recv() => match cmd {
                                Some(PeerCommand::Message { .. }) => continue,
                                Some(PeerCommand::Shutdown) | None => {
                                    info!("ClusterPeer '{}': Shutdown requested", server_id);
                                    *status.write() = PeerStatus::Disconnected;
                                    return;
                                }
                            }
                        }
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        server_id: &str,
        local_server_id: &str,
        peer_addr: SocketAddr,
        status: &Arc<RwLock<PeerStatus>>,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
        inbound: &InboundCallback,
    ) -> Result<(), PubSubError> {
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| PubSubError::Timeout)??;
        stream.set_nodelay(true)?;

        debug!("ClusterPeer '{}': TCP connected", server_id);

        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(64 * 1024);

        write_frame(
            &mut write_half,
            &PeerFrame::Hello {
                server_id: local_server_id.to_string(),
                version: CLUSTER_PROTOCOL_VERSION,
            },
        )
        .await?;

        let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half, &mut read_buf))
            .await
            .map_err(|_| PubSubError::Timeout)??;

        match ack {
            Some(PeerFrame::HelloAck {
                server_id: peer_id,
                version,
            }) => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(PubSubError::Protocol(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                info!("ClusterPeer '{}': Connected (peer_id={})", server_id, peer_id);
            }
            Some(other) => {
                return Err(PubSubError::Protocol(format!(
                    "Expected HelloAck, got {}",
                    other.type_name()
                )));
            }
            None => return Err(PubSubError::Closed),
        }

        *status.write() = PeerStatus::Connected;

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.reset();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(PeerCommand::Message { topic, body }) => {
                        let frame = PeerFrame::Message { topic, body: body.to_vec() };
                        write_frame(&mut write_half, &frame).await?;
                    }
                    Some(PeerCommand::Shutdown) | None => {
                        let _ = write_frame(&mut write_half, &PeerFrame::Goodbye).await;
                        return Ok(());
                    }
                },

                frame = read_frame(&mut read_half, &mut read_buf) => match frame? {
                    Some(PeerFrame::Message { topic, body }) => inbound(topic, Bytes::from(body)),
                    Some(PeerFrame::Ping) => write_frame(&mut write_half, &PeerFrame::Pong).await?,
                    Some(PeerFrame::Pong) => debug!("ClusterPeer '{}': Pong received", server_id),
                    Some(PeerFrame::Goodbye) => {
                        info!("ClusterPeer '{}': Received Goodbye", server_id);
                        return Err(PubSubError::Closed);
                    }
                    Some(other) => {
                        warn!("ClusterPeer '{}': Unexpected {} frame", server_id, other.type_name());
                    }
                    None => return Err(PubSubError::Closed),
                },

                _ = ping_timer.tick() => {
                    write_frame(&mut write_half, &PeerFrame::Ping).await?;
                }
            }
        }
    }
}

/// Write one length-prefixed frame
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &PeerFrame,
) -> Result<(), PubSubError> {
    let bytes = frame_message(frame)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read one length-prefixed frame, buffering partial reads in `buf`.
///
/// Returns `None` on a clean end of stream. Cancel safe: bytes already
/// read stay in `buf` for the next call.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<PeerFrame>, PubSubError> {
    loop {
        if let Some(len) = read_frame_length(buf) {
            let len = len as usize;
            if len > MAX_FRAME_SIZE {
                return Err(PubSubError::Protocol(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    len, MAX_FRAME_SIZE
                )));
            }
            if buf.len() >= 4 + len {
                buf.advance(4);
                let body = buf.split_to(len);
                return Ok(Some(PeerFrame::decode(&body)?));
            }
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PubSubError::Protocol("connection closed mid-frame".to_string()));
        }
    }
}
