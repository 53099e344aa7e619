//! Pub/Sub backends
//!
//! The bridge only needs topic publish and topic subscribe. Delivery is
//! best effort: nothing is acknowledged and nothing missed while a
//! subscriber is away is replayed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Capacity of the per-subscription delivery queue
pub const DELIVERY_QUEUE_SIZE: usize = 1024;

/// Pub/Sub error types
#[derive(Debug)]
pub enum PubSubError {
    /// Socket error
    Io(std::io::Error),
    /// Frame could not be encoded
    Encode(bincode::error::EncodeError),
    /// Frame could not be decoded
    Decode(bincode::error::DecodeError),
    /// Peer violated the link protocol
    Protocol(String),
    /// Gossip layer failed to start
    Gossip(String),
    /// Operation timed out
    Timeout,
    /// Backend is closed, or its single subscription was already taken
    Closed,
}

impl fmt::Display for PubSubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PubSubError::Io(e) => write!(f, "IO error: {}", e),
            PubSubError::Encode(e) => write!(f, "Encode error: {}", e),
            PubSubError::Decode(e) => write!(f, "Decode error: {}", e),
            PubSubError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PubSubError::Gossip(msg) => write!(f, "Gossip error: {}", msg),
            PubSubError::Timeout => write!(f, "Operation timed out"),
            PubSubError::Closed => write!(f, "Pub/sub backend is closed"),
        }
    }
}

impl std::error::Error for PubSubError {}

impl From<std::io::Error> for PubSubError {
    fn from(e: std::io::Error) -> Self {
        PubSubError::Io(e)
    }
}

impl From<bincode::error::EncodeError> for PubSubError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PubSubError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for PubSubError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PubSubError::Decode(e)
    }
}

/// A message received on a subscribed topic
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

/// Topic-based publish/subscribe transport between servers
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PubSubError>;

    /// Subscribe to a set of topics; deliveries arrive on the returned queue
    async fn subscribe(&self, topics: &[String]) -> Result<mpsc::Receiver<Delivery>, PubSubError>;

    /// Release the backend
    async fn close(&self);
}

/// In-process topic bus.
///
/// Every subscriber sees every message published on its topics, the
/// publisher's own subscriptions included. Clones share the same bus,
/// which is how several servers in one process are wired together.
#[derive(Clone)]
pub struct MemoryPubSub {
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DELIVERY_QUEUE_SIZE)
    }

    /// Bus whose per-topic buffer holds `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PubSubError> {
        // No receivers is not an error on a best-effort bus
        let delivered = self.sender(topic).send(payload).unwrap_or(0);
        debug!("Memory pub/sub: '{}' reached {} subscribers", topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<mpsc::Receiver<Delivery>, PubSubError> {
        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_SIZE);

        for topic in topics {
            // Subscribe before returning so nothing published afterwards is missed
            let mut bus = self.sender(topic).subscribe();
            let tx = tx.clone();
            let topic = topic.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        received = bus.recv() => match received {
                            Ok(payload) => {
                                let delivery = Delivery { topic: topic.clone(), payload };
                                if tx.send(delivery).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Memory pub/sub: subscriber on '{}' skipped {} messages", topic, skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            });
        }

        Ok(rx)
    }

    async fn close(&self) {
        // Shared bus; subscriptions end when their receivers are dropped
    }
}
