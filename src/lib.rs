//! PulseHub - sharded real-time WebSocket event fan-out
//!
//! Connections are sharded over a fixed set of single-task hubs by user
//! id. Events published on any server reach every eligible connection in
//! the fleet through the cluster bridge; slow consumers are disconnected
//! rather than allowed to hold anyone else up.

pub mod cluster;
pub mod config;
pub mod connection;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use cluster::{ClusterBridge, ClusterHandler, GossipPubSub, MemoryPubSub, PubSub};
pub use config::Config;
pub use connection::{ConnectionId, WebConn};
pub use hub::{HubSet, HubSettings};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{Broadcast, Event};
pub use router::{RequestContext, RequestHandler, RequestRouter};
pub use server::{Server, ServerSettings};
pub use session::{MemorySessionStore, Session, SessionStore};
