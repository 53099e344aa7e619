//! Cluster Configuration
//!
//! Settings for the gossip-discovered pub/sub bus that links servers.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

/// One server's view of the cluster bus
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,

    /// Identity stamped on every published message.
    /// Hostname when unset, a random UUID if even that is unavailable.
    pub server_id: Option<String>,

    /// UDP bind address for chitchat gossip
    pub gossip_addr: SocketAddr,

    /// Gossip address other servers dial; resolved from the hostname when unset
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// TCP bind address for the message relay
    pub peer_addr: SocketAddr,

    /// Relay address other servers dial; resolved from the hostname when unset
    pub peer_advertise_addr: Option<SocketAddr>,

    /// Gossip addresses (`host:port`) used to join the cluster
    pub seeds: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// How long a departed server's gossip state lingers before removal
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    /// Phi accrual failure detector threshold
    pub phi_threshold: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_id: None,
            gossip_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            gossip_advertise_addr: None,
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 7947)),
            peer_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            dead_node_grace_period: Duration::from_secs(30),
            phi_threshold: 8.0,
        }
    }
}

impl ClusterConfig {
    /// Configured server id, else hostname, else a fresh UUID
    pub fn get_server_id(&self) -> String {
        if let Some(id) = self.server_id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn get_gossip_advertise_addr(&self) -> SocketAddr {
        advertise(self.gossip_advertise_addr, self.gossip_addr)
    }

    pub fn get_peer_advertise_addr(&self) -> SocketAddr {
        advertise(self.peer_advertise_addr, self.peer_addr)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.gossip_interval.is_zero() {
            return Err("cluster.gossip_interval must be greater than zero".to_string());
        }
        if self.phi_threshold <= 0.0 {
            return Err(format!(
                "cluster.phi_threshold must be positive, got {}",
                self.phi_threshold
            ));
        }
        if self.gossip_addr == self.peer_addr {
            return Err("cluster.gossip_addr and cluster.peer_addr must differ".to_string());
        }
        if let Some(seed) = self.seeds.iter().find(|s| !s.contains(':')) {
            return Err(format!("cluster seed '{}' must be host:port", seed));
        }
        Ok(())
    }
}

/// Explicit address, else the bind port on the hostname's IPv4 address,
/// else the bind address itself
fn advertise(explicit: Option<SocketAddr>, bind: SocketAddr) -> SocketAddr {
    if let Some(addr) = explicit {
        return addr;
    }
    if !bind.ip().is_unspecified() {
        return bind;
    }
    match resolve_local_ip() {
        Some(ip) => SocketAddr::new(ip, bind.port()),
        None => bind,
    }
}

fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    (hostname.to_string_lossy().as_ref(), 0)
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}
