//! Configuration Module
//!
//! Provides TOML-based configuration for PulseHub with support for:
//! - Server settings (bind address, WebSocket path, hub sharding)
//! - Per-connection queue, congestion and liveness parameters
//! - Session snapshot caching and static development sessions
//! - Cluster pub/sub (gossip) settings
//! - Environment variable overrides (PULSEHUB__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export cluster config types
pub use cluster::ClusterConfig;

// Re-export metrics config types
pub use metrics::MetricsConfig;

mod cluster;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Per-connection configuration
    pub connection: ConnectionConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Cluster configuration (only first enabled entry is used)
    #[serde(default)]
    pub cluster: Vec<ClusterConfig>,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// WebSocket upgrade path
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Hubs per available CPU core
    #[serde(default = "default_hub_multiplier")]
    pub hub_multiplier: usize,
    /// Explicit hub count, overrides `hub_multiplier` when set
    pub hubs: Option<usize>,
    /// Capacity of each hub's command queue
    #[serde(default = "default_hub_queue_size")]
    pub hub_queue_size: usize,
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long shutdown waits for connections to close
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8065))
}
fn default_ws_path() -> String {
    "/api/v4/websocket".to_string()
}
fn default_hub_multiplier() -> usize {
    4
}
fn default_hub_queue_size() -> usize {
    4096
}
fn default_max_connections() -> usize {
    100_000
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_path: default_ws_path(),
            hub_multiplier: default_hub_multiplier(),
            hubs: None,
            hub_queue_size: default_hub_queue_size(),
            max_connections: default_max_connections(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Number of hubs to start: explicit count, else multiplier x cores
    pub fn hub_count(&self) -> usize {
        self.hubs.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            self.hub_multiplier * cores
        })
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Outbound queue capacity per connection
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,
    /// Queue occupancy (fraction of capacity) above which droppable events are shed
    #[serde(default = "default_congestion_threshold")]
    pub congestion_threshold: f64,
    /// Event kinds that may be shed under congestion
    #[serde(default = "default_droppable_events")]
    pub droppable_events: Vec<String>,
    /// Deadline for a single socket write
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Read deadline, pushed forward by every received frame
    #[serde(default = "default_pong_timeout", with = "humantime_serde")]
    pub pong_timeout: Duration,
    /// Liveness timer period (ping + session check)
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_send_queue_size() -> usize {
    256
}
fn default_congestion_threshold() -> f64 {
    0.5
}
fn default_droppable_events() -> Vec<String> {
    vec![
        "typing".to_string(),
        "inbox_ping".to_string(),
        "status_change".to_string(),
    ]
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_pong_timeout() -> Duration {
    Duration::from_secs(100)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_max_message_size() -> usize {
    64 * 1024
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue_size: default_send_queue_size(),
            congestion_threshold: default_congestion_threshold(),
            droppable_events: default_droppable_events(),
            write_timeout: default_write_timeout(),
            pong_timeout: default_pong_timeout(),
            ping_interval: default_ping_interval(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a fetched session snapshot is trusted before re-validation
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Static sessions loaded into the in-memory store
    #[serde(default)]
    pub users: Vec<SessionUserConfig>,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(600)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            users: Vec::new(),
        }
    }
}

/// Static session entry
#[derive(Debug, Clone, Deserialize)]
pub struct SessionUserConfig {
    /// Bearer token
    pub token: String,
    /// User the token authenticates
    pub user_id: String,
    /// Team memberships
    #[serde(default)]
    pub teams: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `PULSEHUB__` prefix with double underscores for nesting:
    ///    - `PULSEHUB__SERVER__BIND=0.0.0.0:8066` overrides `server.bind`
    ///    - `PULSEHUB__CONNECTION__SEND_QUEUE_SIZE=512` overrides `connection.send_queue_size`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:8065")?
            .set_default("server.ws_path", "/api/v4/websocket")?
            .set_default("server.hub_multiplier", 4)?
            .set_default("server.hub_queue_size", 4096)?
            .set_default("server.max_connections", 100_000)?
            .set_default("server.shutdown_timeout", "30s")?
            .set_default("connection.send_queue_size", 256)?
            .set_default("connection.congestion_threshold", 0.5)?
            .set_default("connection.write_timeout", "30s")?
            .set_default("connection.pong_timeout", "100s")?
            .set_default("connection.ping_interval", "60s")?
            .set_default("connection.max_message_size", 64 * 1024)?
            .set_default("session.cache_ttl", "10m")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (PULSEHUB__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("PULSEHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// First enabled cluster entry, if any
    pub fn cluster(&self) -> Option<&ClusterConfig> {
        self.cluster.iter().find(|c| c.enabled)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "server.ws_path must start with '/'".to_string(),
            ));
        }

        match self.server.hubs {
            Some(0) => {
                return Err(ConfigError::Validation(
                    "server.hubs must be at least 1".to_string(),
                ));
            }
            None if self.server.hub_multiplier == 0 => {
                return Err(ConfigError::Validation(
                    "server.hub_multiplier must be at least 1".to_string(),
                ));
            }
            _ => {}
        }

        if self.server.hub_queue_size == 0 {
            return Err(ConfigError::Validation(
                "server.hub_queue_size must be at least 1".to_string(),
            ));
        }

        if self.connection.send_queue_size == 0 {
            return Err(ConfigError::Validation(
                "connection.send_queue_size must be at least 1".to_string(),
            ));
        }

        let threshold = self.connection.congestion_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "connection.congestion_threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        if self.connection.ping_interval >= self.connection.pong_timeout {
            return Err(ConfigError::Validation(
                "connection.ping_interval must be shorter than connection.pong_timeout"
                    .to_string(),
            ));
        }

        if self.connection.ping_interval.is_zero() {
            return Err(ConfigError::Validation(
                "connection.ping_interval must be greater than zero".to_string(),
            ));
        }

        for user in &self.session.users {
            if user.token.is_empty() || user.user_id.is_empty() {
                return Err(ConfigError::Validation(
                    "session.users entries need a non-empty token and user_id".to_string(),
                ));
            }
        }

        if let Some(cluster) = self.cluster() {
            cluster.validate().map_err(ConfigError::Validation)?;
        }

        Ok(())
    }
}
