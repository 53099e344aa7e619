//! PulseHub - real-time WebSocket event fan-out server
//!
//! Usage:
//!   pulsehub [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -b, --bind <ADDR>          WebSocket bind address (default: 0.0.0.0:8065)
//!   --hubs <N>                 Number of hubs (default: 4 x CPU count)
//!   --send-queue-size <N>      Outbound queue capacity per connection (default: 256)
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use pulsehub::cluster::{GossipPubSub, PubSub};
use pulsehub::config::Config;
use pulsehub::metrics::{Metrics, MetricsServer};
use pulsehub::server::{Server, ServerSettings};
use pulsehub::session::{MemorySessionStore, SessionStore};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// PulseHub - real-time event fan-out
#[derive(Parser, Debug)]
#[command(name = "pulsehub")]
#[command(author = "PulseHub Contributors")]
#[command(version)]
#[command(about = "Sharded real-time WebSocket event fan-out server")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of hubs (overrides server.hub_multiplier)
    #[arg(long)]
    hubs: Option<usize>,

    /// Outbound queue capacity per connection
    #[arg(long)]
    send_queue_size: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(hubs) = args.hubs {
        config.server.hubs = Some(hubs);
    }
    if let Some(size) = args.send_queue_size {
        config.connection.send_queue_size = size;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let settings = ServerSettings::from_config(&config);

    info!("Starting PulseHub");
    info!("  Server id: {}", settings.server_id);
    info!("  Bind address: {} (path: {})", settings.bind, settings.ws_path);
    info!("  Hubs: {}", settings.hubs.count);
    info!("  Max connections: {}", settings.max_connections);
    info!(
        "  Send queue: {} (shedding above {})",
        settings.connection.send_queue_size, settings.connection.congestion_limit
    );
    info!("  Static sessions: {}", config.session.users.len());

    let shutdown = CancellationToken::new();

    // Setup metrics if configured
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        info!("  Metrics: enabled (http://{})", config.metrics.bind);

        let metrics_server =
            MetricsServer::new(metrics.clone(), config.metrics.bind, shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
        Some(metrics)
    } else {
        info!("  Metrics: disabled");
        None
    };

    // Setup clustering if configured
    let pubsub: Option<Arc<dyn PubSub>> = match config.cluster() {
        Some(cluster_cfg) => {
            info!(
                "  Cluster: enabled (gossip={}, peer={})",
                cluster_cfg.gossip_addr, cluster_cfg.peer_addr
            );
            if !cluster_cfg.seeds.is_empty() {
                info!("    Seeds: {}", cluster_cfg.seeds.join(", "));
            }

            match GossipPubSub::start(cluster_cfg.clone()).await {
                Ok(gossip) => Some(Arc::new(gossip) as Arc<dyn PubSub>),
                Err(e) => {
                    eprintln!("Error initializing cluster: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("  Cluster: disabled");
            None
        }
    };

    let sessions: Arc<dyn SessionStore> =
        Arc::new(MemorySessionStore::from_config(&config.session.users));

    let server = Arc::new(Server::new(settings, sessions, pubsub, metrics));
    server.start().await?;

    let listener = server.bind().await?;
    let accept = tokio::spawn(server.clone().run(listener));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    shutdown.cancel();
    server.shutdown().await;
    match accept.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Accept loop failed: {}", e),
        Err(e) => error!("Accept loop panicked: {}", e),
    }

    Ok(())
}
