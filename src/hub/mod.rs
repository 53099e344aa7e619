//! Hubs
//!
//! A hub is a single task owning one [`ConnectionIndex`]. Every mutation
//! of that index arrives as a [`HubCommand`] on the hub's queue, so the
//! index itself needs no locking. [`HubSet`] shards users over a fixed
//! number of hubs.
//!
//! The hub loop runs under a supervisor: if it panics, the connections it
//! held are closed (their clients reconnect) and the loop restarts with
//! an empty index.

mod index;
mod set;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionId, OutboundMessage, SendError, SendOutcome, WebConn};
use crate::metrics::Metrics;
use crate::protocol::{kinds, Broadcast, Event};

pub use index::ConnectionIndex;
pub use set::HubSet;


/// Hub error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub is stopping or stopped
    Stopped,
    /// The hub restarted before acknowledging the command
    Lost,
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Stopped => write!(f, "hub is stopped"),
            HubError::Lost => write!(f, "hub restarted before acknowledging"),
        }
    }
}

impl std::error::Error for HubError {}

/// Hub sizing and shutdown settings
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Number of hubs in the set
    pub count: usize,
    /// Capacity of each hub's command queue
    pub queue_size: usize,
    /// How long `stop` waits for connections to finish
    pub shutdown_timeout: Duration,
}

impl HubSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            count: config.hub_count().max(1),
            queue_size: config.hub_queue_size.max(1),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Defaults from configuration with an explicit hub count
    pub fn with_count(count: usize) -> Self {
        Self {
            count: count.max(1),
            ..Self::from_config(&ServerConfig::default())
        }
    }
}

/// Operations accepted by the hub loop
enum HubCommand {
    /// Index under the user id captured when the command was sent
    Register {
        conn: Arc<WebConn>,
        user_id: Arc<str>,
        done: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
        done: oneshot::Sender<()>,
    },
    InvalidateUser(Arc<str>),
    SendDirect {
        conn: Arc<WebConn>,
        message: OutboundMessage,
    },
    Broadcast(Arc<Event>),
    Count(oneshot::Sender<usize>),
    #[cfg(test)]
    Crash,
}

/// Handle to one running hub
pub struct HubHandle {
    id: usize,
    tx: mpsc::Sender<HubCommand>,
    stopping: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubHandle {
    /// Spawn the hub loop under its supervisor
    pub fn start(id: usize, settings: &HubSettings, metrics: Option<Arc<Metrics>>) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_size);
        let stopping = CancellationToken::new();
        let task = tokio::spawn(supervise(
            id,
            rx,
            stopping.clone(),
            settings.shutdown_timeout,
            metrics,
        ));

        Self {
            id,
            tx,
            stopping,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a command to the loop, giving up once the hub is stopping
    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        tokio::select! {
            biased;
            _ = self.stopping.cancelled() => Err(HubError::Stopped),
            result = self.tx.send(command) => result.map_err(|_| HubError::Stopped),
        }
    }

    /// Send a command and wait until the loop has applied it
    async fn apply(
        &self,
        command: HubCommand,
        done: oneshot::Receiver<()>,
    ) -> Result<(), HubError> {
        self.send(command).await?;
        tokio::select! {
            biased;
            _ = self.stopping.cancelled() => Err(HubError::Stopped),
            ack = done => ack.map_err(|_| HubError::Lost),
        }
    }

    /// Index a connection under its current user id; returns once indexed
    pub async fn register(&self, conn: Arc<WebConn>) -> Result<(), HubError> {
        let user_id = conn.user_id();
        self.register_as(conn, user_id).await
    }

    pub(crate) async fn register_as(
        &self,
        conn: Arc<WebConn>,
        user_id: Arc<str>,
    ) -> Result<(), HubError> {
        let (done, ack) = oneshot::channel();
        self.apply(HubCommand::Register { conn, user_id, done }, ack)
            .await
    }

    /// Remove a connection; returns once the hub no longer indexes it
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        let (done, ack) = oneshot::channel();
        self.apply(HubCommand::Unregister { id, done }, ack).await
    }

    pub async fn invalidate_user(&self, user_id: Arc<str>) -> Result<(), HubError> {
        self.send(HubCommand::InvalidateUser(user_id)).await
    }

    pub async fn send_direct(
        &self,
        conn: Arc<WebConn>,
        message: OutboundMessage,
    ) -> Result<(), HubError> {
        self.send(HubCommand::SendDirect { conn, message }).await
    }

    pub async fn broadcast(&self, event: Arc<Event>) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast(event)).await
    }

    /// Number of indexed connections, 0 once stopped
    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.send(HubCommand::Count(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Stop the hub and wait for its connections to close
    pub async fn stop(&self) {
        self.stopping.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Hub {} task failed: {}", self.id, e);
            }
        }
    }

    #[cfg(test)]
    async fn crash(&self) -> Result<(), HubError> {
        self.send(HubCommand::Crash).await
    }
}

async fn supervise(
    id: usize,
    mut rx: mpsc::Receiver<HubCommand>,
    stopping: CancellationToken,
    shutdown_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
) {
    info!("Hub {} started", id);
    loop {
        let mut hub = Hub::new(id, metrics.clone());
        let outcome = AssertUnwindSafe(hub.run(&mut rx, &stopping))
            .catch_unwind()
            .await;

        match outcome {
            Ok(()) => {
                hub.shutdown(shutdown_timeout).await;
                break;
            }
            Err(_) => {
                let lost = hub.index.drain();
                error!(
                    "Hub {} panicked, restarting with an empty index ({} connections dropped)",
                    id,
                    lost.len()
                );
                for conn in &lost {
                    conn.close();
                }
                if let Some(ref m) = metrics {
                    m.hub_restarted();
                }
            }
        }
    }
}

/// State owned by the hub loop
struct Hub {
    id: usize,
    index: ConnectionIndex,
    metrics: Option<Arc<Metrics>>,
}

impl Hub {
    fn new(id: usize, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            id,
            index: ConnectionIndex::new(),
            metrics,
        }
    }

    async fn run(&mut self, rx: &mut mpsc::Receiver<HubCommand>, stopping: &CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = stopping.cancelled() => return,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => return,
                },
            };
            self.handle(command).await;
        }
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                conn,
                user_id,
                done,
            } => {
                self.register(conn, user_id).await;
                let _ = done.send(());
            }
            HubCommand::Unregister { id, done } => {
                if self.index.remove(id).is_some() {
                    debug!("Hub {}: unregistered {}", self.id, id);
                }
                let _ = done.send(());
            }
            HubCommand::InvalidateUser(user_id) => {
                for conn in self.index.for_user(&user_id) {
                    conn.invalidate_cache();
                }
            }
            HubCommand::SendDirect { conn, message } => {
                if self.index.has(conn.id()) {
                    self.deliver(&conn, message);
                }
            }
            HubCommand::Broadcast(event) => self.broadcast(event).await,
            HubCommand::Count(reply) => {
                let _ = reply.send(self.index.len());
            }
            #[cfg(test)]
            HubCommand::Crash => panic!("hub {} asked to crash", self.id),
        }
    }

    async fn register(&mut self, conn: Arc<WebConn>, user_id: Arc<str>) {
        // re-authenticated since the command was sent; its new hub registers it
        if conn.user_id() != user_id {
            debug!(
                "Hub {}: skipping stale registration of {} as '{}'",
                self.id,
                conn.id(),
                user_id
            );
            return;
        }
        if !self.index.add(conn.clone()) {
            return;
        }
        debug!(
            "Hub {}: registered {} for user '{}'",
            self.id,
            conn.id(),
            conn.user_id()
        );

        if conn.is_authenticated().await {
            let hello = Event::new(kinds::HELLO, Broadcast::User(conn.user_id().to_string()))
                .with("connection_id", conn.id().to_string())
                .with("server_version", env!("CARGO_PKG_VERSION"));
            self.deliver(&conn, OutboundMessage::Event(Arc::new(hello)));
        }
    }

    async fn broadcast(&mut self, event: Arc<Event>) {
        let targets = match event.target_user() {
            Some(user_id) => self.index.for_user(user_id).to_vec(),
            None => self.index.all(),
        };

        for conn in targets {
            if conn.should_send_event(&event).await {
                self.deliver(&conn, OutboundMessage::Event(event.clone()));
            }
        }
    }

    /// Non-blocking enqueue; a full queue disconnects the consumer
    fn deliver(&mut self, conn: &Arc<WebConn>, message: OutboundMessage) -> bool {
        let is_event = matches!(message, OutboundMessage::Event(_));
        match conn.try_send(message) {
            Ok(SendOutcome::Queued) => {
                if is_event {
                    if let Some(ref m) = self.metrics {
                        m.event_delivered();
                    }
                }
                true
            }
            Ok(SendOutcome::Shed) => {
                if let Some(ref m) = self.metrics {
                    m.event_shed();
                }
                true
            }
            Err(SendError::Full) => {
                warn!(
                    "Slow consumer {} (user '{}'): send queue of {} full, disconnecting",
                    conn.id(),
                    conn.user_id(),
                    conn.settings().send_queue_size
                );
                conn.close_queue();
                self.index.remove(conn.id());
                if let Some(ref m) = self.metrics {
                    m.slow_consumer();
                }
                false
            }
            Err(SendError::Closed) => {
                self.index.remove(conn.id());
                false
            }
        }
    }

    async fn shutdown(&mut self, timeout: Duration) {
        let conns = self.index.drain();
        for conn in &conns {
            conn.close();
        }

        let pumped: Vec<_> = conns.iter().filter(|c| c.has_pump()).collect();
        let finished = join_all(pumped.iter().map(|c| c.finished()));
        if tokio::time::timeout(timeout, finished).await.is_err() {
            warn!(
                "Hub {}: connections still open after {:?}",
                self.id, timeout
            );
        }
        info!("Hub {} stopped ({} connections closed)", self.id, conns.len());
    }
}
