//! Client Connections
//!
//! [`WebConn`] is the handle shared between a connection's own pump tasks
//! and the hub that indexes it. The hub only ever touches a connection
//! through the methods here: eligibility checks, non-blocking enqueue,
//! cache invalidation and queue close.

mod pump;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::config::{ConnectionConfig, SessionConfig};
use crate::protocol::{Broadcast, ErrorEnvelope, Event, Response};
use crate::session::{Session, SessionError, SessionStore};

pub use pump::{OutboundEncoder, Pump};


/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Encode(serde_json::Error),
    Decode(serde_json::Error),
    ReadTimeout,
    WriteTimeout,
    SessionRevoked,
    Shutdown,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::ReadTimeout => write!(f, "Read deadline exceeded"),
            ConnectionError::WriteTimeout => write!(f, "Write deadline exceeded"),
            ConnectionError::SessionRevoked => write!(f, "Session revoked"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectionError::WebSocket(e)
    }
}

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Message waiting in a connection's outbound queue
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Shared event, rendered with the connection's sequence number on write
    Event(Arc<Event>),
    /// Reply to a request
    Response(Response),
    /// Error reply
    Error(ErrorEnvelope),
}

/// Per-connection tunables derived from configuration
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub send_queue_size: usize,
    /// Droppable events are shed while queue occupancy is above this
    pub congestion_limit: usize,
    pub droppable_events: HashSet<String>,
    pub write_timeout: Duration,
    pub pong_timeout: Duration,
    pub ping_interval: Duration,
    pub session_cache_ttl: Duration,
}

impl ConnectionSettings {
    pub fn from_config(conn: &ConnectionConfig, session: &SessionConfig) -> Self {
        let limit = (conn.send_queue_size as f64 * conn.congestion_threshold).floor() as usize;
        Self {
            send_queue_size: conn.send_queue_size,
            congestion_limit: limit.min(conn.send_queue_size),
            droppable_events: conn.droppable_events.iter().cloned().collect(),
            write_timeout: conn.write_timeout,
            pong_timeout: conn.pong_timeout,
            ping_interval: conn.ping_interval,
            session_cache_ttl: session.cache_ttl,
        }
    }

    pub fn is_droppable(&self, kind: &str) -> bool {
        self.droppable_events.contains(kind)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default(), &SessionConfig::default())
    }
}

/// Result of a successful non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Droppable event discarded because the queue is congested
    Shed,
}

/// Enqueue failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Queue at capacity: slow consumer
    Full,
    /// Queue already closed
    Closed,
}

/// Cached authentication state, swapped as a whole
#[derive(Debug, Default)]
struct AuthState {
    token: Option<Arc<str>>,
    session: Option<Arc<Session>>,
    expires_at: Option<Instant>,
}

impl AuthState {
    fn is_fresh(&self, now: Instant) -> bool {
        self.session.is_some() && self.expires_at.is_some_and(|at| now < at)
    }
}

/// Hub-facing handle of one client connection
pub struct WebConn {
    id: ConnectionId,
    user_id: RwLock<Arc<str>>,
    auth: RwLock<Arc<AuthState>>,
    sender: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    settings: Arc<ConnectionSettings>,
    sessions: Arc<dyn SessionStore>,
    /// Cancelled when either pump task should stop
    closing: CancellationToken,
    /// Cancelled once both pump tasks have ended
    finished: CancellationToken,
    ever_authenticated: AtomicBool,
    pumped: AtomicBool,
}

impl fmt::Debug for WebConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebConn")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .finish()
    }
}

impl WebConn {
    /// Create an anonymous connection and its outbound queue
    pub fn new(
        id: ConnectionId,
        settings: Arc<ConnectionSettings>,
        sessions: Arc<dyn SessionStore>,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(settings.send_queue_size.max(1));
        let conn = Arc::new(Self {
            id,
            user_id: RwLock::new(Arc::from("")),
            auth: RwLock::new(Arc::new(AuthState::default())),
            sender: Mutex::new(Some(tx)),
            settings,
            sessions,
            closing: CancellationToken::new(),
            finished: CancellationToken::new(),
            ever_authenticated: AtomicBool::new(false),
            pumped: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// User this connection belongs to; empty while anonymous
    pub fn user_id(&self) -> Arc<str> {
        self.user_id.read().clone()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Currently cached session snapshot
    pub fn session(&self) -> Option<Arc<Session>> {
        self.auth.read().session.clone()
    }

    pub fn session_token(&self) -> Option<Arc<str>> {
        self.auth.read().token.clone()
    }

    /// Resolve a token against the session store without touching the cache
    pub async fn lookup_session(&self, token: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions.get(token).await
    }

    /// Install a freshly validated session and adopt its user
    pub fn install_session(&self, token: &str, session: Arc<Session>) {
        let expires_at = self.snapshot_expiry(&session);
        *self.user_id.write() = Arc::from(session.user_id.as_str());
        *self.auth.write() = Arc::new(AuthState {
            token: Some(Arc::from(token)),
            session: Some(session),
            expires_at: Some(expires_at),
        });
        self.ever_authenticated.store(true, Ordering::Relaxed);
    }

    /// Drop the cached snapshot, keeping the token so the next check re-validates
    pub fn invalidate_cache(&self) {
        let mut guard = self.auth.write();
        *guard = Arc::new(AuthState {
            token: guard.token.clone(),
            session: None,
            expires_at: None,
        });
    }

    /// Check the session, re-validating against the store when the snapshot is stale.
    ///
    /// A failed re-validation clears token, session and expiry together.
    pub async fn is_authenticated(&self) -> bool {
        let state = self.auth.read().clone();
        if state.is_fresh(Instant::now()) {
            return true;
        }
        let Some(token) = state.token.clone() else {
            return false;
        };

        match self.sessions.get(&token).await {
            Ok(session) => {
                let expires_at = self.snapshot_expiry(&session);
                let mut guard = self.auth.write();
                // token may have been swapped while the store was queried
                if guard.token.as_deref() == Some(&*token) {
                    *guard = Arc::new(AuthState {
                        token: Some(token),
                        session: Some(session),
                        expires_at: Some(expires_at),
                    });
                }
                true
            }
            Err(e) => {
                debug!("Session check failed for {}: {}", self.id, e);
                let mut guard = self.auth.write();
                if guard.token.as_deref() == Some(&*token) {
                    *guard = Arc::new(AuthState::default());
                }
                false
            }
        }
    }

    /// Liveness check run from the write task's timer.
    ///
    /// Returns false once the connection has no usable session token left.
    pub async fn check_liveness(&self) -> bool {
        self.is_authenticated().await;
        self.session_token().is_some()
    }

    /// Whether an event should be delivered to this connection
    pub async fn should_send_event(&self, event: &Event) -> bool {
        if !self.is_authenticated().await {
            return false;
        }
        match event.broadcast() {
            Broadcast::User(user_id) => *self.user_id() == **user_id,
            Broadcast::Omit(users) => !users.contains(&*self.user_id()),
            Broadcast::Team(team_id) => self
                .session()
                .is_some_and(|session| session.is_team_member(team_id)),
            Broadcast::All => true,
        }
    }

    /// Non-blocking enqueue used by the hub.
    ///
    /// Droppable events are shed once occupancy exceeds the congestion limit.
    pub fn try_send(&self, message: OutboundMessage) -> Result<SendOutcome, SendError> {
        let guard = self.sender.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::Closed);
        };

        if let OutboundMessage::Event(event) = &message {
            let occupancy = tx.max_capacity() - tx.capacity();
            if occupancy > self.settings.congestion_limit
                && self.settings.is_droppable(event.kind())
            {
                return Ok(SendOutcome::Shed);
            }
        }

        match tx.try_send(message) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Enqueue a reply from the connection's own read task, waiting for room
    pub async fn send_reply(&self, message: OutboundMessage) -> Result<(), SendError> {
        let tx = self.sender.lock().clone().ok_or(SendError::Closed)?;
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(SendError::Closed),
            result = tx.send(message) => result.map_err(|_| SendError::Closed),
        }
    }

    /// Close the outbound queue; the write task drains what is left and stops
    pub fn close_queue(&self) {
        self.sender.lock().take();
    }

    pub fn is_queue_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Ask both pump tasks to stop
    pub fn close(&self) {
        self.closing.cancel();
        self.close_queue();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }

    /// Record that a pump drives this connection
    pub(crate) fn attach_pump(&self) {
        self.pumped.store(true, Ordering::Release);
    }

    /// Whether a pump was started; only those ever report `finished`
    pub fn has_pump(&self) -> bool {
        self.pumped.load(Ordering::Acquire)
    }

    /// Mark the pump as fully stopped
    pub(crate) fn finish(&self) {
        self.finished.cancel();
    }

    pub fn finished(&self) -> WaitForCancellationFuture<'_> {
        self.finished.cancelled()
    }

    pub fn ever_authenticated(&self) -> bool {
        self.ever_authenticated.load(Ordering::Relaxed)
    }

    /// Snapshot expiry: cache TTL, capped by the session's own expiry
    fn snapshot_expiry(&self, session: &Session) -> Instant {
        let now = Instant::now();
        let ttl_deadline = now + self.settings.session_cache_ttl;
        match session.expires_at {
            Some(at) => {
                let left = at
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO);
                ttl_deadline.min(now + left)
            }
            None => ttl_deadline,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::session::MemorySessionStore;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    pub(crate) fn next_id() -> ConnectionId {
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Authenticated connection for `user_id` backed by `store`
    pub(crate) fn authed_conn(
        store: &Arc<MemorySessionStore>,
        user_id: &str,
        teams: &[&str],
        settings: ConnectionSettings,
    ) -> (Arc<WebConn>, mpsc::Receiver<OutboundMessage>) {
        let id = next_id();
        let token = format!("tok-{}", id.0);
        let session = Session::new(&token, user_id).with_teams(teams.iter().copied());
        store.insert(session.clone());

        let sessions: Arc<dyn SessionStore> = store.clone();
        let (conn, rx) = WebConn::new(id, Arc::new(settings), sessions);
        conn.install_session(&token, Arc::new(session));
        (conn, rx)
    }

    /// Anonymous connection that never authenticated
    pub(crate) fn anonymous_conn(
        store: &Arc<MemorySessionStore>,
    ) -> (Arc<WebConn>, mpsc::Receiver<OutboundMessage>) {
        let sessions: Arc<dyn SessionStore> = store.clone();
        WebConn::new(next_id(), Arc::new(ConnectionSettings::default()), sessions)
    }

    pub(crate) fn settings_with_queue(size: usize) -> ConnectionSettings {
        let config = ConnectionConfig {
            send_queue_size: size,
            ..Default::default()
        };
        ConnectionSettings::from_config(&config, &SessionConfig::default())
    }
}
