//! Session Store
//!
//! Sessions are owned by an external store; the fan-out layer only reads
//! them through [`SessionStore`] and caches short-lived snapshots per
//! connection. [`MemorySessionStore`] backs the binary and the tests.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::config::SessionUserConfig;


/// Session store error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session for this token
    NotFound,
    /// Session exists but has expired
    Expired,
    /// Store backend failed
    Backend(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "session not found"),
            SessionError::Expired => write!(f, "session expired"),
            SessionError::Backend(msg) => write!(f, "session store error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// An authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub user_id: String,
    /// Teams the user belongs to
    pub team_ids: Vec<String>,
    /// Absolute expiry, `None` for sessions that never expire
    pub expires_at: Option<SystemTime>,
}

impl Session {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            id: format!("s-{}", token),
            token,
            user_id: user_id.into(),
            team_ids: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_teams<I, S>(mut self, teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.team_ids = teams.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_team_member(&self, team_id: &str) -> bool {
        self.team_ids.iter().any(|t| t == team_id)
    }
}

/// External session store consumed by the fan-out layer
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve a token to its session
    async fn get(&self, token: &str) -> Result<Arc<Session>, SessionError>;

    /// Revoke every session of a user
    async fn invalidate_for_user(&self, user_id: &str) -> Result<(), SessionError>;
}

/// In-process session store keyed by token
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Arc<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store seeded from static configuration
    pub fn from_config(users: &[SessionUserConfig]) -> Self {
        let store = Self::new();
        for user in users {
            store.insert(Session::new(&user.token, &user.user_id).with_teams(&user.teams));
        }
        store
    }

    pub fn insert(&self, session: Session) {
        self.sessions
            .insert(session.token.clone(), Arc::new(session));
    }

    pub fn remove(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.remove(token).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, token: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .get(token)
            .map(|s| s.value().clone())
            .ok_or(SessionError::NotFound)?;

        if session.is_expired(SystemTime::now()) {
            self.sessions.remove(token);
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    async fn invalidate_for_user(&self, user_id: &str) -> Result<(), SessionError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.user_id != user_id);
        debug!(
            "Revoked {} session(s) for user {}",
            before.saturating_sub(self.sessions.len()),
            user_id
        );
        Ok(())
    }
}
