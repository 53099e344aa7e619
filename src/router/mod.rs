//! Request Router
//!
//! Inbound requests are dispatched by action name to registered
//! [`RequestHandler`]s. Validation and the authentication gate run before
//! any handler is consulted; every request gets exactly one reply on the
//! connection's queue.

mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::connection::{OutboundMessage, WebConn};
use crate::hub::HubSet;
use crate::metrics::Metrics;
use crate::protocol::{ClientError, ErrorEnvelope, ErrorKind, Request, Response};
use crate::session::Session;

pub use handlers::{PingHandler, TypingHandler};

#[cfg(test)]
mod tests;

/// Action that attaches a session to an anonymous connection
pub const AUTHENTICATION_CHALLENGE: &str = "authentication_challenge";

/// What a handler gets to see about the request's origin
pub struct RequestContext {
    pub conn: Arc<WebConn>,
    /// Session validated for this request
    pub session: Arc<Session>,
    pub seq: i64,
}

/// Handler for one action
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request, returning the reply payload
    async fn handle(
        &self,
        ctx: &RequestContext,
        data: &Map<String, Value>,
    ) -> Result<Value, ClientError>;
}

/// Registry of request handlers keyed by action
pub struct RequestRouter {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    hubs: Arc<HubSet>,
    metrics: Option<Arc<Metrics>>,
}

impl RequestRouter {
    pub fn new(hubs: Arc<HubSet>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            hubs,
            metrics,
        }
    }

    /// Register a handler, replacing any previous one for the action
    pub fn register(&self, action: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        let action = action.into();
        if self.handlers.write().insert(action.clone(), handler).is_some() {
            debug!("Replaced request handler for '{}'", action);
        }
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    /// Dispatch one request and enqueue its reply
    pub async fn serve(&self, conn: &Arc<WebConn>, request: Request) {
        let seq = request.seq;
        let reply = match self.dispatch(conn, request).await {
            Ok(data) => OutboundMessage::Response(Response::ok(seq, data)),
            Err(err) => {
                if err.kind == ErrorKind::Internal {
                    error!("Request seq {} on {} failed: {}", seq, conn.id(), err);
                } else {
                    debug!("Request seq {} on {} rejected: {}", seq, conn.id(), err);
                }
                OutboundMessage::Error(ErrorEnvelope::new(seq.max(0), &err))
            }
        };

        if conn.send_reply(reply).await.is_err() {
            debug!("Reply to seq {} dropped, {} is closing", seq, conn.id());
        }
    }

    async fn dispatch(&self, conn: &Arc<WebConn>, request: Request) -> Result<Value, ClientError> {
        request.validate()?;

        if request.action == AUTHENTICATION_CHALLENGE {
            self.count(AUTHENTICATION_CHALLENGE);
            return self.authentication_challenge(conn, &request.data).await;
        }

        if !conn.is_authenticated().await {
            return Err(ClientError::not_authenticated());
        }
        let session = conn.session().ok_or_else(ClientError::not_authenticated)?;

        let handler = self.handlers.read().get(&request.action).cloned();
        let Some(handler) = handler else {
            self.count("unknown");
            return Err(ClientError::new(
                ErrorKind::BadAction,
                format!("unknown action '{}'", request.action),
            ));
        };
        self.count(&request.action);

        let ctx = RequestContext {
            conn: conn.clone(),
            session,
            seq: request.seq,
        };
        handler.handle(&ctx, &request.data).await
    }

    /// Validate the token, then move the connection onto its user's hub
    async fn authentication_challenge(
        &self,
        conn: &Arc<WebConn>,
        data: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ClientError::bad_request("data.token is required"))?;

        let session = conn
            .lookup_session(token)
            .await
            .map_err(|e| ClientError::not_authenticated().with_detail(e.to_string()))?;

        self.hubs
            .unregister(conn.clone())
            .await
            .map_err(|e| ClientError::internal(e.to_string()))?;
        conn.install_session(token, session);
        self.hubs
            .register(conn.clone())
            .await
            .map_err(|e| ClientError::internal(e.to_string()))?;

        debug!("{} authenticated as '{}'", conn.id(), conn.user_id());
        Ok(Value::Null)
    }

    fn count(&self, action: &str) {
        if let Some(ref m) = self.metrics {
            m.request(action);
        }
    }
}
