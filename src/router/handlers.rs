//! Built-in request handlers

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{RequestContext, RequestHandler};
use crate::cluster::ClusterBridge;
use crate::protocol::{kinds, Broadcast, ClientError, Event};

/// `ping`: liveness check from the client
pub struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    async fn handle(
        &self,
        _ctx: &RequestContext,
        _data: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let server_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(json!({
            "text": "pong",
            "version": env!("CARGO_PKG_VERSION"),
            "server_time": server_time,
        }))
    }
}

/// `user_typing`: tell a team that the sender is typing
pub struct TypingHandler {
    bridge: Arc<ClusterBridge>,
}

impl TypingHandler {
    pub fn new(bridge: Arc<ClusterBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl RequestHandler for TypingHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        data: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let team_id = data
            .get("team_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ClientError::bad_request("data.team_id is required"))?;
        if !ctx.session.is_team_member(team_id) {
            return Err(ClientError::forbidden("not a member of this team"));
        }
        let parent_id = data.get("parent_id").and_then(Value::as_str).unwrap_or("");

        let event = Event::new(kinds::TYPING, Broadcast::Team(team_id.to_string()))
            .with("user_id", ctx.session.user_id.as_str())
            .with("team_id", team_id)
            .with("parent_id", parent_id);
        self.bridge.publish(Arc::new(event)).await;
        Ok(Value::Null)
    }
}
