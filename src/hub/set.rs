//! Fixed set of hubs with user-id sharding

use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use futures_util::future::join_all;
use tracing::info;

use super::{HubError, HubHandle, HubSettings};
use crate::connection::{OutboundMessage, WebConn};
use crate::metrics::Metrics;
use crate::protocol::Event;

/// Hubs started once at process start; the set is never resized.
///
/// A user always maps to the same hub, so all of a user's connections
/// live in one index and a targeted broadcast touches exactly one hub.
pub struct HubSet {
    hubs: Vec<HubHandle>,
}

impl HubSet {
    pub fn start(settings: HubSettings, metrics: Option<Arc<Metrics>>) -> Self {
        let count = settings.count.max(1);
        let hubs = (0..count)
            .map(|id| HubHandle::start(id, &settings, metrics.clone()))
            .collect();
        info!(
            "Started {} hubs (queue size {})",
            count, settings.queue_size
        );
        Self { hubs }
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Deterministic hub index for a user id
    pub fn index_for_user(&self, user_id: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(user_id.as_bytes());
        (hasher.finish() % self.hubs.len() as u64) as usize
    }

    pub fn hub_for_user(&self, user_id: &str) -> &HubHandle {
        &self.hubs[self.index_for_user(user_id)]
    }

    pub async fn register(&self, conn: Arc<WebConn>) -> Result<(), HubError> {
        let user_id = conn.user_id();
        self.hub_for_user(&user_id).register_as(conn, user_id).await
    }

    pub async fn unregister(&self, conn: Arc<WebConn>) -> Result<(), HubError> {
        self.hub_for_user(&conn.user_id())
            .unregister(conn.id())
            .await
    }

    /// Route an event: one hub for a targeted user, every hub otherwise
    pub async fn broadcast(&self, event: Arc<Event>) -> Result<(), HubError> {
        match event.target_user() {
            Some(user_id) => self.hub_for_user(user_id).broadcast(event.clone()).await,
            None => {
                for hub in &self.hubs {
                    hub.broadcast(event.clone()).await?;
                }
                Ok(())
            }
        }
    }

    /// Clear cached sessions of every local connection of a user
    pub async fn invalidate_user(&self, user_id: &str) -> Result<(), HubError> {
        self.hub_for_user(user_id)
            .invalidate_user(Arc::from(user_id))
            .await
    }

    pub async fn send_direct(
        &self,
        conn: Arc<WebConn>,
        message: OutboundMessage,
    ) -> Result<(), HubError> {
        let user_id = conn.user_id();
        self.hub_for_user(&user_id).send_direct(conn, message).await
    }

    pub async fn connection_count(&self) -> usize {
        join_all(self.hubs.iter().map(|hub| hub.connection_count()))
            .await
            .into_iter()
            .sum()
    }

    /// Stop every hub; returns once all of them closed their connections
    pub async fn stop(&self) {
        join_all(self.hubs.iter().map(|hub| hub.stop())).await;
        info!("All hubs stopped");
    }
}
