//! Interfaces to collaborators outside the region core.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Outbound region-to-region requests.
#[async_trait]
pub trait RemoteRegionTransport: Send + Sync {
    /// POST `payload` as JSON to a capability URL and parse the JSON reply.
    async fn post_json(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
}

/// Per-presence event stream to the connected client. Fire-and-forget;
/// implementations must preserve call order.
pub trait ClientEventChannel: Send + Sync {
    fn queue_event(&self, event_type: &str, payload: serde_json::Value);
}

/// Channel that drops everything. Used for presences with no client.
#[derive(Debug, Default)]
pub struct NullChannel;

impl ClientEventChannel for NullChannel {
    fn queue_event(&self, _event_type: &str, _payload: serde_json::Value) {}
}

/// Opens the client side of an agent arriving from a neighbor.
pub trait ClientConnector: Send + Sync {
    /// Returns `None` to refuse the agent.
    fn connect(&self, agent_id: Uuid, session_id: Uuid) -> Option<Arc<dyn ClientEventChannel>>;
}
