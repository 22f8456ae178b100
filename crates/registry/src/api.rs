use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use soulbrowser_core_types::ConnectionId;

use crate::errors::LinkError;

/// Outbound half of one agent connection.
#[async_trait]
pub trait ClientLink: Send + Sync {
    fn connection_id(&self) -> &ConnectionId;

    async fn send(&self, frame: Value) -> Result<(), LinkError>;

    /// Send a frame and wait for the agent's `ack` carrying the same ack id.
    async fn send_with_ack(&self, frame: Value, timeout: Duration) -> Result<Value, LinkError>;

    /// Force the underlying connection closed. Unregistration follows from the transport.
    async fn disconnect(&self, reason: &str);
}
