use std::sync::Arc;

use tokio::time::Instant;

use soulbrowser_core_types::{ClientId, ConnectionId, TabId};

use crate::api::ClientLink;

/// What an agent tells us about itself when it registers.
#[derive(Clone, Debug, Default)]
pub struct ClientMeta {
    pub client_id: Option<ClientId>,
    pub tab_id: Option<TabId>,
    pub client_type: String,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub commands_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
}

/// Registry record for one connected agent.
#[derive(Clone)]
pub struct BrowserClient {
    pub connection_id: ConnectionId,
    pub client_id: Option<ClientId>,
    pub tab_id: Option<TabId>,
    pub client_type: String,
    pub connected_at: Instant,
    pub connected_at_ms: i64,
    pub last_heartbeat: Instant,
    pub stats: ConnectionStats,
    pub(crate) seq: u64,
    pub(crate) link: Arc<dyn ClientLink>,
}

impl BrowserClient {
    pub fn link(&self) -> Arc<dyn ClientLink> {
        Arc::clone(&self.link)
    }

    pub fn heartbeat_age_ms(&self) -> u64 {
        self.last_heartbeat.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self, stale_after_ms: u64) -> ClientSnapshot {
        let heartbeat_age_ms = self.heartbeat_age_ms();
        ClientSnapshot {
            connection_id: self.connection_id.clone(),
            client_id: self.client_id.clone(),
            tab_id: self.tab_id,
            client_type: self.client_type.clone(),
            connected_at_ms: self.connected_at_ms,
            connected_for_ms: self.connected_at.elapsed().as_millis() as u64,
            heartbeat_age_ms,
            stale: heartbeat_age_ms > stale_after_ms,
            stats: self.stats,
        }
    }
}

impl std::fmt::Debug for BrowserClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserClient")
            .field("connection_id", &self.connection_id)
            .field("client_id", &self.client_id)
            .field("tab_id", &self.tab_id)
            .field("client_type", &self.client_type)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Serializable view used by listings.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
#[derive(Clone, Debug)]
pub struct ClientSnapshot {
    pub connection_id: ConnectionId,
    pub client_id: Option<ClientId>,
    pub tab_id: Option<TabId>,
    pub client_type: String,
    pub connected_at_ms: i64,
    pub connected_for_ms: u64,
    pub heartbeat_age_ms: u64,
    pub stale: bool,
    pub stats: ConnectionStats,
}

/// Published whenever the set of connected agents changes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    Connected {
        connection_id: ConnectionId,
        tab_id: Option<TabId>,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
}
