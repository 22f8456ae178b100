use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use soulbrowser_core_types::{now_ms, ClientId, ConnectionId, TabId};
use soulbrowser_event_bus::{EventBus, InMemoryBus};

use crate::{
    api::ClientLink,
    metrics,
    model::{BrowserClient, ClientEvent, ClientMeta},
};

/// What target resolution does when an explicit tab id matches nobody.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TargetFallback {
    /// Route to the earliest registered client.
    #[default]
    FirstAvailable,
    /// Report no client.
    Strict,
}

impl FromStr for TargetFallback {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first_available" | "first-available" | "first" => Ok(Self::FirstAvailable),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown target fallback '{other}'")),
        }
    }
}

/// Connected agents keyed by connection id.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<RwLock<BrowserClient>>>,
    fallback: TargetFallback,
    seq: AtomicU64,
    events: Arc<InMemoryBus<ClientEvent>>,
}

impl ClientRegistry {
    pub fn new(fallback: TargetFallback) -> Self {
        Self {
            clients: DashMap::new(),
            fallback,
            seq: AtomicU64::new(0),
            events: InMemoryBus::new(64),
        }
    }

    pub fn fallback(&self) -> TargetFallback {
        self.fallback
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Insert or overwrite the record for `link`'s connection.
    pub fn register(&self, link: Arc<dyn ClientLink>, meta: ClientMeta) -> BrowserClient {
        let connection_id = link.connection_id().clone();
        let now = Instant::now();
        let client = BrowserClient {
            connection_id: connection_id.clone(),
            client_id: meta.client_id,
            tab_id: meta.tab_id,
            client_type: meta.client_type,
            connected_at: now,
            connected_at_ms: now_ms(),
            last_heartbeat: now,
            stats: Default::default(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            link,
        };
        self.clients
            .insert(connection_id.clone(), Arc::new(RwLock::new(client.clone())));
        metrics::set_connected_clients(self.clients.len());
        info!(
            target: "client-registry",
            connection = %connection_id,
            tab_id = ?client.tab_id,
            client_type = %client.client_type,
            "client registered"
        );
        self.events.emit(ClientEvent::Connected {
            connection_id,
            tab_id: client.tab_id,
        });
        client
    }

    /// Remove a client. Safe to call more than once.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<BrowserClient> {
        let (_, entry) = self.clients.remove(connection_id)?;
        metrics::set_connected_clients(self.clients.len());
        info!(target: "client-registry", connection = %connection_id, "client unregistered");
        self.events.emit(ClientEvent::Disconnected {
            connection_id: connection_id.clone(),
        });
        let client = entry.read().clone();
        Some(client)
    }

    /// Refresh `last_heartbeat`. Returns false for unknown connections.
    pub fn heartbeat(&self, connection_id: &ConnectionId) -> bool {
        match self.clients.get(connection_id) {
            Some(entry) => {
                entry.write().last_heartbeat = Instant::now();
                true
            }
            None => {
                debug!(target: "client-registry", connection = %connection_id, "heartbeat from unknown connection");
                false
            }
        }
    }

    pub fn record_sent(&self, connection_id: &ConnectionId) {
        self.with_client(connection_id, |client| client.stats.commands_sent += 1);
    }

    pub fn record_response(&self, connection_id: &ConnectionId, ok: bool) {
        self.with_client(connection_id, |client| {
            client.stats.responses_received += 1;
            if !ok {
                client.stats.errors += 1;
            }
        });
    }

    pub fn record_error(&self, connection_id: &ConnectionId) {
        self.with_client(connection_id, |client| client.stats.errors += 1);
    }

    fn with_client(&self, connection_id: &ConnectionId, f: impl FnOnce(&mut BrowserClient)) {
        if let Some(entry) = self.clients.get(connection_id) {
            f(&mut entry.write());
        }
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<BrowserClient> {
        self.clients
            .get(connection_id)
            .map(|entry| entry.read().clone())
    }

    pub fn find_by_client_id(&self, client_id: &ClientId) -> Option<BrowserClient> {
        self.sorted()
            .into_iter()
            .find(|client| client.client_id.as_ref() == Some(client_id))
    }

    /// Pick the connection a command for `tab_id` should go to.
    pub fn resolve_target(&self, tab_id: Option<TabId>) -> Option<BrowserClient> {
        let clients = self.sorted();
        if let Some(tab_id) = tab_id {
            if let Some(client) = clients.iter().find(|client| client.tab_id == Some(tab_id)) {
                return Some(client.clone());
            }
            if self.fallback == TargetFallback::Strict {
                debug!(target: "client-registry", %tab_id, "no client for tab, strict fallback");
                return None;
            }
        }
        let first = clients.into_iter().next();
        if let (Some(tab_id), Some(client)) = (tab_id, first.as_ref()) {
            debug!(
                target: "client-registry",
                %tab_id,
                connection = %client.connection_id,
                "no client for tab, falling back to first registered"
            );
        }
        first
    }

    /// Clients in registration order.
    pub fn list(&self) -> Vec<BrowserClient> {
        self.sorted()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn sorted(&self) -> Vec<BrowserClient> {
        let mut clients: Vec<BrowserClient> = self
            .clients
            .iter()
            .map(|entry| entry.value().read().clone())
            .collect();
        clients.sort_by_key(|client| client.seq);
        clients
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(TargetFallback::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingLink;

    fn meta(tab: Option<i64>) -> ClientMeta {
        ClientMeta {
            client_id: None,
            tab_id: tab.map(TabId),
            client_type: "extension".into(),
        }
    }

    #[test]
    fn resolve_on_empty_registry_is_none() {
        let registry = ClientRegistry::default();
        assert!(registry.resolve_target(None).is_none());

        let link = RecordingLink::new();
        registry.register(link.clone(), meta(Some(7)));
        assert!(registry.resolve_target(None).is_some());
        registry.unregister(link.connection_id());
        assert!(registry.resolve_target(None).is_none());
        assert!(registry.unregister(link.connection_id()).is_none());
    }

    #[test]
    fn tab_match_wins_over_registration_order() {
        let registry = ClientRegistry::default();
        let first = RecordingLink::new();
        let second = RecordingLink::new();
        registry.register(first.clone(), meta(Some(1)));
        registry.register(second.clone(), meta(Some(7)));

        let hit = registry.resolve_target(Some(TabId(7))).unwrap();
        assert_eq!(&hit.connection_id, second.connection_id());
        let fallback = registry.resolve_target(Some(TabId(99))).unwrap();
        assert_eq!(&fallback.connection_id, first.connection_id());
    }

    #[test]
    fn strict_fallback_refuses_unmatched_tab() {
        let registry = ClientRegistry::new(TargetFallback::Strict);
        registry.register(RecordingLink::new(), meta(Some(1)));
        assert!(registry.resolve_target(Some(TabId(2))).is_none());
        assert!(registry.resolve_target(Some(TabId(1))).is_some());
        assert!(registry.resolve_target(None).is_some());
    }

    #[test]
    fn heartbeat_for_unknown_connection_is_noop() {
        let registry = ClientRegistry::default();
        assert!(!registry.heartbeat(&ConnectionId("gone".into())));
    }

    #[test]
    fn stats_accumulate_per_connection() {
        let registry = ClientRegistry::default();
        let link = RecordingLink::new();
        registry.register(link.clone(), meta(None));
        registry.record_sent(link.connection_id());
        registry.record_response(link.connection_id(), false);
        let stats = registry.get(link.connection_id()).unwrap().stats;
        assert_eq!(stats.commands_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn fallback_parses_from_config_strings() {
        assert_eq!("strict".parse::<TargetFallback>(), Ok(TargetFallback::Strict));
        assert_eq!(
            "first_available".parse::<TargetFallback>(),
            Ok(TargetFallback::FirstAvailable)
        );
        assert!("random".parse::<TargetFallback>().is_err());
    }
}
