use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use soulbrowser_core_types::{now_ms, TabId};

use crate::metrics;
use crate::model::{ChildSession, TargetInfo};
use crate::registry::SessionRegistry;

pub const EVENT_RING_CAPACITY: usize = 500;
pub const EVENT_QUERY_LIMIT: usize = 100;

/// A CDP event forwarded by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpEvent {
    pub tab_id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub received_at: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub tab_id: Option<TabId>,
    pub session_id: Option<String>,
    /// Substring match on the method name.
    pub method: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &CdpEvent) -> bool {
        self.tab_id.map_or(true, |tab| event.tab_id == tab)
            && self
                .session_id
                .as_ref()
                .map_or(true, |session| event.session_id.as_ref() == Some(session))
            && self
                .method
                .as_ref()
                .map_or(true, |method| event.method.contains(method.as_str()))
    }
}

/// Bounded ring of recently received events, oldest evicted first.
pub struct EventRing {
    events: Mutex<VecDeque<CdpEvent>>,
    capacity: usize,
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new(EVENT_RING_CAPACITY)
    }
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: CdpEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Latest matching events in arrival order, at most [`EVENT_QUERY_LIMIT`].
    pub fn query(&self, filter: &EventFilter) -> Vec<CdpEvent> {
        let events = self.events.lock();
        let mut hits: Vec<CdpEvent> = events
            .iter()
            .rev()
            .filter(|event| filter.matches(event))
            .take(EVENT_QUERY_LIMIT)
            .cloned()
            .collect();
        hits.reverse();
        hits
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// What an ingested event did to the session tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionChange {
    Attached(ChildSession),
    Detached { tab_id: TabId, session_id: String },
    Unchanged,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachedParams {
    session_id: String,
    target_info: TargetInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachedParams {
    session_id: String,
}

/// Applies `Target.*` notifications to the registry and records every event in the ring.
pub struct CdpEventIngest {
    registry: Arc<SessionRegistry>,
    ring: EventRing,
}

impl CdpEventIngest {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            ring: EventRing::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ingest(&self, mut event: CdpEvent) -> SessionChange {
        if event.received_at == 0 {
            event.received_at = now_ms();
        }
        metrics::record_event(&event.method);
        let change = self.apply(&event);
        self.ring.push(event);
        change
    }

    fn apply(&self, event: &CdpEvent) -> SessionChange {
        match event.method.as_str() {
            "Target.attachedToTarget" => {
                match serde_json::from_value::<AttachedParams>(event.params.clone()) {
                    Ok(params) => SessionChange::Attached(self.registry.register_child(
                        event.tab_id,
                        &params.session_id,
                        &params.target_info,
                    )),
                    Err(err) => {
                        warn!(target: "session-registry", tab_id = %event.tab_id, ?err, "malformed attachedToTarget params");
                        SessionChange::Unchanged
                    }
                }
            }
            "Target.detachedFromTarget" => {
                match serde_json::from_value::<DetachedParams>(event.params.clone()) {
                    Ok(params) => {
                        self.registry
                            .unregister_child(event.tab_id, &params.session_id);
                        SessionChange::Detached {
                            tab_id: event.tab_id,
                            session_id: params.session_id,
                        }
                    }
                    Err(err) => {
                        warn!(target: "session-registry", tab_id = %event.tab_id, ?err, "malformed detachedFromTarget params");
                        SessionChange::Unchanged
                    }
                }
            }
            other => {
                debug!(target: "session-registry", tab_id = %event.tab_id, method = other, "cdp event recorded");
                self.registry.touch(event.tab_id);
                SessionChange::Unchanged
            }
        }
    }

    pub fn recent(&self, filter: &EventFilter) -> Vec<CdpEvent> {
        self.ring.query(filter)
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(tab: i64, method: &str, params: Value) -> CdpEvent {
        CdpEvent {
            tab_id: TabId(tab),
            session_id: None,
            method: method.into(),
            params,
            received_at: 0,
        }
    }

    #[test]
    fn ring_evicts_oldest_and_caps_queries() {
        let ring = EventRing::new(EVENT_RING_CAPACITY);
        for i in 0..(EVENT_RING_CAPACITY + 20) {
            ring.push(event(1, &format!("Network.event{i}"), Value::Null));
        }
        assert_eq!(ring.len(), EVENT_RING_CAPACITY);
        let hits = ring.query(&EventFilter::default());
        assert_eq!(hits.len(), EVENT_QUERY_LIMIT);
        assert_eq!(
            hits.last().unwrap().method,
            format!("Network.event{}", EVENT_RING_CAPACITY + 19)
        );
    }

    #[test]
    fn filter_by_method_substring_and_tab() {
        let ring = EventRing::default();
        ring.push(event(1, "Page.frameNavigated", Value::Null));
        ring.push(event(2, "Page.loadEventFired", Value::Null));
        ring.push(event(1, "Runtime.consoleAPICalled", Value::Null));
        let filter = EventFilter {
            tab_id: Some(TabId(1)),
            method: Some("Page.".into()),
            ..Default::default()
        };
        let hits = ring.query(&filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, "Page.frameNavigated");
    }

    #[test]
    fn target_events_drive_the_registry() {
        let ingest = CdpEventIngest::new(Arc::new(SessionRegistry::new()));
        let change = ingest.ingest(event(
            4,
            "Target.attachedToTarget",
            json!({
                "sessionId": "S-9",
                "targetInfo": {"targetId": "T-9", "type": "iframe", "url": "https://x.example"},
                "waitingForDebugger": false
            }),
        ));
        assert!(matches!(change, SessionChange::Attached(ref child) if child.session_id == "S-9"));
        assert_eq!(ingest.registry().children(TabId(4)).len(), 1);

        ingest.ingest(event(4, "Target.detachedFromTarget", json!({"sessionId": "S-9"})));
        assert!(ingest.registry().children(TabId(4)).is_empty());

        let change = ingest.ingest(event(4, "Target.attachedToTarget", json!({"bogus": true})));
        assert_eq!(change, SessionChange::Unchanged);
        assert_eq!(ingest.buffered(), 3);
    }
}
