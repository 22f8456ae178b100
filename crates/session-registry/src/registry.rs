//! Per-tab tree of CDP sessions: the tab itself is the implicit root, frames and workers
//! hang off it as children keyed by their remote-assigned session id.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, info};

use soulbrowser_core_types::{now_ms, TabId};

use crate::metrics;
use crate::model::{ChildSession, SessionType, TabSessions, TabSummary, TargetInfo};

struct TabRecord {
    root_session_id: String,
    children: HashMap<String, ChildSession>,
    last_activity: i64,
}

impl TabRecord {
    fn new(tab_id: TabId) -> Self {
        Self {
            root_session_id: tab_id.to_string(),
            children: HashMap::new(),
            last_activity: now_ms(),
        }
    }

    fn sorted_children(&self) -> Vec<ChildSession> {
        let mut children: Vec<ChildSession> = self.children.values().cloned().collect();
        children.sort_by(|a, b| {
            a.attached_at
                .cmp(&b.attached_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        children
    }
}

/// Concurrent registry of tab session trees.
#[derive(Default)]
pub struct SessionRegistry {
    tabs: DashMap<TabId, TabRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the tab record if absent and bump its activity stamp.
    pub fn touch(&self, tab_id: TabId) {
        self.tabs
            .entry(tab_id)
            .or_insert_with(|| TabRecord::new(tab_id))
            .last_activity = now_ms();
    }

    /// Insert or overwrite a child session under `tab_id`.
    pub fn register_child(&self, tab_id: TabId, session_id: &str, target: &TargetInfo) -> ChildSession {
        let now = now_ms();
        let child = ChildSession {
            session_id: session_id.to_string(),
            target_id: target.target_id.clone(),
            session_type: target.target_type.parse().unwrap_or(SessionType::Other),
            url: target.url.clone(),
            parent_tab_id: tab_id,
            attached_at: now,
        };
        {
            let mut record = self
                .tabs
                .entry(tab_id)
                .or_insert_with(|| TabRecord::new(tab_id));
            record.children.insert(session_id.to_string(), child.clone());
            record.last_activity = now;
        }
        metrics::set_child_sessions(self.child_count());
        info!(
            target: "session-registry",
            %tab_id,
            session_id,
            kind = %child.session_type,
            url = %child.url,
            "child session attached"
        );
        child
    }

    /// Remove a child session. Detaching something already gone is not an error.
    pub fn unregister_child(&self, tab_id: TabId, session_id: &str) -> Option<ChildSession> {
        let removed = self.tabs.get_mut(&tab_id).and_then(|mut record| {
            let removed = record.children.remove(session_id);
            if removed.is_some() {
                record.last_activity = now_ms();
            }
            removed
        });
        match &removed {
            Some(_) => {
                metrics::set_child_sessions(self.child_count());
                info!(target: "session-registry", %tab_id, session_id, "child session detached");
            }
            None => {
                debug!(target: "session-registry", %tab_id, session_id, "detach for unknown session ignored")
            }
        }
        removed
    }

    pub fn get_child(&self, tab_id: TabId, session_id: &str) -> Option<ChildSession> {
        self.tabs
            .get(&tab_id)
            .and_then(|record| record.children.get(session_id).cloned())
    }

    pub fn children(&self, tab_id: TabId) -> Vec<ChildSession> {
        self.tabs
            .get(&tab_id)
            .map(|record| record.sorted_children())
            .unwrap_or_default()
    }

    /// First child (in attach order) whose url contains `pattern`.
    pub fn find_by_url(&self, tab_id: TabId, pattern: &str) -> Option<ChildSession> {
        self.children(tab_id)
            .into_iter()
            .find(|child| child.url.contains(pattern))
    }

    pub fn find_by_type(&self, tab_id: TabId, session_type: &SessionType) -> Vec<ChildSession> {
        self.children(tab_id)
            .into_iter()
            .filter(|child| &child.session_type == session_type)
            .collect()
    }

    pub fn tab(&self, tab_id: TabId) -> Option<TabSessions> {
        self.tabs.get(&tab_id).map(|record| TabSessions {
            tab_id,
            root_session_id: record.root_session_id.clone(),
            children: record.sorted_children(),
            last_activity: record.last_activity,
        })
    }

    pub fn all(&self) -> Vec<TabSessions> {
        let mut tabs: Vec<TabSessions> = self
            .tabs
            .iter()
            .map(|entry| TabSessions {
                tab_id: *entry.key(),
                root_session_id: entry.root_session_id.clone(),
                children: entry.sorted_children(),
                last_activity: entry.last_activity,
            })
            .collect();
        tabs.sort_by_key(|tab| tab.tab_id);
        tabs
    }

    pub fn get_summary(&self) -> Vec<TabSummary> {
        let mut summary: Vec<TabSummary> = self
            .tabs
            .iter()
            .map(|entry| TabSummary {
                tab_id: *entry.key(),
                root_session_id: entry.root_session_id.clone(),
                child_count: entry.children.len(),
                last_activity: entry.last_activity,
            })
            .collect();
        summary.sort_by_key(|tab| tab.tab_id);
        summary
    }

    /// Drop a closed tab and everything attached under it.
    pub fn clear_tab(&self, tab_id: TabId) -> usize {
        let dropped = self
            .tabs
            .remove(&tab_id)
            .map(|(_, record)| record.children.len());
        match dropped {
            Some(children) => {
                metrics::set_child_sessions(self.child_count());
                info!(target: "session-registry", %tab_id, children, "tab sessions cleared");
                children
            }
            None => 0,
        }
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn child_count(&self) -> usize {
        self.tabs.iter().map(|entry| entry.children.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, kind: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: id.into(),
            target_type: kind.into(),
            url: url.into(),
        }
    }

    #[test]
    fn attach_detach_and_lookup() {
        let registry = SessionRegistry::new();
        let tab = TabId(7);
        registry.register_child(tab, "S1", &target("T1", "iframe", "https://ads.example/frame"));
        registry.register_child(tab, "S2", &target("T2", "worker", "https://app.example/w.js"));

        assert_eq!(registry.find_by_url(tab, "ads.").unwrap().session_id, "S1");
        assert!(registry.find_by_url(tab, "missing").is_none());
        assert_eq!(registry.find_by_type(tab, &SessionType::Worker).len(), 1);
        assert!(registry.find_by_type(TabId(8), &SessionType::Worker).is_empty());

        assert!(registry.unregister_child(tab, "S1").is_some());
        assert!(registry.unregister_child(tab, "S1").is_none());
        assert!(registry.unregister_child(TabId(99), "S1").is_none());
        assert_eq!(registry.children(tab).len(), 1);
    }

    #[test]
    fn reattach_with_same_session_id_overwrites() {
        let registry = SessionRegistry::new();
        let tab = TabId(1);
        registry.register_child(tab, "S", &target("T-old", "iframe", "https://a"));
        registry.register_child(tab, "S", &target("T-new", "iframe", "https://b"));
        let children = registry.children(tab);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].target_id, "T-new");
    }

    #[test]
    fn summary_and_root_id() {
        let registry = SessionRegistry::new();
        registry.touch(TabId(2));
        registry.register_child(TabId(5), "S", &target("T", "iframe", "https://a"));
        let summary = registry.get_summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].tab_id, TabId(2));
        assert_eq!(summary[0].child_count, 0);
        assert_eq!(summary[1].root_session_id, "5");
        assert_eq!(summary[1].child_count, 1);
    }

    #[test]
    fn clear_tab_drops_the_tree() {
        let registry = SessionRegistry::new();
        registry.register_child(TabId(3), "A", &target("T", "iframe", "https://a"));
        registry.register_child(TabId(3), "B", &target("U", "worker", "https://b"));
        assert_eq!(registry.clear_tab(TabId(3)), 2);
        assert!(registry.tab(TabId(3)).is_none());
        assert_eq!(registry.clear_tab(TabId(3)), 0);
    }
}
