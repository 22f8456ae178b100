use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use soulbrowser_core_types::TabId;

/// Kind of target a CDP session is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Page,
    Iframe,
    Worker,
    ServiceWorker,
    SharedWorker,
    Other,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Page => "page",
            SessionType::Iframe => "iframe",
            SessionType::Worker => "worker",
            SessionType::ServiceWorker => "service_worker",
            SessionType::SharedWorker => "shared_worker",
            SessionType::Other => "other",
        }
    }
}

impl FromStr for SessionType {
    type Err = std::convert::Infallible;

    /// Unknown CDP target types map to `Other`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "page" | "tab" => SessionType::Page,
            "iframe" => SessionType::Iframe,
            "worker" => SessionType::Worker,
            "service_worker" => SessionType::ServiceWorker,
            "shared_worker" => SessionType::SharedWorker,
            _ => SessionType::Other,
        })
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `targetInfo` as carried by `Target.attachedToTarget`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSession {
    pub session_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub url: String,
    pub parent_tab_id: TabId,
    pub attached_at: i64,
}

/// A tab and every child session currently attached under it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSessions {
    pub tab_id: TabId,
    pub root_session_id: String,
    pub children: Vec<ChildSession>,
    pub last_activity: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSummary {
    pub tab_id: TabId,
    pub root_session_id: String,
    pub child_count: usize,
    pub last_activity: i64,
}
