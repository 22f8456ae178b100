use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use soulbrowser_core_types::TabId;
use soulbrowser_session_registry::{CdpEvent, EventFilter, SessionChange, SessionType};

use crate::server::ServeState;

use super::{bad_request, not_found, ApiError};

pub(crate) fn router() -> Router<ServeState> {
    Router::new()
        .route("/control/sessions", get(sessions_handler))
        .route(
            "/control/events",
            get(recent_events_handler).post(ingest_event_handler),
        )
        .route("/control/tabs/:tab_id/closed", post(tab_closed_handler))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    tab_id: Option<i64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "type")]
    session_type: Option<String>,
}

fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true") | Some("yes"))
}

async fn sessions_handler(
    State(state): State<ServeState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, ApiError> {
    let registry = state.plane.sessions().registry();
    if flag(query.summary.as_deref()) {
        return Ok(Json(json!({ "ok": true, "summary": registry.get_summary() })));
    }
    let Some(tab_id) = query.tab_id.map(TabId) else {
        if query.url.is_some() || query.session_type.is_some() {
            return Err(bad_request("tabId is required with url or type"));
        }
        return Ok(Json(json!({ "ok": true, "tabs": registry.all() })));
    };
    if let Some(pattern) = query.url.as_deref() {
        let session = registry.find_by_url(tab_id, pattern);
        return Ok(Json(json!({ "ok": true, "tabId": tab_id, "session": session })));
    }
    if let Some(raw) = query.session_type.as_deref() {
        let session_type = raw.parse::<SessionType>().unwrap_or(SessionType::Other);
        return Ok(Json(json!({
            "ok": true,
            "tabId": tab_id,
            "sessions": registry.find_by_type(tab_id, &session_type),
        })));
    }
    match registry.tab(tab_id) {
        Some(tab) => Ok(Json(json!({ "ok": true, "tab": tab }))),
        None => Err(not_found("tab not tracked")),
    }
}

async fn ingest_event_handler(
    State(state): State<ServeState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !body.is_object() {
        return Err(bad_request("Invalid body"));
    }
    let event: CdpEvent =
        serde_json::from_value(body).map_err(|err| bad_request(err.to_string()))?;
    let received = json!({
        "tabId": event.tab_id,
        "sessionId": event.session_id,
        "method": event.method,
    });
    let change = match state.plane.ingest_cdp(event) {
        SessionChange::Attached(_) => "attached",
        SessionChange::Detached { .. } => "detached",
        SessionChange::Unchanged => "unchanged",
    };
    Ok(Json(json!({ "ok": true, "received": received, "change": change })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventQuery {
    #[serde(default)]
    tab_id: Option<i64>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    method: Option<String>,
}

async fn recent_events_handler(
    State(state): State<ServeState>,
    Query(query): Query<EventQuery>,
) -> Json<Value> {
    let filter = EventFilter {
        tab_id: query.tab_id.map(TabId),
        session_id: query.session_id,
        method: query.method,
    };
    let events = state.plane.sessions().recent(&filter);
    Json(json!({ "ok": true, "count": events.len(), "events": events }))
}

async fn tab_closed_handler(
    State(state): State<ServeState>,
    Path(tab_id): Path<i64>,
) -> Json<Value> {
    let removed = state.plane.close_tab(TabId(tab_id));
    Json(json!({ "ok": true, "tabId": tab_id, "removedSessions": removed }))
}
