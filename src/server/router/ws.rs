use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use soulbrowser_core_types::{now_ms, ClientId, CommandId, TabId};
use soulbrowser_registry::{ClientLink, ClientMeta};
use soulbrowser_scheduler::CommandResponse;
use soulbrowser_session_registry::CdpEvent;

use crate::control::{ChannelLink, ControlPlane};
use crate::server::ServeState;

pub(crate) fn router() -> Router<ServeState> {
    Router::new().route("/control/ws", get(websocket_handler))
}

#[derive(Deserialize)]
struct AgentFrame {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterFrame {
    #[serde(default, alias = "extensionId")]
    client_id: Option<String>,
    #[serde(default)]
    tab_id: Option<i64>,
    #[serde(default)]
    client_type: Option<String>,
}

async fn websocket_handler(
    State(state): State<ServeState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(state.plane, socket).await;
    })
}

async fn handle_socket(plane: Arc<ControlPlane>, socket: WebSocket) {
    let (link, mut outbound) = ChannelLink::new();
    let connection_id = link.connection_id().clone();
    let closed = link.closed();
    let (mut sender, mut receiver) = socket.split();
    let mut registered = false;
    debug!(target: "ws", connection = %connection_id, "agent socket opened");

    loop {
        let reply = tokio::select! {
            _ = closed.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => Some(frame),
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&plane, &link, &mut registered, &text)
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sender.send(Message::Pong(payload)).await;
                    None
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(target: "ws", ?frame, "WebSocket closed by agent");
                    break;
                }
                Some(Ok(Message::Binary(_))) | Some(Ok(Message::Pong(_))) => None,
                Some(Err(err)) => {
                    error!(target: "ws", ?err, "WebSocket error");
                    break;
                }
                None => break,
            },
        };
        if let Some(reply) = reply {
            if sender.send(Message::Text(reply.to_string())).await.is_err() {
                break;
            }
        }
    }

    if registered {
        plane.detach_agent(&connection_id);
    }
    link.disconnect("socket closed").await;
    debug!(target: "ws", connection = %connection_id, "agent socket closed");
}

/// Apply one agent frame; returns the frame to write back, if any.
fn handle_text(
    plane: &ControlPlane,
    link: &Arc<ChannelLink>,
    registered: &mut bool,
    text: &str,
) -> Option<Value> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: "ws", %err, "Failed to parse agent websocket frame");
            return None;
        }
    };
    let kind = match serde_json::from_value::<AgentFrame>(frame.clone()) {
        Ok(header) => header.kind,
        Err(_) => {
            warn!(target: "ws", "agent frame without type");
            return None;
        }
    };
    let connection_id = link.connection_id();
    // Any frame from a registered agent counts as a sign of life.
    if *registered && kind != "heartbeat" {
        plane.heartbeat(connection_id);
    }

    match kind.as_str() {
        "register" => {
            let register: RegisterFrame = match serde_json::from_value(frame) {
                Ok(register) => register,
                Err(err) => {
                    warn!(target: "ws", %err, "invalid register frame");
                    return Some(json!({"type": "error", "error": err.to_string()}));
                }
            };
            let meta = ClientMeta {
                client_id: register.client_id.map(ClientId),
                tab_id: register.tab_id.map(TabId),
                client_type: register
                    .client_type
                    .unwrap_or_else(|| "extension".to_string()),
            };
            let client = plane.attach_agent(Arc::clone(link) as Arc<dyn ClientLink>, meta);
            *registered = true;
            info!(
                target: "ws",
                connection = %connection_id,
                tab_id = ?client.tab_id,
                "agent registered"
            );
            Some(json!({
                "type": "registered",
                "connectionId": connection_id,
            }))
        }
        "heartbeat" => {
            if !plane.heartbeat(connection_id) {
                debug!(target: "ws", connection = %connection_id, "heartbeat before register");
            }
            Some(json!({"type": "heartbeat_ack", "at": now_ms()}))
        }
        "ack" => {
            match frame.get("ackId").and_then(Value::as_str) {
                Some(ack_id) => {
                    let data = frame.get("data").cloned().unwrap_or(Value::Null);
                    link.resolve_ack(ack_id, data);
                }
                None => warn!(target: "ws", "ack frame without ackId"),
            }
            None
        }
        "command_response" => {
            let response = frame
                .get("commandId")
                .and_then(Value::as_str)
                .map(|command_id| CommandId(command_id.to_string()))
                .and_then(|command_id| CommandResponse::from_ack(&command_id, &frame));
            match response {
                Some(response) => {
                    plane.handle_response(response);
                }
                None => warn!(target: "ws", "malformed command_response frame"),
            }
            None
        }
        "cdp_event" => {
            match serde_json::from_value::<CdpEvent>(frame) {
                Ok(event) => {
                    plane.ingest_cdp(event);
                }
                Err(err) => warn!(target: "ws", %err, "invalid cdp_event frame"),
            }
            None
        }
        "ping" => Some(json!({"type": "pong", "at": now_ms()})),
        other => {
            debug!(target: "ws", kind = other, "Unhandled agent message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use soulbrowser_envelope::SigningKey;

    use super::*;
    use crate::config::ControlConfig;

    #[tokio::test(start_paused = true)]
    async fn agent_traffic_without_heartbeats_keeps_the_client_fresh() {
        let plane = ControlPlane::new(ControlConfig::default(), SigningKey::generate().unwrap());
        let (link, _outbound) = ChannelLink::new();
        let mut registered = false;
        let reply = handle_text(&plane, &link, &mut registered, r#"{"type":"register","tabId":3}"#);
        assert_eq!(reply.unwrap()["type"], "registered");

        let event = json!({
            "type": "cdp_event",
            "tabId": 3,
            "method": "Page.frameNavigated",
            "params": {},
        })
        .to_string();
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert!(handle_text(&plane, &link, &mut registered, &event).is_none());
        }
        assert_eq!(plane.clients().len(), 1);
        assert_eq!(plane.heartbeat_status().stale_clients, 0);

        tokio::time::advance(Duration::from_secs(91)).await;
        assert_eq!(plane.heartbeat_status().stale_clients, 1);
    }
}
