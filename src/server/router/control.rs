use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use soulbrowser_agent_link::CallbackPayload;
use soulbrowser_core_types::{now_ms, ClientId, CommandId};
use soulbrowser_event_bus::RecvError;

use crate::control::{BatchRequest, DispatchRequest, EnqueueRequest};
use crate::server::ServeState;

use super::{bad_request, bus_error, callback_error, not_found, ApiError};

pub(crate) fn router() -> Router<ServeState> {
    Router::new()
        .route("/control/enqueue", post(enqueue_handler))
        .route("/control/enqueue-batch", post(enqueue_batch_handler))
        .route("/control/dispatch", post(dispatch_handler))
        .route("/control/callback", post(callback_handler))
        .route("/control/commands/:command_id", get(command_handler))
        .route("/control/stream", get(stream_handler))
        .route("/control/clients", get(clients_handler))
        .route("/control/broadcast", post(broadcast_handler))
}

fn missing_client(body: &Value) -> bool {
    let client = body
        .get("clientId")
        .or_else(|| body.get("extensionId"))
        .and_then(Value::as_str);
    client.map_or(true, |client| client.trim().is_empty())
}

async fn enqueue_handler(
    State(state): State<ServeState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if missing_client(&body) {
        return Err(bad_request("Missing body.extensionId"));
    }
    if !body.get("op").map_or(false, Value::is_object) {
        return Err(bad_request("Missing body.op"));
    }
    let request: EnqueueRequest =
        serde_json::from_value(body).map_err(|err| bad_request(err.to_string()))?;
    let receipt = state.plane.enqueue(request).map_err(bus_error)?;
    Ok(Json(json!({
        "ok": true,
        "commandId": receipt.command_id,
        "traceId": receipt.trace_id,
        "issuedAt": receipt.issued_at,
        "ttlMs": receipt.ttl_ms,
        "delivered": receipt.delivered,
    })))
}

async fn enqueue_batch_handler(
    State(state): State<ServeState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if missing_client(&body) {
        return Err(bad_request("Missing body.extensionId"));
    }
    if !body
        .get("items")
        .and_then(Value::as_array)
        .map_or(false, |items| !items.is_empty())
    {
        return Err(bad_request("Missing body.items[]"));
    }
    let request: BatchRequest =
        serde_json::from_value(body).map_err(|err| bad_request(err.to_string()))?;
    let receipt = state.plane.enqueue_batch(request);
    Ok(Json(json!({
        "ok": true,
        "issuedAt": receipt.issued_at,
        "count": receipt.count,
        "results": receipt.results,
    })))
}

async fn dispatch_handler(
    State(state): State<ServeState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let request: DispatchRequest =
        serde_json::from_value(body).map_err(|err| bad_request(err.to_string()))?;
    if !request.op.is_object() {
        return Err(bad_request("Missing body.op"));
    }
    let outcome = state.plane.dispatch(request).await.map_err(bus_error)?;
    Ok(Json(json!({
        "ok": true,
        "commandId": outcome.command_id,
        "traceId": outcome.trace_id,
        "cached": outcome.cached,
        "result": outcome.result,
    })))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn callback_handler(
    State(state): State<ServeState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let payload: CallbackPayload =
        serde_json::from_value(body).map_err(|err| bad_request(err.to_string()))?;
    let record = state
        .plane
        .handle_callback(bearer(&headers), payload)
        .map_err(callback_error)?;
    Ok(Json(json!({
        "ok": true,
        "commandId": record.command_id,
        "state": record.state,
    })))
}

async fn command_handler(
    State(state): State<ServeState>,
    Path(command_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(record) = state.plane.command(&CommandId(command_id)) else {
        return Err(not_found("Unknown commandId"));
    };
    Ok(Json(json!({ "ok": true, "command": record })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    #[serde(alias = "extensionId")]
    client_id: String,
}

async fn stream_handler(
    State(state): State<ServeState>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.client_id.trim().is_empty() {
        return Err(bad_request("Missing clientId"));
    }
    let client_id = ClientId(query.client_id);
    let mut subscription = state.plane.subscribe_stream(&client_id);
    debug!(target: "control-bus", %client_id, "live stream opened");
    let ready = json!({
        "type": "ready",
        "clientId": client_id,
        "at": now_ms(),
    });
    let stream = stream! {
        yield Ok::<Event, Infallible>(Event::default().event("ready").data(ready.to_string()));
        loop {
            match subscription.recv().await {
                Ok(command) => match serde_json::to_string(&command) {
                    Ok(data) => yield Ok(Event::default().event("command").data(data)),
                    Err(err) => warn!(target: "control-bus", ?err, "failed to encode stream command"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "control-bus", skipped, "live stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn clients_handler(State(state): State<ServeState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "clients": state.plane.clients(),
        "heartbeat": state.plane.heartbeat_status(),
    }))
}

#[derive(Deserialize)]
struct BroadcastRequest {
    event: String,
    #[serde(default)]
    data: Value,
}

async fn broadcast_handler(
    State(state): State<ServeState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let request: BroadcastRequest =
        serde_json::from_value(body).map_err(|_| bad_request("Missing body.event"))?;
    let event = request.event.trim();
    if event.is_empty() {
        return Err(bad_request("Missing body.event"));
    }
    let delivered = state.plane.broadcast(event, request.data).await;
    Ok(Json(json!({ "ok": true, "event": event, "delivered": delivered })))
}
