use std::sync::Arc;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use soulbrowser_core_types::BusError;

use crate::control::{CallbackRejection, ControlPlane};
use crate::metrics;

mod control;
mod sessions;
mod ws;

pub(crate) use control::router as control_routes;
pub(crate) use sessions::router as session_routes;
pub(crate) use ws::router as ws_routes;

use super::state::ServeState;

/// The full HTTP surface bound to `plane`.
pub fn build_router(plane: Arc<ControlPlane>) -> Router {
    build_control_router().with_state(ServeState::new(plane))
}

pub(crate) fn build_control_router() -> Router<ServeState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .merge(control_routes())
        .merge(session_routes())
        .merge(ws_routes())
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health_handler(State(state): State<ServeState>) -> Json<Value> {
    let heartbeat = state.plane.heartbeat_status();
    Json(json!({
        "status": "ok",
        "clients": heartbeat.clients,
        "staleClients": heartbeat.stale_clients,
        "heartbeatRunning": heartbeat.running,
        "pendingCommands": state.plane.router().pending_count(),
        "ledgerEntries": state.plane.ledger().len(),
    }))
}

async fn metrics_handler() -> Response {
    metrics::register_metrics();
    metrics::render(metrics::global_registry())
}

async fn jwks_handler(State(state): State<ServeState>) -> impl IntoResponse {
    Json(state.plane.jwks())
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn bus_error(err: BusError) -> ApiError {
    let status = match &err {
        BusError::Malformed(_)
        | BusError::UnsupportedAlg(_)
        | BusError::MissingKid
        | BusError::Expired { .. }
        | BusError::UnknownKid(_)
        | BusError::InvalidSignature => StatusCode::BAD_REQUEST,
        BusError::NoClient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BusError::CommandTimeout { .. }
        | BusError::PluginTimeoutAck { .. }
        | BusError::PluginTimeoutExec { .. } => StatusCode::GATEWAY_TIMEOUT,
        BusError::ClientDisconnected { .. } | BusError::Remote(_) => StatusCode::BAD_GATEWAY,
        BusError::TaskLocked { .. } => StatusCode::CONFLICT,
        BusError::JwksUnavailable(_) | BusError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({
            "ok": false,
            "code": err.code(),
            "error": err.to_string(),
        })),
    )
}

pub(crate) fn callback_error(rejection: CallbackRejection) -> ApiError {
    let status = match rejection {
        CallbackRejection::UnknownCommand => StatusCode::NOT_FOUND,
        CallbackRejection::Expired => StatusCode::GONE,
        CallbackRejection::InvalidToken => StatusCode::UNAUTHORIZED,
    };
    (
        status,
        Json(json!({
            "ok": false,
            "code": rejection.code(),
            "error": rejection.to_string(),
        })),
    )
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "ok": false,
            "code": "MALFORMED",
            "error": message.into(),
        })),
    )
}

pub(crate) fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "ok": false,
            "error": message,
        })),
    )
}
