use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use lazy_static::lazy_static;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    core::Collector, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use soulbrowser_registry::metrics as registry_metrics;
use soulbrowser_scheduler::metrics as scheduler_metrics;
use soulbrowser_session_registry::metrics as session_metrics;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

lazy_static! {
    static ref LEDGER_ENTRIES: IntGauge = IntGauge::new(
        "soul_control_ledger_entries",
        "Issued commands still held by the callback ledger",
    )
    .unwrap();
    static ref COMMANDS_ISSUED: IntCounter = IntCounter::new(
        "soul_control_commands_issued_total",
        "Signed command envelopes issued",
    )
    .unwrap();
    static ref CALLBACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("soul_control_callbacks_total", "Result callbacks by outcome"),
        &["outcome"],
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register control metric");
        }
    }
}

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();
        register(registry, LEDGER_ENTRIES.clone());
        register(registry, COMMANDS_ISSUED.clone());
        register(registry, CALLBACKS.clone());
        scheduler_metrics::register_metrics(registry);
        registry_metrics::register_metrics(registry);
        session_metrics::register_metrics(registry);
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

pub fn set_ledger_entries(count: usize) {
    LEDGER_ENTRIES.set(count as i64);
}

pub fn record_issued() {
    COMMANDS_ISSUED.inc();
}

pub fn record_callback(outcome: &str) {
    CALLBACKS.with_label_values(&[outcome]).inc();
}

/// Standalone listener serving only `/metrics`; port 0 disables it.
pub fn spawn_metrics_server(port: u16) -> Option<JoinHandle<()>> {
    if port == 0 {
        return None;
    }

    register_metrics();
    let registry = Arc::new(global_registry().clone());
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(%addr, "metrics server listening");
    Some(tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                    error!(?err, "metrics server exited with error");
                }
            }
            Err(err) => {
                error!(?err, "failed to bind metrics listener");
            }
        }
    }))
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    render(&registry)
}

/// Text exposition of everything registered on `registry`.
pub fn render(registry: &Registry) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response();
    }

    match String::from_utf8(buffer) {
        Ok(body) => match HeaderValue::from_str(encoder.format_type()) {
            Ok(value) => ([(CONTENT_TYPE, value)], body).into_response(),
            Err(err) => {
                error!(?err, "failed to build content-type header");
                (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
            }
        },
        Err(err) => {
            error!(?err, "failed to convert prometheus metrics to utf8");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}
