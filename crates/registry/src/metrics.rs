use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntGauge, Registry};
use tracing::error;

lazy_static! {
    static ref CONNECTED_CLIENTS: IntGauge =
        IntGauge::new("soul_control_connected_clients", "Agents currently registered").unwrap();
    static ref HEARTBEAT_STALE: IntCounter = IntCounter::new(
        "soul_control_heartbeat_stale_total",
        "Scans that found a client past the stale threshold",
    )
    .unwrap();
    static ref HEARTBEAT_TIMEOUT: IntCounter = IntCounter::new(
        "soul_control_heartbeat_timeout_total",
        "Clients disconnected for missing heartbeats",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register client registry metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, CONNECTED_CLIENTS.clone());
    register(registry, HEARTBEAT_STALE.clone());
    register(registry, HEARTBEAT_TIMEOUT.clone());
}

pub fn set_connected_clients(count: usize) {
    CONNECTED_CLIENTS.set(count as i64);
}

pub fn record_heartbeat_stale() {
    HEARTBEAT_STALE.inc();
}

pub fn record_heartbeat_timeout() {
    HEARTBEAT_TIMEOUT.inc();
}
