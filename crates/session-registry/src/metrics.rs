use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounterVec, IntGauge, Opts, Registry};
use tracing::error;

lazy_static! {
    static ref CHILD_SESSIONS: IntGauge = IntGauge::new(
        "soul_control_child_sessions",
        "CDP child sessions attached across all tabs"
    )
    .unwrap();
    static ref CDP_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("soul_control_cdp_events_total", "CDP events received from agents"),
        &["domain"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register session registry metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, CHILD_SESSIONS.clone());
    register(registry, CDP_EVENTS_TOTAL.clone());
}

pub fn set_child_sessions(count: usize) {
    CHILD_SESSIONS.set(count as i64);
}

pub fn record_event(method: &str) {
    let domain = method.split('.').next().unwrap_or("unknown");
    CDP_EVENTS_TOTAL.with_label_values(&[domain]).inc();
}
