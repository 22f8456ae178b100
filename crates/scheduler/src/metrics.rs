use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::error;

lazy_static! {
    static ref PENDING_COMMANDS: IntGauge = IntGauge::new(
        "soul_control_pending_commands",
        "Commands waiting for a response"
    )
    .unwrap();
    static ref COMMANDS_SENT: IntCounter =
        IntCounter::new("soul_control_commands_sent_total", "Commands sent to agents").unwrap();
    static ref COMMANDS_TIMED_OUT: IntCounter = IntCounter::new(
        "soul_control_commands_timed_out_total",
        "Pending commands removed by their timer"
    )
    .unwrap();
    static ref RESPONSES_DROPPED: IntCounter = IntCounter::new(
        "soul_control_responses_dropped_total",
        "Responses that matched no pending command"
    )
    .unwrap();
    static ref NO_CLIENT: IntCounter = IntCounter::new(
        "soul_control_no_client_total",
        "Commands rejected because no agent could take them"
    )
    .unwrap();
    static ref ACTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("soul_control_actions_total", "Scheduled actions by stage"),
        &["stage"]
    )
    .unwrap();
    static ref ACTION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("soul_control_action_failures_total", "Failed actions by error code"),
        &["code"]
    )
    .unwrap();
    static ref TASK_LOCK: IntCounterVec = IntCounterVec::new(
        Opts::new("soul_control_task_lock_total", "Task lock decisions"),
        &["outcome"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register scheduler metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, PENDING_COMMANDS.clone());
    register(registry, COMMANDS_SENT.clone());
    register(registry, COMMANDS_TIMED_OUT.clone());
    register(registry, RESPONSES_DROPPED.clone());
    register(registry, NO_CLIENT.clone());
    register(registry, ACTIONS.clone());
    register(registry, ACTION_FAILURES.clone());
    register(registry, TASK_LOCK.clone());
}

pub fn set_pending(count: usize) {
    PENDING_COMMANDS.set(count as i64);
}

pub fn record_sent() {
    COMMANDS_SENT.inc();
}

pub fn record_timeout() {
    COMMANDS_TIMED_OUT.inc();
}

pub fn record_dropped() {
    RESPONSES_DROPPED.inc();
}

pub fn record_no_client() {
    NO_CLIENT.inc();
}

pub fn record_enqueued() {
    ACTIONS.with_label_values(&["enqueued"]).inc();
}

pub fn record_started() {
    ACTIONS.with_label_values(&["started"]).inc();
}

pub fn record_completed() {
    ACTIONS.with_label_values(&["completed"]).inc();
}

pub fn record_late_result() {
    ACTIONS.with_label_values(&["late_result"]).inc();
}

pub fn record_failed(code: &str) {
    ACTIONS.with_label_values(&["failed"]).inc();
    ACTION_FAILURES.with_label_values(&[code]).inc();
}

pub fn record_lock_hit() {
    TASK_LOCK.with_label_values(&["cache_hit"]).inc();
}

pub fn record_lock_join() {
    TASK_LOCK.with_label_values(&["joined"]).inc();
}

pub fn record_lock_conflict() {
    TASK_LOCK.with_label_values(&["conflict"]).inc();
}
