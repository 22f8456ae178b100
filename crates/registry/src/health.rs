use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use soulbrowser_core_types::ConnectionId;
use soulbrowser_event_bus::{EventBus, InMemoryBus};

use crate::{metrics, state::ClientRegistry};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }
}

impl HeartbeatConfig {
    pub fn timeout_threshold(&self) -> Duration {
        self.stale_threshold * 2
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeartbeatEvent {
    Stale {
        connection_id: ConnectionId,
        silent_for: Duration,
    },
    Timeout {
        connection_id: ConnectionId,
        silent_for: Duration,
    },
}

/// Outcome of one scan.
#[derive(Clone, Debug, Default)]
pub struct CheckReport {
    pub checked: usize,
    pub stale: Vec<ConnectionId>,
    pub timed_out: Vec<ConnectionId>,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
#[derive(Clone, Debug)]
pub struct HeartbeatStatus {
    pub running: bool,
    pub interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub clients: usize,
    pub stale_clients: usize,
}

/// Scans the registry on a fixed interval: stale after `stale_threshold` without a heartbeat,
/// disconnected and removed after twice that.
pub struct HeartbeatMonitor {
    registry: Arc<ClientRegistry>,
    config: HeartbeatConfig,
    events: Arc<InMemoryBus<HeartbeatEvent>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ClientRegistry>, config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            events: InMemoryBus::new(64),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    /// Start the periodic scan. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        let cancel = token.clone();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = monitor.config.interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check().await;
                    }
                }
            }
            debug!(target: "heartbeat", "heartbeat loop stopped");
        });
        *slot = Some((token, handle));
        info!(
            target: "heartbeat",
            interval_ms = self.config.interval.as_millis() as u64,
            stale_threshold_ms = self.config.stale_threshold.as_millis() as u64,
            "heartbeat monitor started"
        );
        true
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(target: "heartbeat", ?err, "heartbeat loop ended abnormally");
            }
            info!(target: "heartbeat", "heartbeat monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run one scan now.
    pub async fn check(&self) -> CheckReport {
        let stale_after = self.config.stale_threshold;
        let timeout_after = self.config.timeout_threshold();
        let mut report = CheckReport::default();

        for client in self.registry.list() {
            report.checked += 1;
            let silent_for = client.last_heartbeat.elapsed();
            if silent_for > timeout_after {
                warn!(
                    target: "heartbeat",
                    connection = %client.connection_id,
                    silent_ms = silent_for.as_millis() as u64,
                    "client heartbeat timed out, disconnecting"
                );
                metrics::record_heartbeat_timeout();
                self.events.emit(HeartbeatEvent::Timeout {
                    connection_id: client.connection_id.clone(),
                    silent_for,
                });
                client.link().disconnect("heartbeat timeout").await;
                self.registry.unregister(&client.connection_id);
                report.timed_out.push(client.connection_id);
            } else if silent_for > stale_after {
                warn!(
                    target: "heartbeat",
                    connection = %client.connection_id,
                    silent_ms = silent_for.as_millis() as u64,
                    "client heartbeat is stale"
                );
                metrics::record_heartbeat_stale();
                self.events.emit(HeartbeatEvent::Stale {
                    connection_id: client.connection_id.clone(),
                    silent_for,
                });
                report.stale.push(client.connection_id);
            }
        }
        report
    }

    pub fn stale_clients(&self) -> Vec<ConnectionId> {
        let stale_after = self.config.stale_threshold;
        self.registry
            .list()
            .into_iter()
            .filter(|client| client.last_heartbeat.elapsed() > stale_after)
            .map(|client| client.connection_id)
            .collect()
    }

    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            running: self.is_running(),
            interval_ms: self.config.interval.as_millis() as u64,
            stale_threshold_ms: self.config.stale_threshold.as_millis() as u64,
            clients: self.registry.len(),
            stale_clients: self.stale_clients().len(),
        }
    }
}
