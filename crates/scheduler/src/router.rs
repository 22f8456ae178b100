//! Pending-command table: sends a command to the resolved agent and correlates the
//! asynchronous response (or timeout, or disconnect) back to the caller.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use soulbrowser_core_types::{BusError, CommandId, ConnectionId};
use soulbrowser_registry::{BrowserClient, ClientEvent, ClientRegistry};

use crate::metrics;
use crate::model::{CommandResponse, OutboundCommand};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Responder = oneshot::Sender<Result<Value, BusError>>;

struct PendingCommand {
    connection_id: ConnectionId,
    responder: Responder,
    timer: Option<JoinHandle<()>>,
    registered_at: Instant,
}

impl PendingCommand {
    fn disarm(self) -> Responder {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.responder
    }
}

/// Handle to one pending entry; resolves with the response, the timeout or the disconnect.
pub struct PendingReceipt {
    command_id: CommandId,
    rx: oneshot::Receiver<Result<Value, BusError>>,
}

impl PendingReceipt {
    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub async fn wait(self) -> Result<Value, BusError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(BusError::Internal(format!(
                "pending entry for {} dropped",
                self.command_id
            )))
        })
    }
}

pub struct CommandRouter {
    registry: Arc<ClientRegistry>,
    pending: Arc<DashMap<CommandId, PendingCommand>>,
}

impl CommandRouter {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn resolve(&self, command: &OutboundCommand) -> Result<BrowserClient, BusError> {
        self.registry
            .resolve_target(command.tab_id)
            .ok_or(BusError::NoClient {
                tab_id: command.tab_id,
            })
    }

    /// Send `command` and wait for its response. Fails `NO_CLIENT` at once when nobody can take
    /// it; nothing is queued in that case.
    pub async fn send(
        &self,
        command: &OutboundCommand,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let client = match self.resolve(command) {
            Ok(client) => client,
            Err(err) => {
                metrics::record_no_client();
                warn!(target: "command-router", command_id = %command.command_id, tab_id = ?command.tab_id, "no client for command");
                return Err(err);
            }
        };
        let receipt = self.register_pending(
            &command.command_id,
            &client.connection_id,
            timeout,
            BusError::CommandTimeout {
                command_id: command.command_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            },
        );
        if let Err(err) = client.link().send(command.frame(None)).await {
            self.forget(&command.command_id);
            self.registry.record_error(&client.connection_id);
            return Err(err.into_bus_error(&command.command_id));
        }
        self.registry.record_sent(&client.connection_id);
        metrics::record_sent();
        debug!(
            target: "command-router",
            command_id = %command.command_id,
            connection = %client.connection_id,
            "command sent"
        );
        receipt.wait().await
    }

    /// Arm a pending entry. When `timeout` elapses first, the entry is removed and the receipt
    /// resolves with `on_timeout`.
    pub fn register_pending(
        &self,
        command_id: &CommandId,
        connection_id: &ConnectionId,
        timeout: Duration,
        on_timeout: BusError,
    ) -> PendingReceipt {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.insert(
            command_id.clone(),
            PendingCommand {
                connection_id: connection_id.clone(),
                responder: tx,
                timer: None,
                registered_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            drop(previous.disarm());
            warn!(target: "command-router", %command_id, "pending entry replaced by reissued command id");
        }

        let pending = Arc::clone(&self.pending);
        let timer_id = command_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = pending.remove(&timer_id) {
                metrics::record_timeout();
                metrics::set_pending(pending.len());
                warn!(
                    target: "command-router",
                    command_id = %timer_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out"
                );
                let _ = entry.responder.send(Err(on_timeout));
            }
        });
        // the timer may already have fired and removed the entry; the handle is then moot
        if let Some(mut entry) = self.pending.get_mut(command_id) {
            entry.timer = Some(timer);
        }
        metrics::set_pending(self.pending.len());
        PendingReceipt {
            command_id: command_id.clone(),
            rx,
        }
    }

    /// Deliver a response. Responses for unknown ids are logged and dropped; returns whether a
    /// waiter was found.
    pub fn handle_response(&self, response: CommandResponse) -> bool {
        let Some((command_id, entry)) = self.pending.remove(&response.command_id) else {
            metrics::record_dropped();
            warn!(
                target: "command-router",
                command_id = %response.command_id,
                "response for unknown or expired command dropped"
            );
            return false;
        };
        metrics::set_pending(self.pending.len());
        self.registry
            .record_response(&entry.connection_id, response.success);
        debug!(
            target: "command-router",
            %command_id,
            success = response.success,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "command resolved"
        );
        let _ = entry.disarm().send(response.into_result());
        true
    }

    /// Reject everything still waiting on `connection_id`. Nothing is retried elsewhere.
    pub fn cleanup_for_connection(&self, connection_id: &ConnectionId) -> usize {
        let ids: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|entry| &entry.connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut rejected = 0;
        for command_id in ids {
            if let Some((command_id, entry)) = self.pending.remove(&command_id) {
                let _ = entry
                    .disarm()
                    .send(Err(BusError::ClientDisconnected { command_id }));
                rejected += 1;
            }
        }
        if rejected > 0 {
            metrics::set_pending(self.pending.len());
            info!(
                target: "command-router",
                connection = %connection_id,
                rejected,
                "pending commands rejected on disconnect"
            );
        }
        rejected
    }

    /// Drop an entry without resolving it.
    pub fn forget(&self, command_id: &CommandId) -> bool {
        match self.pending.remove(command_id) {
            Some((_, entry)) => {
                drop(entry.disarm());
                metrics::set_pending(self.pending.len());
                true
            }
            None => false,
        }
    }

    /// Push `{type: event, data}` to every connected agent. Nothing is correlated; returns how
    /// many agents took the frame.
    pub async fn broadcast(&self, event: &str, data: Value) -> usize {
        let frame = json!({ "type": event, "data": data });
        let mut delivered = 0;
        for client in self.registry.list() {
            match client.link().send(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.registry.record_error(&client.connection_id);
                    warn!(
                        target: "command-router",
                        connection = %client.connection_id,
                        event,
                        %err,
                        "broadcast frame not delivered"
                    );
                }
            }
        }
        debug!(target: "command-router", event, delivered, "broadcast sent");
        delivered
    }

    pub fn is_pending(&self, command_id: &CommandId) -> bool {
        self.pending.contains_key(command_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Follow registry disconnects and reject their pending commands until `shutdown` fires.
    pub fn spawn_disconnect_watcher(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let mut events = router.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(ClientEvent::Disconnected { connection_id }) => {
                            router.cleanup_for_connection(&connection_id);
                        }
                        Ok(ClientEvent::Connected { .. }) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "command-router", skipped, "disconnect watcher lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!(target: "command-router", "disconnect watcher stopped");
        })
    }
}
