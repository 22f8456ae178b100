//! The server-side control plane: wires the signing key, the agent registry and its heartbeat
//! monitor, the router, the per-task scheduler, the task lock, the callback ledger and the
//! session registry behind one owner with an explicit start/stop lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use soulbrowser_agent_link::{CallbackPayload, StreamCommand};
use soulbrowser_core_types::{now_ms, BusError, ClientId, CommandId, ConnectionId, TabId};
use soulbrowser_envelope::{CommandEnvelope, EnvelopeTarget, Jwks, SignatureEncoding, SigningKey};
use soulbrowser_event_bus::{InMemoryBus, TopicBus, TopicSubscription};
use soulbrowser_registry::{
    BrowserClient, ClientLink, ClientMeta, ClientRegistry, ClientSnapshot, HeartbeatEvent,
    HeartbeatMonitor, HeartbeatStatus,
};
use soulbrowser_scheduler::{
    ActionScheduler, ActionTimeouts, CommandResponse, CommandRouter, OutboundCommand,
    ScheduledAction, TaskLock,
};
use soulbrowser_session_registry::{CdpEvent, CdpEventIngest, SessionChange, SessionRegistry};

use crate::config::ControlConfig;
use crate::control::bus::{CallbackRejection, CommandRecord, ControlBus};
use crate::control::model::{
    BatchItem, BatchItemOutcome, BatchReceipt, BatchRequest, ControlEvent, DispatchOutcome,
    DispatchRequest, EnqueueReceipt, EnqueueRequest, ExecutedCommand,
};
use crate::metrics;

const STREAM_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

struct Issued {
    envelope: CommandEnvelope,
    jws: String,
}

impl Issued {
    fn outbound(&self) -> OutboundCommand {
        OutboundCommand {
            command_id: self.envelope.command_id.clone(),
            trace_id: self.envelope.trace_id.clone(),
            tab_id: self.envelope.target.tab_id,
            session_id: self.envelope.target.session_id.clone(),
            jws: self.jws.clone(),
        }
    }
}

pub struct ControlPlane {
    config: ControlConfig,
    signing_key: SigningKey,
    registry: Arc<ClientRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    router: Arc<CommandRouter>,
    scheduler: Arc<ActionScheduler>,
    task_lock: TaskLock<ExecutedCommand>,
    sessions: CdpEventIngest,
    ledger: Arc<ControlBus>,
    stream: Arc<TopicBus<StreamCommand>>,
    events: Arc<InMemoryBus<ControlEvent>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(config: ControlConfig, signing_key: SigningKey) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new(config.target_fallback));
        let monitor = HeartbeatMonitor::new(Arc::clone(&registry), config.heartbeat());
        let router = Arc::new(CommandRouter::new(Arc::clone(&registry)));
        let scheduler = Arc::new(ActionScheduler::new(
            Arc::clone(&router),
            config.action_timeouts(),
        ));
        let task_lock = TaskLock::new(config.result_cache_ttl());
        metrics::register_metrics();
        info!(
            kid = signing_key.kid(),
            fallback = ?config.target_fallback,
            "control plane created"
        );
        Arc::new(Self {
            config,
            signing_key,
            registry,
            monitor,
            router,
            scheduler,
            task_lock,
            sessions: CdpEventIngest::new(Arc::new(SessionRegistry::new())),
            ledger: ControlBus::new(),
            stream: TopicBus::new(STREAM_CAPACITY),
            events: InMemoryBus::new(EVENT_CAPACITY),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Start the background loops. Calling it twice is harmless.
    pub fn start(self: &Arc<Self>) {
        if !self.monitor.start() {
            return;
        }
        let mut workers = self.workers.lock();
        workers.push(
            self.router
                .spawn_disconnect_watcher(self.shutdown.child_token()),
        );
        workers.push(self.spawn_heartbeat_forwarder());
        workers.push(self.spawn_maintenance());
        info!("control plane started");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.monitor.stop().await;
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(?err, "control plane worker ended abnormally");
            }
        }
        info!("control plane stopped");
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn jwks(&self) -> Jwks {
        self.signing_key.jwks()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &CdpEventIngest {
        &self.sessions
    }

    pub fn ledger(&self) -> &Arc<ControlBus> {
        &self.ledger
    }

    pub fn events(&self) -> &Arc<InMemoryBus<ControlEvent>> {
        &self.events
    }

    fn issue(
        &self,
        target: EnvelopeTarget,
        op: Value,
        reply_url: Option<&str>,
        ttl_ms: Option<u64>,
    ) -> Result<Issued, BusError> {
        let reply_url = reply_url
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_reply_url());
        let envelope = CommandEnvelope::issue(
            self.config.issuer.clone(),
            self.config.audience.clone(),
            target,
            op,
            reply_url,
            self.config.ttl_ms(ttl_ms),
        );
        let signed = self.signing_key.sign(&envelope, SignatureEncoding::P1363)?;
        self.ledger.register(
            envelope.command_id.clone(),
            envelope.trace_id.clone(),
            envelope.reply.callback_token.clone(),
            envelope.expires_at_ms(),
        );
        metrics::record_issued();
        self.events.emit(ControlEvent::CommandIssued {
            command_id: envelope.command_id.clone(),
            tab_id: envelope.target.tab_id,
        });
        debug!(
            command_id = %envelope.command_id,
            trace_id = %envelope.trace_id,
            ttl_ms = envelope.ttl_ms,
            "command issued"
        );
        Ok(Issued {
            envelope,
            jws: signed.jws,
        })
    }

    // ----- live stream -----

    pub fn subscribe_stream(&self, client_id: &ClientId) -> TopicSubscription<StreamCommand> {
        self.stream.subscribe(&client_id.0)
    }

    pub fn stream_listeners(&self, client_id: &ClientId) -> usize {
        self.stream.subscriber_count(&client_id.0)
    }

    fn publish(&self, client_id: &ClientId, issued: &Issued) -> usize {
        let event = StreamCommand::new(&issued.envelope, client_id.clone(), issued.jws.clone());
        let delivered = self.stream.publish(&client_id.0, event);
        if delivered == 0 {
            debug!(
                client_id = %client_id,
                command_id = %issued.envelope.command_id,
                "no live listener for command"
            );
        }
        delivered
    }

    /// Sign a command and push it to `client_id`'s live stream. Nothing waits for the result;
    /// it comes back through the callback.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, BusError> {
        if !request.op.is_object() {
            return Err(BusError::Malformed("op must be a JSON object".to_string()));
        }
        let issued = self.issue(
            EnvelopeTarget {
                client_id: Some(request.client_id.clone()),
                tab_id: request.tab_id,
                session_id: request.session_id.clone(),
            },
            request.op,
            request.reply_url.as_deref(),
            request.ttl_ms,
        )?;
        let delivered = self.publish(&request.client_id, &issued);
        Ok(EnqueueReceipt {
            command_id: issued.envelope.command_id.clone(),
            trace_id: issued.envelope.trace_id.clone(),
            issued_at: issued.envelope.issued_at,
            ttl_ms: issued.envelope.ttl_ms,
            delivered,
        })
    }

    /// Each item is signed and published on its own; a bad item only fails itself.
    pub fn enqueue_batch(&self, request: BatchRequest) -> BatchReceipt {
        let issued_at = now_ms();
        let mut results = Vec::with_capacity(request.items.len());
        for raw in request.items {
            let method = match raw.get("method") {
                Some(Value::String(method)) if !method.trim().is_empty() => method.clone(),
                Some(Value::String(_)) | Some(Value::Null) | None => {
                    results.push(BatchItemOutcome::rejected(String::new(), "Missing item.method"));
                    continue;
                }
                Some(other) => {
                    results.push(BatchItemOutcome::rejected(other.to_string(), "Missing item.method"));
                    continue;
                }
            };
            let item = match serde_json::from_value::<BatchItem>(raw) {
                Ok(item) => item,
                Err(err) => {
                    results.push(BatchItemOutcome::rejected(method, format!("Invalid item: {err}")));
                    continue;
                }
            };
            let op = json!({
                "kind": "cdp.send",
                "method": &item.method,
                "params": item.params.clone().unwrap_or_else(|| json!({})),
            });
            let issued = self.issue(
                EnvelopeTarget {
                    client_id: Some(request.client_id.clone()),
                    tab_id: item.tab_id,
                    session_id: None,
                },
                op,
                request.reply_url.as_deref(),
                item.ttl_ms.or(request.ttl_ms),
            );
            match issued {
                Ok(issued) => {
                    self.publish(&request.client_id, &issued);
                    results.push(BatchItemOutcome::issued(
                        item.method,
                        issued.envelope.command_id.clone(),
                        issued.envelope.trace_id.clone(),
                    ));
                }
                Err(err) => results.push(BatchItemOutcome::rejected(item.method, err.to_string())),
            }
        }
        BatchReceipt {
            issued_at,
            count: results.len(),
            results,
        }
    }

    // ----- synchronous dispatch -----

    pub async fn dispatch(
        self: &Arc<Self>,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, BusError> {
        match (request.task_id.clone(), request.action_id.clone()) {
            (Some(task_id), Some(action_id)) => {
                let plane = Arc::clone(self);
                let (task, action) = (task_id.clone(), action_id.clone());
                let outcome = self
                    .task_lock
                    .run_exclusive(
                        &task_id,
                        &action_id,
                        move || {
                            let issued = plane.issue_for_dispatch(&request);
                            let timeouts = plane.timeouts_for(&request);
                            async move {
                                let issued = issued?;
                                let scheduled = ScheduledAction {
                                    task_id: task,
                                    action_id: action,
                                    command: issued.outbound(),
                                    timeouts: Some(timeouts),
                                };
                                let result = plane.scheduler.schedule(scheduled).await;
                                plane.settle(&issued, result)
                            }
                        },
                        None,
                    )
                    .await?;
                Ok(DispatchOutcome::new(outcome.value, outcome.cached))
            }
            _ => {
                let issued = self.issue_for_dispatch(&request)?;
                let timeout = Duration::from_millis(issued.envelope.ttl_ms);
                let result = self.router.send(&issued.outbound(), timeout).await;
                self.settle(&issued, result)
                    .map(|executed| DispatchOutcome::new(executed, false))
            }
        }
    }

    /// Nothing is signed or ledgered while no agent could take the command. Cached task
    /// results never get here.
    fn issue_for_dispatch(&self, request: &DispatchRequest) -> Result<Issued, BusError> {
        if self.registry.resolve_target(request.tab_id).is_none() {
            warn!(tab_id = ?request.tab_id, "dispatch refused: no client");
            return Err(BusError::NoClient {
                tab_id: request.tab_id,
            });
        }
        self.issue(
            EnvelopeTarget {
                client_id: None,
                tab_id: request.tab_id,
                session_id: request.session_id.clone(),
            },
            request.op.clone(),
            request.reply_url.as_deref(),
            request.ttl_ms,
        )
    }

    fn timeouts_for(&self, request: &DispatchRequest) -> ActionTimeouts {
        let defaults = self.config.action_timeouts();
        ActionTimeouts {
            ack: request
                .ack_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ack),
            exec: request
                .exec_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.exec),
        }
    }

    fn settle(
        &self,
        issued: &Issued,
        result: Result<Value, BusError>,
    ) -> Result<ExecutedCommand, BusError> {
        let command_id = &issued.envelope.command_id;
        match result {
            Ok(result) => Ok(ExecutedCommand {
                command_id: command_id.clone(),
                trace_id: issued.envelope.trace_id.clone(),
                result,
            }),
            Err(err) => {
                if matches!(err, BusError::NoClient { .. }) {
                    self.ledger.discard(command_id);
                }
                Err(err)
            }
        }
    }

    // ----- results -----

    /// Accept a result callback presented with `bearer`. A verified callback also settles the
    /// matching pending dispatch, if anyone still waits for it.
    pub fn handle_callback(
        &self,
        bearer: Option<&str>,
        payload: CallbackPayload,
    ) -> Result<CommandRecord, CallbackRejection> {
        let command_id = payload.command_id.clone();
        if let Err(rejection) =
            self.ledger
                .verify_callback_token(&command_id, bearer.unwrap_or_default(), now_ms())
        {
            metrics::record_callback("rejected");
            warn!(%command_id, reason = %rejection, "callback rejected");
            return Err(rejection);
        }
        let response = match payload.outcome() {
            Ok(data) => CommandResponse::ok(command_id.clone(), data),
            Err(error) => CommandResponse::failed(command_id.clone(), error),
        };
        let ok = payload.is_ok();
        let record = self
            .ledger
            .mark_callback(payload)
            .ok_or(CallbackRejection::UnknownCommand)?;
        let awaited = self.router.handle_response(response);
        metrics::record_callback(if ok { "ok" } else { "error" });
        self.events.emit(ControlEvent::CallbackAccepted {
            command_id: command_id.clone(),
            ok,
        });
        info!(%command_id, ok, awaited, "callback accepted");
        Ok(record)
    }

    /// A `command_response` frame from an agent socket.
    pub fn handle_response(&self, response: CommandResponse) -> bool {
        self.ledger.complete(&response.command_id);
        self.router.handle_response(response)
    }

    pub fn command(&self, command_id: &CommandId) -> Option<CommandRecord> {
        self.ledger.get(command_id)
    }

    // ----- agents -----

    pub fn attach_agent(&self, link: Arc<dyn ClientLink>, meta: ClientMeta) -> BrowserClient {
        let client = self.registry.register(link, meta);
        if let Some(tab_id) = client.tab_id {
            self.sessions.registry().touch(tab_id);
        }
        client
    }

    /// Fire-and-forget frame to every connected agent.
    pub async fn broadcast(&self, event: &str, data: Value) -> usize {
        self.router.broadcast(event, data).await
    }

    pub fn heartbeat(&self, connection_id: &ConnectionId) -> bool {
        self.registry.heartbeat(connection_id)
    }

    /// Transport closed: drop the client and fail whatever still waits on it.
    pub fn detach_agent(&self, connection_id: &ConnectionId) {
        self.registry.unregister(connection_id);
        self.router.cleanup_for_connection(connection_id);
    }

    pub fn clients(&self) -> Vec<ClientSnapshot> {
        let stale_after_ms = self.config.stale_threshold_ms;
        self.registry
            .list()
            .iter()
            .map(|client| client.snapshot(stale_after_ms))
            .collect()
    }

    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        self.monitor.status()
    }

    // ----- sessions -----

    pub fn ingest_cdp(&self, event: CdpEvent) -> SessionChange {
        self.sessions.ingest(event)
    }

    /// Tab-closed signal: forget the tab's session tree.
    pub fn close_tab(&self, tab_id: TabId) -> usize {
        self.sessions.registry().clear_tab(tab_id)
    }

    // ----- background work -----

    fn spawn_heartbeat_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let mut signals = self.monitor.subscribe();
        let events = Arc::clone(&self.events);
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Ok(HeartbeatEvent::Stale { connection_id, silent_for }) => {
                            events.emit(ControlEvent::ClientStale {
                                connection_id,
                                silent_ms: silent_for.as_millis() as u64,
                            });
                        }
                        Ok(HeartbeatEvent::Timeout { connection_id, silent_for }) => {
                            events.emit(ControlEvent::ClientTimedOut {
                                connection_id,
                                silent_ms: silent_for.as_millis() as u64,
                            });
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "heartbeat", skipped, "heartbeat forwarder lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let plane = Arc::downgrade(self);
        let shutdown = self.shutdown.child_token();
        let every = Duration::from_millis(self.config.ledger_sweep_interval_ms.max(10));
        let retention_ms = self.config.ledger_retention_ms;
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(plane) = plane.upgrade() else { break };
                        let swept = plane.ledger.sweep(now_ms(), retention_ms);
                        let purged = plane.task_lock.purge_expired();
                        if swept + purged > 0 {
                            info!(target: "control-bus", swept, purged, "expired entries removed");
                        }
                    }
                }
            }
            debug!(target: "control-bus", "maintenance loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::link::ChannelLink;
    use crate::control::model::EnqueueRequest;
    use soulbrowser_core_types::{ActionId, TaskId};
    use soulbrowser_event_bus::EventBus;

    fn plane() -> Arc<ControlPlane> {
        ControlPlane::new(ControlConfig::default(), SigningKey::generate().unwrap())
    }

    #[tokio::test]
    async fn enqueue_registers_in_the_ledger_and_emits_an_event() {
        let plane = plane();
        let mut events = plane.events().subscribe();
        let receipt = plane
            .enqueue(EnqueueRequest {
                client_id: ClientId("ext-1".into()),
                tab_id: Some(TabId(4)),
                session_id: None,
                ttl_ms: Some(2_000),
                op: json!({"kind": "cdp.send", "method": "Page.reload"}),
                reply_url: None,
            })
            .unwrap();

        assert_eq!(receipt.delivered, 0);
        assert_eq!(receipt.ttl_ms, 2_000);
        assert_eq!(
            events.recv().await.unwrap(),
            ControlEvent::CommandIssued {
                command_id: receipt.command_id.clone(),
                tab_id: Some(TabId(4)),
            }
        );
        let record = plane.command(&receipt.command_id).unwrap();
        assert_eq!(record.expires_at, receipt.issued_at + 2_000);
    }

    #[tokio::test]
    async fn enqueue_refuses_a_non_object_op() {
        let plane = plane();
        let err = plane
            .enqueue(EnqueueRequest {
                client_id: ClientId("ext-1".into()),
                tab_id: None,
                session_id: None,
                ttl_ms: None,
                op: json!("Page.reload"),
                reply_url: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), "MALFORMED");
        assert!(plane.ledger().is_empty());
    }

    #[tokio::test]
    async fn cached_task_result_replays_after_the_agent_left() {
        let plane = plane();
        let (link, mut outbound) = ChannelLink::new();
        let connection_id = link.connection_id().clone();
        plane.attach_agent(
            Arc::clone(&link) as Arc<dyn ClientLink>,
            ClientMeta {
                client_id: None,
                tab_id: Some(TabId(5)),
                client_type: "extension".into(),
            },
        );
        let request = |action: &str| DispatchRequest {
            tab_id: Some(TabId(5)),
            op: json!({"kind": "cdp.send", "method": "Runtime.evaluate"}),
            task_id: Some(TaskId("task-1".into())),
            action_id: Some(ActionId(action.into())),
            ..Default::default()
        };

        let first = {
            let plane = Arc::clone(&plane);
            let request = request("step-1");
            tokio::spawn(async move { plane.dispatch(request).await })
        };
        let frame = outbound.recv().await.unwrap();
        let ack_id = frame["ackId"].as_str().unwrap().to_string();
        assert!(link.resolve_ack(&ack_id, json!({"success": true, "data": {"value": 2}})));
        let first = first.await.unwrap().unwrap();
        assert!(!first.cached);
        assert_eq!(first.result, json!({"value": 2}));

        plane.detach_agent(&connection_id);
        let replay = plane.dispatch(request("step-1")).await.unwrap();
        assert!(replay.cached);
        assert_eq!(replay.command_id, first.command_id);
        assert_eq!(replay.result, json!({"value": 2}));

        let err = plane.dispatch(request("step-2")).await.unwrap_err();
        assert_eq!(err.code(), "NO_CLIENT");
    }

    #[tokio::test]
    async fn detaching_the_agent_fails_its_pending_dispatch() {
        let plane = plane();
        let (link, mut outbound) = ChannelLink::new();
        let connection_id = link.connection_id().clone();
        plane.attach_agent(
            link as Arc<dyn ClientLink>,
            ClientMeta {
                client_id: None,
                tab_id: Some(TabId(9)),
                client_type: "extension".into(),
            },
        );

        let dispatch = {
            let plane = Arc::clone(&plane);
            tokio::spawn(async move {
                plane
                    .dispatch(DispatchRequest {
                        tab_id: Some(TabId(9)),
                        op: json!({"kind": "cdp.send", "method": "Page.reload"}),
                        ..Default::default()
                    })
                    .await
            })
        };
        let frame = outbound.recv().await.unwrap();
        assert_eq!(frame["type"], "command");
        assert!(frame.get("ackId").is_none());

        plane.detach_agent(&connection_id);
        let err = dispatch.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CLIENT_DISCONNECTED");
        assert_eq!(plane.router().pending_count(), 0);
    }
}
