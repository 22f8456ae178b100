//! Per-task serial queues on top of the router, with separate ack and exec deadlines.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use soulbrowser_core_types::{ActionId, BusError, TaskId};

use crate::metrics;
use crate::model::{CommandResponse, OutboundCommand};
use crate::router::{CommandRouter, PendingReceipt};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1_500);
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionTimeouts {
    pub ack: Duration,
    pub exec: Duration,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            ack: DEFAULT_ACK_TIMEOUT,
            exec: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

/// One action bound for a task's queue.
#[derive(Clone, Debug)]
pub struct ScheduledAction {
    pub task_id: TaskId,
    pub action_id: ActionId,
    pub command: OutboundCommand,
    pub timeouts: Option<ActionTimeouts>,
}

struct Job {
    action: ScheduledAction,
    reply: oneshot::Sender<Result<Value, BusError>>,
}

type Queues = DashMap<TaskId, mpsc::UnboundedSender<Job>>;

/// Actions for the same task run strictly one at a time in submission order; different tasks
/// run concurrently. A queue exists only while it has work.
pub struct ActionScheduler {
    router: Arc<CommandRouter>,
    queues: Arc<Queues>,
    defaults: ActionTimeouts,
}

impl ActionScheduler {
    pub fn new(router: Arc<CommandRouter>, defaults: ActionTimeouts) -> Self {
        Self {
            router,
            queues: Arc::new(DashMap::new()),
            defaults,
        }
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn defaults(&self) -> ActionTimeouts {
        self.defaults
    }

    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    pub async fn schedule(&self, mut action: ScheduledAction) -> Result<Value, BusError> {
        if action.timeouts.is_none() {
            action.timeouts = Some(self.defaults);
        }
        let task_id = action.task_id.clone();
        let (reply, rx) = oneshot::channel();
        {
            // Sending under the shard lock keeps the worker's idle check consistent with us.
            let queue = self
                .queues
                .entry(task_id.clone())
                .or_insert_with(|| self.spawn_worker(task_id.clone()));
            if let Err(mpsc::error::SendError(job)) = queue.send(Job { action, reply }) {
                let _ = job
                    .reply
                    .send(Err(BusError::Internal(format!("queue for task {task_id} closed"))));
            }
        }
        metrics::record_enqueued();
        rx.await.unwrap_or_else(|_| {
            Err(BusError::Internal(format!(
                "queue worker for task {task_id} dropped the action"
            )))
        })
    }

    fn spawn_worker(&self, task_id: TaskId) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let router = Arc::clone(&self.router);
        let queues = Arc::clone(&self.queues);
        debug!(target: "action-scheduler", %task_id, "task queue created");
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Job { action, reply } = job;
                let outcome = execute(&router, &action).await;
                if reply.send(outcome).is_err() {
                    debug!(target: "action-scheduler", action_id = %action.action_id, "caller went away before result");
                }
                if queues.remove_if(&task_id, |_, _| rx.is_empty()).is_some() {
                    break;
                }
            }
            debug!(target: "action-scheduler", %task_id, "task queue drained");
        });
        tx
    }
}

async fn execute(router: &Arc<CommandRouter>, action: &ScheduledAction) -> Result<Value, BusError> {
    let timeouts = action.timeouts.unwrap_or_default();
    let command = &action.command;
    metrics::record_started();
    let client = router.resolve(command).map_err(|err| {
        metrics::record_no_client();
        err
    })?;

    // The exec deadline is armed before sending and runs independently of the ack.
    let receipt = router.register_pending(
        &command.command_id,
        &client.connection_id,
        timeouts.exec,
        BusError::PluginTimeoutExec {
            command_id: command.command_id.clone(),
            timeout_ms: timeouts.exec.as_millis() as u64,
        },
    );
    let ack_id = command.command_id.0.clone();
    let acked = client
        .link()
        .send_with_ack(command.frame(Some(&ack_id)), timeouts.ack)
        .await;
    router.registry().record_sent(&client.connection_id);

    let outcome = match acked {
        Ok(ack) => {
            if let Some(response) = CommandResponse::from_ack(&command.command_id, &ack) {
                debug!(target: "action-scheduler", command_id = %command.command_id, "ack carried the result");
                router.handle_response(response);
            }
            receipt.wait().await
        }
        Err(err) => {
            let err = err.into_bus_error(&command.command_id);
            if matches!(err, BusError::PluginTimeoutAck { .. }) {
                warn!(
                    target: "action-scheduler",
                    task_id = %action.task_id,
                    action_id = %action.action_id,
                    command_id = %command.command_id,
                    "no ack; a result may still arrive before the exec deadline"
                );
                watch_late_result(receipt);
            } else {
                router.forget(&command.command_id);
            }
            Err(err)
        }
    };
    match &outcome {
        Ok(_) => metrics::record_completed(),
        Err(err) => metrics::record_failed(err.code()),
    }
    outcome
}

fn watch_late_result(receipt: PendingReceipt) {
    tokio::spawn(async move {
        let command_id = receipt.command_id().clone();
        match receipt.wait().await {
            Ok(_) => {
                metrics::record_late_result();
                info!(target: "action-scheduler", %command_id, "late result accepted after ack timeout");
            }
            Err(err) => {
                debug!(target: "action-scheduler", %command_id, code = err.code(), "no late result");
            }
        }
    });
}
