use serde::{Deserialize, Serialize};
use serde_json::Value;

use soulbrowser_core_types::{ActionId, ClientId, CommandId, ConnectionId, TabId, TaskId, TraceId};

/// Publish one signed command on a client's live stream.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(alias = "extensionId")]
    pub client_id: ClientId,
    #[serde(default)]
    pub tab_id: Option<TabId>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    pub op: Value,
    #[serde(default)]
    pub reply_url: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub issued_at: i64,
    pub ttl_ms: u64,
    /// Live stream listeners that received the command.
    pub delivered: usize,
}

/// Items stay raw JSON so one malformed entry cannot fail the whole batch.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(alias = "extensionId")]
    pub client_id: ClientId,
    #[serde(default)]
    pub reply_url: Option<String>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    pub items: Vec<Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub tab_id: Option<TabId>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemOutcome {
    pub ok: bool,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemOutcome {
    pub fn issued(method: String, command_id: CommandId, trace_id: TraceId) -> Self {
        Self {
            ok: true,
            method,
            command_id: Some(command_id),
            trace_id: Some(trace_id),
            error: None,
        }
    }

    pub fn rejected(method: String, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            method,
            command_id: None,
            trace_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReceipt {
    pub issued_at: i64,
    pub count: usize,
    pub results: Vec<BatchItemOutcome>,
}

/// Send a command to a connected agent and wait for its result.
///
/// With both `task_id` and `action_id` the command runs under the task lock and the per-task
/// queue with separate ack and exec deadlines; otherwise it goes straight through the router
/// with the TTL as its deadline.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub tab_id: Option<TabId>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub op: Value,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub action_id: Option<ActionId>,
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
    #[serde(default)]
    pub exec_timeout_ms: Option<u64>,
    #[serde(default)]
    pub reply_url: Option<String>,
}

/// A finished command; this is what the task lock caches for replay.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedCommand {
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub cached: bool,
    pub result: Value,
}

impl DispatchOutcome {
    pub fn new(executed: ExecutedCommand, cached: bool) -> Self {
        Self {
            command_id: executed.command_id,
            trace_id: executed.trace_id,
            cached,
            result: executed.result,
        }
    }
}

/// Observability signals published by the control plane.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    CommandIssued {
        command_id: CommandId,
        tab_id: Option<TabId>,
    },
    CallbackAccepted {
        command_id: CommandId,
        ok: bool,
    },
    ClientStale {
        connection_id: ConnectionId,
        silent_ms: u64,
    },
    ClientTimedOut {
        connection_id: ConnectionId,
        silent_ms: u64,
    },
}
