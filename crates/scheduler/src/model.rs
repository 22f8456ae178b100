use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use soulbrowser_core_types::{BusError, CommandId, RemoteError, TabId, TraceId};

/// A signed command ready to go out over an agent connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundCommand {
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub tab_id: Option<TabId>,
    pub session_id: Option<String>,
    pub jws: String,
}

impl OutboundCommand {
    /// The `command` frame sent to the agent.
    pub fn frame(&self, ack_id: Option<&str>) -> Value {
        let mut frame = json!({
            "type": "command",
            "commandId": self.command_id.0,
            "traceId": self.trace_id.0,
            "jws": self.jws,
        });
        if let Some(tab_id) = self.tab_id {
            frame["tabId"] = json!(tab_id.0);
        }
        if let Some(session_id) = &self.session_id {
            frame["sessionId"] = json!(session_id);
        }
        if let Some(ack_id) = ack_id {
            frame["ackId"] = json!(ack_id);
        }
        frame
    }
}

/// Result reported by an agent for one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl CommandResponse {
    pub fn ok(command_id: CommandId, data: Value) -> Self {
        Self {
            command_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(command_id: CommandId, error: RemoteError) -> Self {
        Self {
            command_id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Legacy agents answer the ack with the whole result. Recognised by a boolean `success`.
    pub fn from_ack(command_id: &CommandId, ack: &Value) -> Option<Self> {
        let success = ack.get("success")?.as_bool()?;
        let data = ack.get("data").or_else(|| ack.get("result")).cloned();
        let error = match ack.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(RemoteError {
                code: None,
                message: message.clone(),
            }),
            Some(other) => Some(
                serde_json::from_value::<RemoteError>(other.clone()).unwrap_or(RemoteError {
                    code: None,
                    message: other.to_string(),
                }),
            ),
        };
        Some(Self {
            command_id: command_id.clone(),
            success,
            data,
            error,
        })
    }

    pub fn into_result(self) -> Result<Value, BusError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(BusError::Remote(self.error.unwrap_or(RemoteError {
                code: None,
                message: "command failed".to_string(),
            })))
        }
    }
}
