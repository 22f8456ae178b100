//! JSON bodies shared by the server and agents: the live-stream command event and the result
//! callback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use soulbrowser_core_types::{now_ms, ClientId, CommandId, RemoteError, TabId, TraceId};
use soulbrowser_envelope::CommandEnvelope;

pub const COMMAND_EVENT_TYPE: &str = "control.command";
pub const CALLBACK_TYPE: &str = "control.callback";

fn command_event_type() -> String {
    COMMAND_EVENT_TYPE.to_string()
}

fn callback_type() -> String {
    CALLBACK_TYPE.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTarget {
    pub extension_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
}

/// Payload of a `command` event on the live stream. The signed envelope rides in `jws`; the
/// other fields are unauthenticated routing hints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCommand {
    #[serde(rename = "type", default = "command_event_type")]
    pub kind: String,
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub issued_at: i64,
    pub ttl_ms: u64,
    pub target: StreamTarget,
    pub jws: String,
}

impl StreamCommand {
    pub fn new(envelope: &CommandEnvelope, client_id: ClientId, jws: String) -> Self {
        Self {
            kind: command_event_type(),
            command_id: envelope.command_id.clone(),
            trace_id: envelope.trace_id.clone(),
            issued_at: envelope.issued_at,
            ttl_ms: envelope.ttl_ms,
            target: StreamTarget {
                extension_id: client_id,
                tab_id: envelope.target.tab_id,
            },
            jws,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<RemoteError> for CallbackError {
    fn from(err: RemoteError) -> Self {
        Self {
            message: err.message,
            name: err.code,
        }
    }
}

impl From<CallbackError> for RemoteError {
    fn from(err: CallbackError) -> Self {
        Self {
            code: err.name,
            message: err.message,
        }
    }
}

/// Body POSTed to `reply.url`; the bearer token travels in the `Authorization` header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(rename = "type", default = "callback_type")]
    pub kind: String,
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub at: i64,
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallbackError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Value>,
}

impl CallbackPayload {
    pub fn ok(envelope: &CommandEnvelope, result: Value) -> Self {
        Self::build(envelope, CallbackStatus::Ok, Some(result), None)
    }

    pub fn error(envelope: &CommandEnvelope, error: impl Into<CallbackError>) -> Self {
        Self::build(envelope, CallbackStatus::Error, None, Some(error.into()))
    }

    pub fn from_outcome(envelope: &CommandEnvelope, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(result) => Self::ok(envelope, result),
            Err(err) => Self::error(envelope, err),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Value) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn build(
        envelope: &CommandEnvelope,
        status: CallbackStatus,
        result: Option<Value>,
        error: Option<CallbackError>,
    ) -> Self {
        Self {
            kind: callback_type(),
            command_id: envelope.command_id.clone(),
            trace_id: envelope.trace_id.clone(),
            at: now_ms(),
            status,
            result,
            error,
            telemetry: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CallbackStatus::Ok
    }

    /// Collapse into the outcome the server hands back to whoever awaits the command.
    pub fn outcome(&self) -> Result<Value, RemoteError> {
        match self.status {
            CallbackStatus::Ok => Ok(self.result.clone().unwrap_or(Value::Null)),
            CallbackStatus::Error => Err(self
                .error
                .clone()
                .map(RemoteError::from)
                .unwrap_or_else(|| RemoteError {
                    code: None,
                    message: "command failed".to_string(),
                })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soulbrowser_envelope::EnvelopeTarget;

    fn envelope() -> CommandEnvelope {
        CommandEnvelope::issue(
            "control-server",
            "browser-extension",
            EnvelopeTarget {
                tab_id: Some(TabId(7)),
                ..Default::default()
            },
            json!({"kind": "cdp.send", "method": "Page.reload"}),
            "http://127.0.0.1:8801/control/callback",
            30_000,
        )
    }

    #[test]
    fn callback_body_matches_wire_shape() {
        let env = envelope();
        let body = serde_json::to_value(CallbackPayload::error(
            &env,
            RemoteError {
                code: Some("TypeError".into()),
                message: "boom".into(),
            },
        ))
        .unwrap();
        assert_eq!(body["type"], "control.callback");
        assert_eq!(body["commandId"], env.command_id.0.as_str());
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], json!({"message": "boom", "name": "TypeError"}));
        assert!(body.get("result").is_none());
        assert!(body["at"].is_i64());
    }

    #[test]
    fn callback_without_type_still_parses() {
        let parsed: CallbackPayload = serde_json::from_value(json!({
            "commandId": "cmd_1",
            "traceId": "tr_1",
            "at": 1,
            "status": "ok",
            "result": {"frameId": "F"}
        }))
        .unwrap();
        assert_eq!(parsed.kind, CALLBACK_TYPE);
        assert_eq!(parsed.outcome().unwrap(), json!({"frameId": "F"}));
    }

    #[test]
    fn stream_command_names_the_extension() {
        let env = envelope();
        let event = StreamCommand::new(&env, ClientId("ext-1".into()), "a.b.c".into());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "control.command");
        assert_eq!(value["target"], json!({"extensionId": "ext-1", "tabId": 7}));
        assert_eq!(value["ttlMs"], 30_000);
    }
}
