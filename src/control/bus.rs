//! Callback ledger: which commands were issued, the bearer token each one's result callback
//! must present, and the last callback received.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use soulbrowser_agent_link::CallbackPayload;
use soulbrowser_core_types::{CallbackToken, CommandId, TraceId};

use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Pending,
    Done,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallbackRejection {
    #[error("Unknown commandId")]
    UnknownCommand,
    #[error("Command expired")]
    Expired,
    #[error("Invalid callback token")]
    InvalidToken,
}

impl CallbackRejection {
    pub fn code(&self) -> &'static str {
        match self {
            CallbackRejection::UnknownCommand => "UNKNOWN_COMMAND",
            CallbackRejection::Expired => "EXPIRED",
            CallbackRejection::InvalidToken => "INVALID_CALLBACK_TOKEN",
        }
    }
}

struct LedgerEntry {
    trace_id: TraceId,
    callback_token: CallbackToken,
    expires_at_ms: i64,
    state: CommandState,
    last_callback: Option<CallbackPayload>,
}

/// Public view of one ledger entry. The token never leaves the ledger.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub trace_id: TraceId,
    pub expires_at: i64,
    pub state: CommandState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_callback: Option<CallbackPayload>,
}

#[derive(Default)]
pub struct ControlBus {
    entries: DashMap<CommandId, LedgerEntry>,
}

impl ControlBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        command_id: CommandId,
        trace_id: TraceId,
        callback_token: CallbackToken,
        expires_at_ms: i64,
    ) {
        self.entries.insert(
            command_id,
            LedgerEntry {
                trace_id,
                callback_token,
                expires_at_ms,
                state: CommandState::Pending,
                last_callback: None,
            },
        );
        metrics::set_ledger_entries(self.entries.len());
    }

    /// A token minted for one command never authorises a callback for another.
    pub fn verify_callback_token(
        &self,
        command_id: &CommandId,
        token: &str,
        now_ms: i64,
    ) -> Result<(), CallbackRejection> {
        let entry = self
            .entries
            .get(command_id)
            .ok_or(CallbackRejection::UnknownCommand)?;
        if now_ms > entry.expires_at_ms {
            return Err(CallbackRejection::Expired);
        }
        let expected = entry.callback_token.as_str().as_bytes();
        if expected.ct_eq(token.as_bytes()).unwrap_u8() != 1 {
            return Err(CallbackRejection::InvalidToken);
        }
        Ok(())
    }

    /// Store `callback` as the command's latest and mark it done. Returns `None` for an id the
    /// ledger does not know.
    pub fn mark_callback(&self, callback: CallbackPayload) -> Option<CommandRecord> {
        let mut entry = self.entries.get_mut(&callback.command_id)?;
        if entry.trace_id != callback.trace_id {
            warn!(
                target: "control-bus",
                command_id = %callback.command_id,
                expected = %entry.trace_id,
                got = %callback.trace_id,
                "callback trace id differs from issued"
            );
        }
        entry.state = CommandState::Done;
        let command_id = callback.command_id.clone();
        entry.last_callback = Some(callback);
        Some(Self::record(&command_id, &entry))
    }

    /// Mark done without a callback body, for results that arrived over the agent socket.
    pub fn complete(&self, command_id: &CommandId) -> bool {
        match self.entries.get_mut(command_id) {
            Some(mut entry) => {
                entry.state = CommandState::Done;
                debug!(target: "control-bus", %command_id, "command completed over agent link");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, command_id: &CommandId) -> Option<CommandRecord> {
        self.entries
            .get(command_id)
            .map(|entry| Self::record(command_id, &entry))
    }

    pub fn discard(&self, command_id: &CommandId) -> bool {
        let removed = self.entries.remove(command_id).is_some();
        metrics::set_ledger_entries(self.entries.len());
        removed
    }

    /// Drop entries whose expiry is more than `retention_ms` in the past.
    pub fn sweep(&self, now_ms: i64, retention_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(i64::try_from(retention_ms).unwrap_or(i64::MAX));
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms >= cutoff);
        let removed = before.saturating_sub(self.entries.len());
        metrics::set_ledger_entries(self.entries.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(command_id: &CommandId, entry: &LedgerEntry) -> CommandRecord {
        CommandRecord {
            command_id: command_id.clone(),
            trace_id: entry.trace_id.clone(),
            expires_at: entry.expires_at_ms,
            state: entry.state,
            last_callback: entry.last_callback.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soulbrowser_agent_link::CallbackStatus;

    fn issued(bus: &ControlBus, expires_at_ms: i64) -> (CommandId, CallbackToken) {
        let command_id = CommandId::issue();
        let token = CallbackToken::issue();
        bus.register(
            command_id.clone(),
            TraceId("tr_1".into()),
            token.clone(),
            expires_at_ms,
        );
        (command_id, token)
    }

    #[test]
    fn token_is_bound_to_its_command() {
        let bus = ControlBus::default();
        let (first, first_token) = issued(&bus, 10_000);
        let (second, _) = issued(&bus, 10_000);

        assert_eq!(bus.verify_callback_token(&first, first_token.as_str(), 0), Ok(()));
        assert_eq!(
            bus.verify_callback_token(&second, first_token.as_str(), 0),
            Err(CallbackRejection::InvalidToken)
        );
        assert_eq!(
            bus.verify_callback_token(&CommandId("cmd_x".into()), first_token.as_str(), 0),
            Err(CallbackRejection::UnknownCommand)
        );
        assert_eq!(
            bus.verify_callback_token(&first, first_token.as_str(), 10_001),
            Err(CallbackRejection::Expired)
        );
        assert_eq!(CallbackRejection::Expired.to_string(), "Command expired");
    }

    #[test]
    fn callback_marks_done_and_sweep_honours_retention() {
        let bus = ControlBus::default();
        let (command_id, _) = issued(&bus, 1_000);
        let record = bus
            .mark_callback(CallbackPayload {
                kind: "control.callback".into(),
                command_id: command_id.clone(),
                trace_id: TraceId("tr_1".into()),
                at: 500,
                status: CallbackStatus::Ok,
                result: Some(json!({"ok": true})),
                error: None,
                telemetry: None,
            })
            .unwrap();
        assert_eq!(record.state, CommandState::Done);
        assert_eq!(
            bus.get(&command_id).unwrap().last_callback.unwrap().result,
            Some(json!({"ok": true}))
        );

        assert_eq!(bus.sweep(1_500, 1_000), 0);
        assert_eq!(bus.sweep(2_001, 1_000), 1);
        assert!(bus.is_empty());
    }
}
