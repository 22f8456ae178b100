use thiserror::Error;

use soulbrowser_core_types::{BusError, CommandId};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Envelope(#[from] BusError),
    #[error("command {command_id} was already accepted")]
    Replay { command_id: CommandId },
    #[error("envelope addressed to {found:?}, expected {expected:?}")]
    Audience { expected: String, found: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("callback transport failed: {0}")]
    Callback(#[from] reqwest::Error),
    #[error("callback rejected with status {status}: {body}")]
    CallbackRejected { status: u16, body: String },
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Envelope(err) => err.code(),
            AgentError::Replay { .. } => "REPLAY",
            AgentError::Audience { .. } => "AUDIENCE_MISMATCH",
            AgentError::Connect(_) => "CONNECT_FAILED",
            AgentError::Callback(_) => "CALLBACK_FAILED",
            AgentError::CallbackRejected { .. } => "CALLBACK_REJECTED",
        }
    }
}
