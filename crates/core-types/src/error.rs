use thiserror::Error;

use crate::ids::{ActionId, CommandId, TabId, TaskId};

/// Error carried back by a remote agent inside a response or callback.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteError {
    #[cfg_attr(feature = "serde-full", serde(default))]
    pub code: Option<String>,
    pub message: String,
}

/// Every failure a public bus operation can report.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BusError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlg(String),
    #[error("signature header has no kid")]
    MissingKid,
    #[error("envelope expired at {expired_at_ms}")]
    Expired { expired_at_ms: i64 },
    #[error("no verification key for kid {0}")]
    UnknownKid(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("key set unavailable: {0}")]
    JwksUnavailable(String),
    #[error("no browser client available")]
    NoClient { tab_id: Option<TabId> },
    #[error("command {command_id} timed out after {timeout_ms}ms")]
    CommandTimeout {
        command_id: CommandId,
        timeout_ms: u64,
    },
    #[error("client disconnected before command {command_id} completed")]
    ClientDisconnected { command_id: CommandId },
    #[error("plugin did not acknowledge {command_id} within {timeout_ms}ms")]
    PluginTimeoutAck {
        command_id: CommandId,
        timeout_ms: u64,
    },
    #[error("plugin did not finish {command_id} within {timeout_ms}ms")]
    PluginTimeoutExec {
        command_id: CommandId,
        timeout_ms: u64,
    },
    #[error("task {task_id} has in-flight action {locked_by}")]
    TaskLocked { task_id: TaskId, locked_by: ActionId },
    #[error("remote error: {}", .0.message)]
    Remote(RemoteError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::Malformed(_) => "MALFORMED",
            BusError::UnsupportedAlg(_) => "UNSUPPORTED_ALG",
            BusError::MissingKid => "MISSING_KID",
            BusError::Expired { .. } => "EXPIRED",
            BusError::UnknownKid(_) => "UNKNOWN_KID",
            BusError::InvalidSignature => "INVALID_SIGNATURE",
            BusError::JwksUnavailable(_) => "JWKS_UNAVAILABLE",
            BusError::NoClient { .. } => "NO_CLIENT",
            BusError::CommandTimeout { .. } => "COMMAND_TIMEOUT",
            BusError::ClientDisconnected { .. } => "CLIENT_DISCONNECTED",
            BusError::PluginTimeoutAck { .. } => "PLUGIN_TIMEOUT_ACK",
            BusError::PluginTimeoutExec { .. } => "PLUGIN_TIMEOUT_EXEC",
            BusError::TaskLocked { .. } => "TASK_LOCKED",
            BusError::Remote(_) => "REMOTE_ERROR",
            BusError::Internal(_) => "INTERNAL",
        }
    }

    /// Envelope failures are fatal to the single command that carried them.
    pub fn is_envelope(&self) -> bool {
        matches!(
            self,
            BusError::Malformed(_)
                | BusError::UnsupportedAlg(_)
                | BusError::MissingKid
                | BusError::Expired { .. }
                | BusError::UnknownKid(_)
                | BusError::InvalidSignature
        )
    }

    pub fn remote(message: impl Into<String>) -> Self {
        BusError::Remote(RemoteError {
            code: None,
            message: message.into(),
        })
    }
}
