use thiserror::Error;

use soulbrowser_core_types::{BusError, CommandId};

/// Failures raised by a live agent transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LinkError {
    #[error("connection closed")]
    Closed,
    #[error("no acknowledgement within {timeout_ms}ms")]
    AckTimeout { timeout_ms: u64 },
    #[error("transport send failed: {0}")]
    Send(String),
}

impl LinkError {
    /// Transport failures never leave the bus raw; they become routing or scheduling errors.
    pub fn into_bus_error(self, command_id: &CommandId) -> BusError {
        match self {
            LinkError::AckTimeout { timeout_ms } => BusError::PluginTimeoutAck {
                command_id: command_id.clone(),
                timeout_ms,
            },
            LinkError::Closed | LinkError::Send(_) => BusError::ClientDisconnected {
                command_id: command_id.clone(),
            },
        }
    }
}
