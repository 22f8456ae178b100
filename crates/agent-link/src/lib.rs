//! Agent side of the SoulBrowser control bus.
//!
//! An agent keeps one control connection alive with [`ReconnectLoop`], accepts signed
//! commands through [`EnvelopeIntake`] and reports results with [`CallbackClient`].

mod callback;
mod errors;
mod intake;
mod reconnect;
pub mod wire;

pub use callback::CallbackClient;
pub use errors::AgentError;
pub use intake::EnvelopeIntake;
pub use reconnect::{
    Connection, Connector, LinkState, ReconnectConfig, ReconnectHandle, ReconnectLoop,
    ReconnectionManager,
};
pub use wire::{CallbackError, CallbackPayload, CallbackStatus, StreamCommand, StreamTarget};
