//! Shared primitives for the SoulBrowser control bus.
//!
//! Identifiers are thin newtypes so that a command id can never be passed where a trace id
//! is expected. [`BusError`] is the single error taxonomy every component reports through.

mod error;
mod ids;

pub use error::{BusError, RemoteError};
pub use ids::{
    ActionId, CallbackToken, ClientId, CommandId, ConnectionId, TabId, TaskId, TraceId,
};

/// Milliseconds since the unix epoch, the time base used on the wire.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
