//! Connected-agent bookkeeping: who is attached, which tab they drive, and whether they are
//! still alive.

pub mod api;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod model;
pub mod state;
#[cfg(test)]
mod test_support;

pub use api::ClientLink;
pub use errors::LinkError;
pub use health::{
    CheckReport, HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatStatus,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_STALE_THRESHOLD,
};
pub use model::{BrowserClient, ClientEvent, ClientMeta, ClientSnapshot, ConnectionStats};
pub use state::{ClientRegistry, TargetFallback};
