//! CDP session bookkeeping for browser tabs.

pub mod events;
pub mod metrics;
pub mod model;
pub mod registry;

pub use events::{
    CdpEvent, CdpEventIngest, EventFilter, EventRing, SessionChange, EVENT_QUERY_LIMIT,
    EVENT_RING_CAPACITY,
};
pub use model::{ChildSession, SessionType, TabSessions, TabSummary, TargetInfo};
pub use registry::SessionRegistry;
