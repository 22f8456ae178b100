//! SoulBrowser control plane
//!
//! Signs commands for browser-resident agents, routes them over agent WebSockets or the live
//! SSE stream, and correlates the results that come back.

pub mod cli;
pub mod config;
pub mod control;
pub mod metrics;
pub mod server;

pub use config::ControlConfig;
pub use control::{ControlEvent, ControlPlane, DispatchOutcome, DispatchRequest};
pub use server::build_router;
