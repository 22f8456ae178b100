mod router;
mod state;

pub use router::build_router;
pub(crate) use state::ServeState;
