//! Dispatch side of the control bus.
//!
//! [`CommandRouter`] owns the pending-command table. [`ActionScheduler`] layers per-task FIFO
//! queues and the ack/exec deadline pair over it, and [`TaskLock`] guards a task against
//! concurrent distinct actions while replaying cached successes.

pub mod action;
pub mod metrics;
pub mod model;
pub mod router;
pub mod task_lock;

pub use action::{
    ActionScheduler, ActionTimeouts, ScheduledAction, DEFAULT_ACK_TIMEOUT, DEFAULT_EXEC_TIMEOUT,
};
pub use model::{CommandResponse, OutboundCommand};
pub use router::{CommandRouter, PendingReceipt, DEFAULT_COMMAND_TIMEOUT};
pub use task_lock::{LockOutcome, TaskLock, DEFAULT_RESULT_TTL};
