//! Server-side control plane: the callback ledger, the in-process agent link and the facade
//! that ties the bus components together.

mod bus;
mod link;
mod model;
mod plane;

pub use bus::{CallbackRejection, CommandRecord, CommandState, ControlBus};
pub use link::ChannelLink;
pub use model::{
    BatchItem, BatchItemOutcome, BatchReceipt, BatchRequest, ControlEvent, DispatchOutcome,
    DispatchRequest, EnqueueReceipt, EnqueueRequest, ExecutedCommand,
};
pub use plane::ControlPlane;
