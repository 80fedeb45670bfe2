//! Call lifecycle: the session state machine and the coordinator task
//! that drives it.

mod coordinator;
mod state;

pub use coordinator::{
    CallCoordinator, CallError, CallEvent, CallHandle, CallSnapshot, CoordinatorConfig,
};
pub use state::{CallPhase, CallSession, CallState, CallTransition, InvalidTransition};
