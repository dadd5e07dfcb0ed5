//! In-process transport and shutdown control.

pub mod inprocess;
pub mod shutdown;

pub use inprocess::{CallOutcome, InProcessServer, PendingCall};
pub use shutdown::{InFlightGuard, ServingState, ShutdownController};
