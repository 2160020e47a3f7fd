//! Run orchestration: the pagination state machine and its control surface.

pub mod control;
pub mod runner;

pub use control::{ControlHandle, ControlSignal, Mailbox, SignalAck};
pub use runner::{PaginationRunner, RunEnvironment};
