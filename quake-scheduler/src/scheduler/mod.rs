//! Scheduler: owns the tick loop and the status shown to observers.
//!
//! The loop waits for the next interval boundary (or a stop signal), runs one
//! tick through the [`Executor`](crate::executor::Executor), records the
//! resulting execution, and checks its bounds. Health checks run on their own
//! timer beside it and never delay a tick.

mod history;
mod service;
mod status;

pub use history::ExecutionHistory;
pub use service::{Scheduler, SchedulerBuilder};
pub use status::{SchedulerState, SchedulerStatus, StopReason};
