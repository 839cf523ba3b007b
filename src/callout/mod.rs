// Licensed under the Apache License, Version 2.0.

//! The callout task scheduler: urgent/timed/idle task dispatch built on top
//! of [`crate::pipeline`] (spec.md §3-4.4 "Callout task", "Callout
//! scheduler").

mod queue;
mod scheduler;
mod stage;
mod task;

pub use queue::TimedQueue;
pub use scheduler::Scheduler;
pub use stage::{CalloutStage, ExecOutcome, Executioner};
pub use task::{CalloutTask, TaskContext, TaskId, TaskProc, TaskStateTable, TaskStatus};
