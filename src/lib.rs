// Licensed under the Apache License, Version 2.0.

//! A named, multi-worker pipeline-stage runtime plus a callout task
//! scheduler built on top of it.
//!
//! [`pipeline::Stage`] owns a fixed set of worker threads running
//! fetch/main/throw loops that pause and resume together under a barrier
//! and shut down gracefully or immediately. [`callout::Scheduler`] is one
//! concrete consumer: a master loop dispatching urgent, timed, and idle
//! tasks either inline or onto a [`callout::CalloutStage`] (itself a
//! [`pipeline::Stage`] specialization).
//!
//! [`global_state::GlobalState`] is the process-wide lifecycle gate every
//! worker and the callout main loop wait on before doing any work.

pub mod affinity;
pub mod bbq;
pub mod callout;
pub mod config;
pub mod error;
pub mod global_state;
pub mod logging;
pub mod pipeline;
pub mod runnable;
pub mod thread_handle;
pub mod time;

pub use error::{Error, Result};
