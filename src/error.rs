// Licensed under the Apache License, Version 2.0.

//! The error taxonomy shared by every module in this crate.
//!
//! Every fallible operation in `pipeline_rt` returns [`Result<T>`], an alias
//! for `std::result::Result<T, Error>`. [`Error`] enumerates the error kinds
//! by *kind*, not by call site, so that callers can match on the same small
//! vocabulary everywhere (argument faults, object faults, resource faults,
//! coordination outcomes, discovery).

use std::fmt;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds a `pipeline_rt` API can return.
///
/// Coordination outcomes ([`Error::TimedOut`], [`Error::WakeupRequested`],
/// [`Error::NotOperational`], [`Error::Interrupted`]) are not necessarily
/// failures: callers that asked for them (e.g. [`Error::TimedOut`] from a
/// finite-timeout wait) are expected to handle them as first-class outcomes,
/// not log-and-bail errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument was out of the allowed domain (e.g. a zero-sized batch).
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    /// An argument was numerically out of range.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// A value was smaller than the minimum the API allows (e.g. an
    /// `interval` below the periodic-task floor).
    #[error("value too small: {0}")]
    TooSmall(String),

    /// A handle is not (or no longer) registered / known to the runtime.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// The requested transition is not legal from the object's current state.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// A name or resource that must be unique already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object has already been permanently halted.
    #[error("already halted: {0}")]
    AlreadyHalted(String),

    /// The operation requires the object to have been started first.
    #[error("not started: {0}")]
    NotStarted(String),

    /// The caller is not the process/thread that created the object.
    #[error("not the owner: {0}")]
    NotOwner(String),

    /// A lookup (by name or handle) found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A finite-timeout wait elapsed before its condition was satisfied.
    #[error("timed out")]
    TimedOut,

    /// A blocking call returned early because of a cooperative wakeup, not
    /// because of an error or a timeout.
    #[error("wakeup requested")]
    WakeupRequested,

    /// The system is shutting down (or has shut down) and the requested
    /// operation can never complete.
    #[error("not operational: system is shutting down or shut down")]
    NotOperational,

    /// The calling thread (or the object it was waiting on) was cancelled.
    #[error("interrupted")]
    Interrupted,

    /// An OS call failed; the inner `std::io::Error` carries the errno.
    #[error("posix API error: {0}")]
    PosixApiError(#[source] std::io::Error),

    /// The value has no well-defined answer (e.g. CPU affinity before a
    /// mask is installed and the thread has not started).
    #[error("not defined")]
    NotDefined,

    /// The operation is structurally forbidden (e.g. joining an
    /// auto-delete thread).
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// Catch-all for failures that do not fit a more specific kind.
    #[error("failure: {0}")]
    AnyFailure(String),
}

impl Error {
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Error::InvalidArgs(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidStateTransition(msg.into())
    }
}

/// A fatal, unrecoverable invariant violation.
///
/// spec.md §7: "Fatal invariant violations (worker exit count mismatch,
/// duplicate finalization, lock address mismatch on callout-stage freeup)
/// abort the process; this is a deliberate design choice because they imply
/// memory corruption." Normal error paths must never reach this; it exists
/// only for conditions that indicate the runtime's own bookkeeping is
/// already wrong.
#[track_caller]
pub fn fatal(msg: impl fmt::Display) -> ! {
    tracing::error!(location = %std::panic::Location::caller(), "fatal invariant violation: {msg}");
    panic!("fatal invariant violation: {msg}");
}
