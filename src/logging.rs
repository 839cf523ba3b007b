// Licensed under the Apache License, Version 2.0.

//! `tracing` initialization for binaries built on this crate.
//!
//! The library itself only ever calls `tracing::{debug,warn,error}!` — it
//! never installs a subscriber. This module is the one place a `main()`
//! should call to get human-readable, `RUST_LOG`-filterable output, mirroring
//! how `r3bl_tui`'s binaries wire up `tracing_subscriber`.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading its filter from
/// `RUST_LOG`, defaulting to `info` when unset.
///
/// Idempotent: a second call is a no-op rather than a panic, so tests that
/// each want logging enabled don't have to coordinate.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
