// Licensed under the Apache License, Version 2.0.

//! The process-wide stage-name registry (spec.md §3 "Global pipeline-stage
//! registry").
//!
//! The reference keeps two maps "in lockstep" (`name → stage`, `stage →
//! true`) reinitialized in `atfork_child`; since this crate never forks, a
//! single name set is enough to enforce the one invariant that matters
//! across the process: no two live stages share a name.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Tracks which stage names are currently registered.
///
/// One instance is usually shared process-wide (see [`global`]), but nothing
/// requires that — tests construct their own so name collisions in one test
/// can't leak into another.
#[derive(Default)]
pub struct StageRegistry {
    names: Mutex<HashSet<String>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        StageRegistry::default()
    }

    /// Reserves `name`, failing with [`Error::AlreadyExists`] if it is
    /// already taken.
    pub fn register(&self, name: &str) -> Result<()> {
        let mut names = self.names.lock().unwrap();
        if !names.insert(name.to_string()) {
            return Err(Error::AlreadyExists(format!(
                "pipeline stage {name:?} is already registered"
            )));
        }
        Ok(())
    }

    /// Releases `name`, called from `destroy()`. A no-op if the name isn't
    /// held (idempotent destroy).
    pub fn unregister(&self, name: &str) {
        self.names.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().unwrap().contains(name)
    }
}

use std::sync::OnceLock;

/// The process-wide registry instance, lazily created on first use.
pub fn global() -> &'static StageRegistry {
    static REGISTRY: OnceLock<StageRegistry> = OnceLock::new();
    REGISTRY.get_or_init(StageRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_name_rejected() {
        let reg = StageRegistry::new();
        reg.register("stage-a").unwrap();
        assert!(matches!(
            reg.register("stage-a"),
            Err(Error::AlreadyExists(_))
        ));
        reg.unregister("stage-a");
        reg.register("stage-a").unwrap();
    }
}
