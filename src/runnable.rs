// Licensed under the Apache License, Version 2.0.

//! A one-shot callable bundle (spec.md §2 "Runnable").
//!
//! The C reference bundles `(fn, arg, free_arg)` because C has no owning
//! closures: the argument pointer and its deallocator must travel together.
//! In Rust, `Box<dyn FnOnce() -> Result<()> + Send>` already owns whatever
//! its captures own and drops them automatically when the closure is
//! dropped or after it runs — so `Runnable` has no `free_arg` field. This is
//! a deliberate simplification over the C shape, recorded in DESIGN.md.

use crate::error::Result;

/// A boxed, one-shot unit of work.
pub struct Runnable {
    body: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl Runnable {
    pub fn new(body: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Runnable {
            body: Box::new(body),
        }
    }

    /// Invokes the bundled callable exactly once, consuming it.
    pub fn start(self) -> Result<()> {
        (self.body)()
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn start_invokes_body_exactly_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let r = Runnable::new(move || {
            flag2.store(true, Ordering::SeqCst);
            Ok(())
        });
        r.start().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn captured_drop_runs_when_never_started() {
        struct DropSentinel(Arc<AtomicBool>);
        impl Drop for DropSentinel {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicBool::new(false));
        let sentinel = DropSentinel(Arc::clone(&dropped));
        let r = Runnable::new(move || {
            let _s = &sentinel;
            Ok(())
        });
        drop(r);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
