//! Cancellation tokens (`spec.md` §3/§5): "a boolean flag with monotonic
//! set-once semantics... multiple readers observe it; setting is
//! idempotent."
//!
//! Grounded in the shape of `examples/ThomasHabets-rustradio/src/mtgraph.rs`'s
//! `CancellationToken` (cloned and shared across the threads it cancels),
//! but backed by `Rc<Cell<bool>>` rather than `Arc<AtomicBool>`: this
//! crate's event loop is single-threaded (`spec.md` §5 — "one cooperative
//! event loop... executing on a single OS thread"), so a non-atomic,
//! non-`Send` flag is the correct, narrower tool, and its not being `Send`
//! is itself a compile-time enforcement of the spec's "object heap is
//! single-threaded" invariant.

use std::cell::Cell;
use std::rc::Rc;

/// A cheaply-cloned, set-once cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Rc<Cell<bool>>);

impl CancellationToken {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(false)))
    }

    /// Set the token. Idempotent: cancelling twice is the same as once.
    pub fn cancel(&self) {
        self.0.set(true);
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let t = CancellationToken::new();
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent_and_observed_by_clones() {
        let t = CancellationToken::new();
        let clone = t.clone();
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
        assert!(clone.is_cancelled());
    }
}
