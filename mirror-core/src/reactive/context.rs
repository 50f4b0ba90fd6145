//! Dependency Context
//!
//! The dependency context tracks which derivation is currently running.
//! This is what makes tracking automatic: when an image read unwraps a cell,
//! the cell is recorded as a dependency of whatever derivation is on top of
//! the stack.
//!
//! # Implementation
//!
//! We use a thread-local stack. A mirror pushes itself at the start of every
//! recompute and pops itself when the recompute finishes, restoring the
//! enclosing derivation. Pushing happens only through [`ContextGuard`], which
//! pops on drop, so the stack stays balanced even if a user function panics.
//!
//! Mutation is crate-private: outside code can query the stack but never
//! push or pop it.

use std::cell::RefCell;
use std::rc::Rc;

use super::subscriber::{Dependency, Derivation, DerivationId};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Rc<dyn Derivation>>> = RefCell::new(Vec::new());
}

/// Read-only access to the thread's dependency context stack.
pub struct DependencyContext;

impl DependencyContext {
    /// Push `derivation`, making it the active one until the returned guard
    /// is dropped.
    pub(crate) fn enter(derivation: Rc<dyn Derivation>) -> ContextGuard {
        let derivation_id = derivation.id();
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(derivation));
        ContextGuard { derivation_id }
    }

    /// Check if there is an active derivation.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The active derivation, if any.
    pub fn current() -> Option<DerivationId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|derivation| derivation.id()))
    }

    /// Number of derivations currently nested on this thread.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }

    /// Record `dependency` on the active derivation. Outside any derivation
    /// this does nothing.
    pub(crate) fn track(dependency: Rc<dyn Dependency>) {
        let current = CONTEXT_STACK.with(|stack| stack.borrow().last().cloned());
        if let Some(derivation) = current {
            derivation.record(dependency);
        }
    }
}

/// Guard that pops the context when dropped.
pub(crate) struct ContextGuard {
    derivation_id: DerivationId,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let popped = CONTEXT_STACK.with(|stack| stack.borrow_mut().pop());

        match popped {
            Some(derivation) => debug_assert_eq!(
                derivation.id(),
                self.derivation_id,
                "DependencyContext mismatch: expected {}, got {}",
                self.derivation_id,
                derivation.id()
            ),
            None => debug_assert!(false, "DependencyContext popped while empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscriber::testing::Recorder;
    use crate::reactive::Cell;

    #[test]
    fn context_tracks_derivation() {
        let recorder = Recorder::new();

        assert!(!DependencyContext::is_active());
        assert!(DependencyContext::current().is_none());

        {
            let _ctx = DependencyContext::enter(recorder.clone());

            assert!(DependencyContext::is_active());
            assert_eq!(DependencyContext::current(), Some(recorder.id));
        }

        // Context should be cleaned up after drop
        assert!(!DependencyContext::is_active());
        assert_eq!(DependencyContext::depth(), 0);
    }

    #[test]
    fn nested_contexts() {
        let outer = Recorder::new();
        let inner = Recorder::new();

        {
            let _outer = DependencyContext::enter(outer.clone());
            assert_eq!(DependencyContext::current(), Some(outer.id));

            {
                let _inner = DependencyContext::enter(inner.clone());
                assert_eq!(DependencyContext::current(), Some(inner.id));
                assert_eq!(DependencyContext::depth(), 2);
            }

            // After inner context drops, outer should be current
            assert_eq!(DependencyContext::current(), Some(outer.id));
        }

        assert!(DependencyContext::current().is_none());
    }

    #[test]
    fn reads_are_attributed_to_the_innermost_derivation() {
        let outer = Recorder::new();
        let inner = Recorder::new();
        let a = Cell::new(1);
        let b = Cell::new(2);
        let c = Cell::new(3);

        {
            let _outer = DependencyContext::enter(outer.clone());
            a.track();
            {
                let _inner = DependencyContext::enter(inner.clone());
                b.track();
            }
            c.track();
        }

        assert_eq!(*outer.recorded.borrow(), vec![a.id(), c.id()]);
        assert_eq!(*inner.recorded.borrow(), vec![b.id()]);
    }

    #[test]
    fn tracking_outside_a_derivation_is_a_plain_read() {
        let a = Cell::new(7);
        assert_eq!(a.track(), 7);
        assert!(!DependencyContext::is_active());
    }
}
