//! Subscriber types for the reactive system.
//!
//! A derivation is any computation that can sit on the dependency context
//! stack and listen to cells. Cells never own their listeners: each listener
//! entry is a [`Subscriber`], which pairs the derivation's id with a weak
//! handle so a derivation that is no longer referenced simply stops
//! receiving notifications.

use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use super::CellId;
use crate::error::Result;

/// Unique identifier for a derivation.
///
/// Each derivation gets a unique ID when created. Listener lists use it to
/// avoid duplicate subscriptions and to remove entries on detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivationId(u64);

impl DerivationId {
    /// Generate a new unique derivation ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for DerivationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DerivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// A computation that collects dependencies while it runs and is notified
/// when one of them is written or ends.
pub(crate) trait Derivation {
    fn id(&self) -> DerivationId;

    /// Record a cell that was read while this derivation was on top of the
    /// context stack.
    fn record(&self, dependency: Rc<dyn Dependency>);

    /// Called by a cell this derivation listens to. `source` is the cell
    /// that fired, which is either a dependency or one of their `end` cells.
    fn notify(&self, source: CellId) -> Result<()>;
}

/// Type-erased view of a cell, as seen by the derivations that depend on it.
pub(crate) trait Dependency {
    fn cell_id(&self) -> CellId;

    fn is_ended(&self) -> bool;

    /// Add a listener. Adding a derivation that is already listening is a
    /// no-op.
    fn subscribe(&self, subscriber: Subscriber);

    fn unsubscribe(&self, id: DerivationId);

    /// The `end` companion of this cell, if it has one.
    fn end_dependency(&self) -> Option<Rc<dyn Dependency>>;
}

/// One entry in a cell's listener list.
#[derive(Clone)]
pub(crate) struct Subscriber {
    id: DerivationId,
    derivation: Weak<dyn Derivation>,
}

impl Subscriber {
    pub(crate) fn new(id: DerivationId, derivation: Weak<dyn Derivation>) -> Self {
        Self { id, derivation }
    }

    pub(crate) fn id(&self) -> DerivationId {
        self.id
    }

    /// Forward a notification. A derivation that has been dropped is
    /// skipped silently.
    pub(crate) fn notify(&self, source: CellId) -> Result<()> {
        match self.derivation.upgrade() {
            Some(derivation) => derivation.notify(source),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("alive", &(self.derivation.strong_count() > 0))
            .finish()
    }
}

/// Test doubles shared by the reactive module tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// A derivation that only remembers what happened to it.
    pub(crate) struct Recorder {
        pub(crate) id: DerivationId,
        pub(crate) recorded: RefCell<Vec<CellId>>,
        pub(crate) notified: RefCell<Vec<CellId>>,
    }

    impl Recorder {
        pub(crate) fn new() -> Rc<Self> {
            Rc::new(Self {
                id: DerivationId::new(),
                recorded: RefCell::new(Vec::new()),
                notified: RefCell::new(Vec::new()),
            })
        }

        pub(crate) fn subscriber(self: &Rc<Self>) -> Subscriber {
            let derivation: Rc<dyn Derivation> = self.clone();
            Subscriber::new(self.id, Rc::downgrade(&derivation))
        }
    }

    impl Derivation for Recorder {
        fn id(&self) -> DerivationId {
            self.id
        }

        fn record(&self, dependency: Rc<dyn Dependency>) {
            self.recorded.borrow_mut().push(dependency.cell_id());
        }

        fn notify(&self, source: CellId) -> Result<()> {
            self.notified.borrow_mut().push(source);
            Ok(())
        }
    }
}
