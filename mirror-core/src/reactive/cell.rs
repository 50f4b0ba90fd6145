//! Cell Implementation
//!
//! A Cell is the primitive reactive value container. It holds a value and a
//! list of the derivations that currently depend on it.
//!
//! # How Cells Work
//!
//! 1. `get` reads the value. It never records a dependency; tracking happens
//!    in the image layer (or through [`Cell::track`]).
//!
//! 2. `set` stores a new value and synchronously notifies every listener
//!    before returning. A listener that recomputes may write further cells,
//!    and those writes finish first (depth-first propagation).
//!
//! 3. Every cell owns an `end` companion, a `Cell<bool>`. Writing `true` to
//!    it terminates the host: listeners of the end cell are notified exactly
//!    once and later writes to the host are rejected.
//!
//! # Ownership
//!
//! Cells are `Rc`-based and single-threaded. Listener entries are weak, so a
//! cell never keeps a derivation alive. A mirror's own output cell is the
//! one exception: it holds its driving derivation strongly.

use std::cell::{OnceCell, RefCell};
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::context::DependencyContext;
use super::subscriber::{Dependency, Derivation, DerivationId, Subscriber};
use crate::error::{ReactiveError, Result};

/// Unique identifier for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

type Listeners = SmallVec<[Subscriber; 4]>;

pub(crate) struct CellInner<T: 'static> {
    id: CellId,
    value: RefCell<T>,
    listeners: RefCell<Listeners>,
    /// The `end` companion. End cells themselves have none.
    end: Option<Cell<bool>>,
    /// Set only on end cells: decides whether a written value terminates
    /// the host.
    terminal: Option<fn(&T) -> bool>,
    /// The derivation that writes this cell, if it is a mirror's output.
    driver: OnceCell<Rc<dyn Derivation>>,
}

impl<T: 'static> CellInner<T> {
    fn is_ended(&self) -> bool {
        self.end.as_ref().is_some_and(|end| *end.inner.value.borrow())
    }

    /// Notify a snapshot of the listener list. Listeners detach and
    /// re-attach while we iterate, so the live list is never borrowed
    /// across a notification. The first failure stops propagation and is
    /// returned to the writer.
    fn notify_listeners(&self) -> Result<()> {
        let snapshot: Listeners = self.listeners.borrow().clone();
        for subscriber in &snapshot {
            subscriber.notify(self.id)?;
        }
        Ok(())
    }
}

impl<T: 'static> Dependency for CellInner<T> {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn is_ended(&self) -> bool {
        CellInner::is_ended(self)
    }

    fn subscribe(&self, subscriber: Subscriber) {
        let mut listeners = self.listeners.borrow_mut();
        if listeners.iter().all(|existing| existing.id() != subscriber.id()) {
            listeners.push(subscriber);
        }
    }

    fn unsubscribe(&self, id: DerivationId) {
        let mut listeners = self.listeners.borrow_mut();
        if let Some(index) = listeners.iter().position(|existing| existing.id() == id) {
            listeners.swap_remove(index);
        }
    }

    fn end_dependency(&self) -> Option<Rc<dyn Dependency>> {
        self.end
            .as_ref()
            .map(|end| end.inner.clone() as Rc<dyn Dependency>)
    }
}

/// A reactive value container.
///
/// Cloning a `Cell` creates a new handle to the **same** cell; identity is
/// the shared allocation, exposed as [`CellId`].
///
/// # Example
///
/// ```rust
/// use mirror_core::Cell;
///
/// let count = Cell::new(0);
/// count.set(5).unwrap();
/// assert_eq!(count.get(), 5);
/// ```
pub struct Cell<T: 'static> {
    inner: Rc<CellInner<T>>,
}

impl<T: Clone + 'static> Cell<T> {
    /// Create a new cell with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(CellInner {
                id: CellId::new(),
                value: RefCell::new(value),
                listeners: RefCell::new(SmallVec::new()),
                end: Some(Cell::<bool>::end_cell()),
                terminal: None,
                driver: OnceCell::new(),
            }),
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Read the current value without recording a dependency.
    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Read the current value and record this cell as a dependency of the
    /// active derivation, if there is one.
    ///
    /// Ended cells are still readable; the active derivation ignores them
    /// because they can no longer change.
    pub fn track(&self) -> T {
        DependencyContext::track(self.as_dependency());
        self.get()
    }

    /// Store a new value and notify every listener before returning.
    ///
    /// A listener failure (for instance a mirror whose function returned an
    /// error) stops propagation and is returned here.
    pub fn set(&self, value: T) -> Result<()> {
        if self.is_ended() {
            return Err(ReactiveError::Ended(self.id()));
        }

        if let Some(terminal) = self.inner.terminal {
            return self.set_terminal(terminal, value);
        }

        *self.inner.value.borrow_mut() = value;
        trace!(cell = %self.id(), listeners = self.listener_count(), "cell written");
        self.inner.notify_listeners()
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let current = self.inner.value.borrow();
            f(&current)
        };
        self.set(next)
    }

    fn set_terminal(&self, terminal: fn(&T) -> bool, value: T) -> Result<()> {
        // Fires exactly once.
        if terminal(&self.inner.value.borrow()) {
            return Ok(());
        }

        let closing = terminal(&value);
        *self.inner.value.borrow_mut() = value;
        if !closing {
            return Ok(());
        }

        debug!(cell = %self.id(), listeners = self.listener_count(), "end fired");
        let result = self.inner.notify_listeners();
        self.inner.listeners.borrow_mut().clear();
        result
    }

    /// The `end` companion of this cell. End cells have no end of their
    /// own, so this is `None` only for them.
    pub fn end(&self) -> Option<&Cell<bool>> {
        self.inner.end.as_ref()
    }

    /// Terminate the cell by writing `true` to its end companion.
    ///
    /// On an end cell this does nothing.
    pub fn terminate(&self) -> Result<()> {
        match &self.inner.end {
            Some(end) => end.set(true),
            None => Ok(()),
        }
    }

    /// Whether the end companion has fired.
    pub fn is_ended(&self) -> bool {
        self.inner.is_ended()
    }

    /// Get the number of listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// IDs of the derivations currently listening, in list order.
    pub fn listener_ids(&self) -> Vec<DerivationId> {
        self.inner
            .listeners
            .borrow()
            .iter()
            .map(Subscriber::id)
            .collect()
    }

    /// Whether two handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn as_dependency(&self) -> Rc<dyn Dependency> {
        self.inner.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakCell<T> {
        WeakCell(Rc::downgrade(&self.inner))
    }

    /// Tie the lifetime of `driver` to this cell.
    pub(crate) fn set_driver(&self, driver: Rc<dyn Derivation>) {
        // A cell is driven by at most one mirror, set once at construction.
        let _ = self.inner.driver.set(driver);
    }
}

impl Cell<bool> {
    fn end_cell() -> Self {
        Self {
            inner: Rc::new(CellInner {
                id: CellId::new(),
                value: RefCell::new(false),
                listeners: RefCell::new(SmallVec::new()),
                end: None,
                terminal: Some(is_true),
                driver: OnceCell::new(),
            }),
        }
    }
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Weak handle used by a mirror to reach its own output cell.
pub(crate) struct WeakCell<T: 'static>(Weak<CellInner<T>>);

impl<T: 'static> WeakCell<T> {
    pub(crate) fn upgrade(&self) -> Option<Cell<T>> {
        self.0.upgrade().map(|inner| Cell { inner })
    }
}

impl<T: 'static> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Default + 'static> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: 'static> PartialEq for Cell<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Debug + 'static> Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .field("listeners", &self.inner.listeners.borrow().len())
            .field("ended", &self.inner.is_ended())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscriber::testing::Recorder;

    #[test]
    fn cell_get_and_set() {
        let cell = Cell::new(0);
        assert_eq!(cell.get(), 0);

        cell.set(42).unwrap();
        assert_eq!(cell.get(), 42);
    }

    #[test]
    fn cell_update() {
        let cell = Cell::new(10);
        cell.update(|v| v + 5).unwrap();
        assert_eq!(cell.get(), 15);
    }

    #[test]
    fn default_cell_holds_default_value() {
        let cell: Cell<String> = Cell::default();
        assert_eq!(cell.get(), "");
    }

    #[test]
    fn cell_notifies_listeners_on_every_write() {
        let cell = Cell::new(0);
        let recorder = Recorder::new();
        cell.as_dependency().subscribe(recorder.subscriber());

        cell.set(1).unwrap();
        cell.set(2).unwrap();

        assert_eq!(*recorder.notified.borrow(), vec![cell.id(), cell.id()]);
    }

    #[test]
    fn subscribing_twice_keeps_one_entry() {
        let cell = Cell::new(0);
        let recorder = Recorder::new();
        let dependency = cell.as_dependency();

        dependency.subscribe(recorder.subscriber());
        dependency.subscribe(recorder.subscriber());
        assert_eq!(cell.listener_count(), 1);
        assert_eq!(cell.listener_ids(), vec![recorder.id]);

        dependency.unsubscribe(recorder.id);
        assert_eq!(cell.listener_count(), 0);

        cell.set(1).unwrap();
        assert!(recorder.notified.borrow().is_empty());
    }

    #[test]
    fn end_fires_exactly_once() {
        let cell = Cell::new(0);
        let end = cell.end().unwrap().clone();
        let recorder = Recorder::new();
        end.as_dependency().subscribe(recorder.subscriber());

        cell.terminate().unwrap();
        cell.terminate().unwrap();
        end.set(true).unwrap();

        assert_eq!(*recorder.notified.borrow(), vec![end.id()]);
        assert!(cell.is_ended());
        assert_eq!(end.listener_count(), 0);
    }

    #[test]
    fn falsy_end_write_does_not_terminate() {
        let cell = Cell::new(0);
        let end = cell.end().unwrap().clone();
        let recorder = Recorder::new();
        end.as_dependency().subscribe(recorder.subscriber());

        end.set(false).unwrap();

        assert!(!cell.is_ended());
        assert!(recorder.notified.borrow().is_empty());
        assert!(cell.set(1).is_ok());
    }

    #[test]
    fn ended_cell_rejects_writes() {
        let cell = Cell::new(1);
        cell.terminate().unwrap();

        assert_eq!(cell.set(2), Err(ReactiveError::Ended(cell.id())));
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn end_cells_have_no_end() {
        let cell = Cell::new(0);
        let end = cell.end().unwrap();
        assert!(end.end().is_none());
        assert!(end.terminate().is_ok());
        assert!(!cell.is_ended());
    }

    #[test]
    fn cell_clone_shares_state() {
        let cell1 = Cell::new(0);
        let cell2 = cell1.clone();

        cell1.set(42).unwrap();
        assert_eq!(cell2.get(), 42);
        assert!(cell1.ptr_eq(&cell2));
        assert_eq!(cell1, cell2);
    }

    #[test]
    fn cell_ids_are_unique() {
        let c1 = Cell::new(0);
        let c2 = Cell::new(0);

        assert_ne!(c1.id(), c2.id());
        assert_ne!(c1.id(), c1.end().unwrap().id());
    }
}
