//! Mirror Implementation
//!
//! A Mirror is a cell whose value is the result of re-running a user
//! function. It discovers its dependencies by running: every cell unwrapped
//! through an image (or read with [`Cell::track`]) while the mirror is on
//! top of the dependency context is recorded.
//!
//! # Recompute Protocol
//!
//! On construction and on every write to a dependency:
//!
//! 1. Push the mirror onto the dependency context.
//! 2. Detach from every dependency and every dependency's `end` cell.
//! 3. Run the function, collecting the cells it reads.
//! 4. Attach to exactly those cells and their `end` cells.
//! 5. Pop the dependency context.
//! 6. Write the result into the mirror's own cell, which notifies its
//!    listeners like any other cell write.
//!
//! Detaching before the run means a cell read by the previous run but not
//! by this one is dropped, and attaching after means the mirror never
//! observes its own stale subscription mid-run.
//!
//! # Termination
//!
//! Ending a dependency only removes it from the mirror's dependency set.
//! Ending the mirror's own cell detaches it from everything. Neither runs
//! the function again, and neither can be undone.
//!
//! # Failure
//!
//! If the function returns an error the mirror is left unsubscribed from
//! everything and the error is returned to the writer that triggered the
//! run. [`Mirror::recompute`] runs the protocol again and restores tracking.

use std::cell::{OnceCell, RefCell};
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::cell::{Cell, CellId, WeakCell};
use super::context::DependencyContext;
use super::subscriber::{Dependency, Derivation, DerivationId, Subscriber};
use crate::error::{ReactiveError, Result};

/// Link from a dependency's `end` cell back to the dependency.
struct EndLink {
    end: Rc<dyn Dependency>,
    host: CellId,
}

struct MirrorState<T: 'static> {
    id: DerivationId,

    compute: Box<dyn Fn() -> Result<T>>,

    /// Cells read during the last run, in first-read order.
    deps: RefCell<IndexMap<CellId, Rc<dyn Dependency>>>,

    /// The `end` cells of `deps`, keyed by the end cell's id.
    end_deps: RefCell<IndexMap<CellId, EndLink>>,

    /// The mirror's own cell. Weak because that cell keeps this state alive.
    output: OnceCell<WeakCell<T>>,

    /// The `end` cell of `output`, which this mirror listens to.
    own_end: OnceCell<Rc<dyn Dependency>>,

    recompute_count: std::cell::Cell<usize>,

    ended: std::cell::Cell<bool>,

    this: Weak<MirrorState<T>>,
}

impl<T: Clone + 'static> MirrorState<T> {
    fn subscriber(&self) -> Subscriber {
        let weak: Weak<dyn Derivation> = self.this.clone();
        Subscriber::new(self.id, weak)
    }

    /// Steps 1 to 5 of the protocol. Returns the new value without writing
    /// it.
    fn recompute(&self) -> Result<T> {
        let this: Rc<dyn Derivation> = self
            .this
            .upgrade()
            .expect("mirror state is alive while it recomputes");
        let guard = DependencyContext::enter(this);

        self.detach();

        let run = self.recompute_count.get() + 1;
        self.recompute_count.set(run);
        trace!(mirror = %self.id, run, "recomputing");

        let result = (self.compute)();
        if self.ended.get() {
            // Ended while running: stays detached.
            self.deps.borrow_mut().clear();
            self.end_deps.borrow_mut().clear();
            drop(guard);
            return result;
        }
        match &result {
            Ok(_) => self.attach(),
            Err(error) => {
                // Reads recorded before the failure were never attached.
                self.deps.borrow_mut().clear();
                self.end_deps.borrow_mut().clear();
                warn!(mirror = %self.id, %error, "mirror function failed, left unsubscribed");
            }
        }

        drop(guard);
        result
    }

    /// The full protocol, including the write to the output cell.
    fn update(&self) -> Result<()> {
        let value = self.recompute()?;
        if self.ended.get() {
            return Ok(());
        }
        match self.output.get().and_then(WeakCell::upgrade) {
            Some(output) => output.set(value),
            None => Ok(()),
        }
    }

    fn detach(&self) {
        let deps = std::mem::take(&mut *self.deps.borrow_mut());
        for dependency in deps.values() {
            dependency.unsubscribe(self.id);
        }

        let end_deps = std::mem::take(&mut *self.end_deps.borrow_mut());
        for link in end_deps.values() {
            link.end.unsubscribe(self.id);
        }
    }

    fn attach(&self) {
        // A dependency can end after it was read; it is never re-subscribed.
        self.deps
            .borrow_mut()
            .retain(|_, dependency| !dependency.is_ended());
        {
            let deps = self.deps.borrow();
            self.end_deps
                .borrow_mut()
                .retain(|_, link| deps.contains_key(&link.host));
        }

        let subscriber = self.subscriber();
        for dependency in self.deps.borrow().values() {
            dependency.subscribe(subscriber.clone());
        }
        for link in self.end_deps.borrow().values() {
            link.end.subscribe(subscriber.clone());
        }
        trace!(
            mirror = %self.id,
            deps = self.deps.borrow().len(),
            "attached"
        );
    }

    /// A dependency ended: forget it without recomputing.
    fn drop_dependency(&self, link: EndLink) {
        link.end.unsubscribe(self.id);
        let dependency = self.deps.borrow_mut().shift_remove(&link.host);
        if let Some(dependency) = dependency {
            dependency.unsubscribe(self.id);
        }
        debug!(mirror = %self.id, dependency = %link.host, "dependency ended");
    }

    /// The mirror's own cell ended.
    fn shutdown(&self) {
        self.ended.set(true);
        self.detach();
        if let Some(own_end) = self.own_end.get() {
            own_end.unsubscribe(self.id);
        }
        debug!(mirror = %self.id, "mirror ended");
    }
}

impl<T: Clone + 'static> Derivation for MirrorState<T> {
    fn id(&self) -> DerivationId {
        self.id
    }

    fn record(&self, dependency: Rc<dyn Dependency>) {
        // An ended cell can never fire again, and an ended mirror never
        // listens again.
        if self.ended.get() || dependency.is_ended() {
            return;
        }

        let id = dependency.cell_id();
        if self.deps.borrow().contains_key(&id) {
            return;
        }

        if let Some(end) = dependency.end_dependency() {
            self.end_deps
                .borrow_mut()
                .insert(end.cell_id(), EndLink { end, host: id });
        }
        self.deps.borrow_mut().insert(id, dependency);
    }

    fn notify(&self, source: CellId) -> Result<()> {
        if self.ended.get() {
            return Ok(());
        }

        if self.own_end.get().map(|end| end.cell_id()) == Some(source) {
            self.shutdown();
            return Ok(());
        }

        let link = self.end_deps.borrow_mut().shift_remove(&source);
        if let Some(link) = link {
            self.drop_dependency(link);
            return Ok(());
        }

        // Listener snapshots can deliver a write from a cell this mirror
        // has already dropped.
        if !self.deps.borrow().contains_key(&source) {
            return Ok(());
        }

        self.update()
    }
}

impl<T: 'static> Drop for MirrorState<T> {
    fn drop(&mut self) {
        for dependency in self.deps.get_mut().values() {
            dependency.unsubscribe(self.id);
        }
        for link in self.end_deps.get_mut().values() {
            link.end.unsubscribe(self.id);
        }
        if let Some(own_end) = self.own_end.get() {
            own_end.unsubscribe(self.id);
        }
    }
}

/// A derived cell that re-runs its function whenever a dependency it read
/// during the last run is written.
///
/// Cloning a `Mirror` creates a new handle to the same derivation.
///
/// # Example
///
/// ```rust
/// use mirror_core::{image, mirror, Cell, Value};
///
/// let a = Cell::new(Value::from(2));
/// let b = Cell::new(Value::from(3));
///
/// let (ra, rb) = (a.clone(), b.clone());
/// let product = mirror(move || Ok(image(&ra).as_f64()? * image(&rb).as_f64()?)).unwrap();
/// assert_eq!(product.get(), 6.0);
///
/// a.set(Value::from(7)).unwrap();
/// assert_eq!(product.get(), 21.0);
/// ```
pub struct Mirror<T: 'static> {
    cell: Cell<T>,
    state: Rc<MirrorState<T>>,
}

/// Create a mirror over `compute` and run it once.
///
/// Returns the error of the first run, if it fails.
pub fn mirror<T, F>(compute: F) -> Result<Mirror<T>>
where
    T: Clone + 'static,
    F: Fn() -> Result<T> + 'static,
{
    let state = Rc::new_cyclic(|this| MirrorState {
        id: DerivationId::new(),
        compute: Box::new(compute),
        deps: RefCell::new(IndexMap::new()),
        end_deps: RefCell::new(IndexMap::new()),
        output: OnceCell::new(),
        own_end: OnceCell::new(),
        recompute_count: std::cell::Cell::new(0),
        ended: std::cell::Cell::new(false),
        this: this.clone(),
    });

    // The first run has no listeners to notify, so its result becomes the
    // cell's initial value instead of a write.
    let initial = state.recompute()?;
    let cell = Cell::new(initial);
    cell.set_driver(state.clone());
    let _ = state.output.set(cell.downgrade());

    if let Some(end) = cell.end() {
        let own_end = end.as_dependency();
        own_end.subscribe(state.subscriber());
        let _ = state.own_end.set(own_end);
    }

    debug!(
        mirror = %state.id,
        cell = %cell.id(),
        deps = state.deps.borrow().len(),
        "mirror created"
    );

    Ok(Mirror { cell, state })
}

impl<T: Clone + 'static> Mirror<T> {
    /// Get the mirror's derivation ID.
    pub fn id(&self) -> DerivationId {
        self.state.id
    }

    /// The mirror's own cell.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    /// Read the last computed value without recording a dependency.
    pub fn get(&self) -> T {
        self.cell.get()
    }

    /// Read the last computed value and record the mirror's cell as a
    /// dependency of the active derivation.
    pub fn track(&self) -> T {
        self.cell.track()
    }

    /// The `end` companion of the mirror's cell.
    pub fn end(&self) -> Option<&Cell<bool>> {
        self.cell.end()
    }

    /// End the mirror: detach from every dependency without recomputing.
    pub fn terminate(&self) -> Result<()> {
        self.cell.terminate()
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended.get()
    }

    /// Run the recompute protocol now, as if a dependency had been written.
    ///
    /// This is how tracking is restored after the function failed.
    pub fn recompute(&self) -> Result<()> {
        if self.is_ended() {
            return Err(ReactiveError::Ended(self.cell.id()));
        }
        self.state.update()
    }

    /// IDs of the cells read during the last run, in first-read order.
    ///
    /// Cells that had already ended when they were read, or that ended
    /// before the run finished, are not included: they can never notify.
    pub fn deps(&self) -> Vec<CellId> {
        self.state.deps.borrow().keys().copied().collect()
    }

    /// Whether `cell` was read during the last run.
    pub fn depends_on<U: Clone + 'static>(&self, cell: &Cell<U>) -> bool {
        self.state.deps.borrow().contains_key(&cell.id())
    }

    pub fn dep_count(&self) -> usize {
        self.state.deps.borrow().len()
    }

    /// Number of dependency `end` cells the mirror listens to.
    pub fn end_dep_count(&self) -> usize {
        self.state.end_deps.borrow().len()
    }

    /// Get the number of times the function has run.
    pub fn recompute_count(&self) -> usize {
        self.state.recompute_count.get()
    }
}

impl<T: 'static> Clone for Mirror<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Clone + Debug + 'static> Debug for Mirror<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mirror")
            .field("id", &self.state.id)
            .field("value", &self.get())
            .field("deps", &self.deps())
            .field("recompute_count", &self.recompute_count())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_runs_on_creation() {
        let m = mirror(|| Ok(42)).unwrap();

        assert_eq!(m.get(), 42);
        assert_eq!(m.recompute_count(), 1);
        assert_eq!(m.dep_count(), 0);
    }

    #[test]
    fn mirror_recomputes_when_dependency_is_written() {
        let source = Cell::new(10);
        let s = source.clone();
        let doubled = mirror(move || Ok(s.track() * 2)).unwrap();

        assert_eq!(doubled.get(), 20);
        assert_eq!(doubled.deps(), vec![source.id()]);
        assert_eq!(source.listener_count(), 1);

        source.set(5).unwrap();
        assert_eq!(doubled.get(), 10);
        assert_eq!(doubled.recompute_count(), 2);
    }

    #[test]
    fn untracked_reads_are_not_dependencies() {
        let source = Cell::new(1);
        let s = source.clone();
        let m = mirror(move || Ok(s.get())).unwrap();

        assert_eq!(m.dep_count(), 0);
        source.set(2).unwrap();
        assert_eq!(m.get(), 1);
        assert_eq!(m.recompute_count(), 1);
    }

    #[test]
    fn repeated_reads_are_deduplicated() {
        let source = Cell::new(3);
        let s = source.clone();
        let m = mirror(move || Ok(s.track() + s.track() + s.track())).unwrap();

        assert_eq!(m.get(), 9);
        assert_eq!(m.dep_count(), 1);
        assert_eq!(m.end_dep_count(), 1);
        assert_eq!(source.listener_count(), 1);
        assert_eq!(source.end().unwrap().listener_count(), 1);
    }

    #[test]
    fn mirror_of_mirror_propagates() {
        let base = Cell::new(5);
        let b = base.clone();
        let doubled = mirror(move || Ok(b.track() * 2)).unwrap();
        let d = doubled.clone();
        let plus_ten = mirror(move || Ok(d.track() + 10)).unwrap();

        assert_eq!(plus_ten.get(), 20);

        base.set(10).unwrap();
        assert_eq!(doubled.get(), 20);
        assert_eq!(plus_ten.get(), 30);
        assert_eq!(plus_ten.recompute_count(), 2);
    }

    #[test]
    fn terminate_detaches_without_recompute() {
        let source = Cell::new(1);
        let s = source.clone();
        let m = mirror(move || Ok(s.track())).unwrap();

        m.terminate().unwrap();

        assert!(m.is_ended());
        assert_eq!(m.dep_count(), 0);
        assert_eq!(m.end_dep_count(), 0);
        assert_eq!(m.recompute_count(), 1);
        assert_eq!(source.listener_count(), 0);
        assert_eq!(source.end().unwrap().listener_count(), 0);

        source.set(2).unwrap();
        assert_eq!(m.get(), 1);
        assert_eq!(m.recompute(), Err(ReactiveError::Ended(m.cell().id())));
    }

    #[test]
    fn ended_dependency_is_dropped_without_recompute() {
        let a = Cell::new(1);
        let b = Cell::new(2);
        let (ra, rb) = (a.clone(), b.clone());
        let m = mirror(move || Ok(ra.track() + rb.track())).unwrap();

        a.terminate().unwrap();

        assert_eq!(m.deps(), vec![b.id()]);
        assert_eq!(m.end_dep_count(), 1);
        assert_eq!(m.recompute_count(), 1);
        assert_eq!(a.listener_count(), 0);
        assert!(!m.is_ended());

        b.set(3).unwrap();
        assert_eq!(m.get(), 4);
    }

    #[test]
    fn dependency_ended_by_the_function_is_not_subscribed() {
        let a = Cell::new(1);
        let b = Cell::new(2);
        let (ra, rb) = (a.clone(), b.clone());
        let m = mirror(move || {
            let value = ra.track();
            ra.terminate()?;
            Ok(value + rb.track())
        })
        .unwrap();

        assert!(a.is_ended());
        assert_eq!(m.get(), 3);
        assert_eq!(m.deps(), vec![b.id()]);
        assert_eq!(m.end_dep_count(), 1);
        assert_eq!(a.listener_count(), 0);
        assert_eq!(a.end().unwrap().listener_count(), 0);
        assert_eq!(b.listener_count(), 1);

        b.set(5).unwrap();
        assert_eq!(m.get(), 6);
        assert_eq!(m.deps(), vec![b.id()]);
    }

    #[test]
    fn mirror_ended_by_its_own_function_stays_detached() {
        let a = Cell::new(1);
        let b = Cell::new(10);
        let own_end: Rc<RefCell<Option<Cell<bool>>>> = Rc::new(RefCell::new(None));

        let m = {
            let (ra, rb, own_end) = (a.clone(), b.clone(), own_end.clone());
            mirror(move || {
                let n = ra.track();
                let end = own_end.borrow().clone();
                if let (true, Some(end)) = (n > 1, end) {
                    end.set(true)?;
                }
                Ok(n + rb.track())
            })
            .unwrap()
        };
        *own_end.borrow_mut() = m.end().cloned();
        assert_eq!(m.get(), 11);

        // The writer is not told about the mirror's own end.
        assert_eq!(a.set(5), Ok(()));

        assert!(m.is_ended());
        assert_eq!(m.get(), 11);
        assert_eq!(m.recompute_count(), 2);
        assert_eq!(m.dep_count(), 0);
        assert_eq!(m.end_dep_count(), 0);
        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 0);
        assert_eq!(a.end().unwrap().listener_count(), 0);

        b.set(20).unwrap();
        assert_eq!(m.recompute_count(), 2);
    }

    #[test]
    fn failure_leaves_mirror_unsubscribed() {
        let source = Cell::new(1);
        let s = source.clone();
        let m = mirror(move || {
            let value = s.track();
            if value < 0 {
                return Err(ReactiveError::failed("negative"));
            }
            Ok(value)
        })
        .unwrap();

        assert_eq!(source.set(-1), Err(ReactiveError::failed("negative")));
        assert_eq!(m.dep_count(), 0);
        assert_eq!(source.listener_count(), 0);
        assert_eq!(m.get(), 1);

        source.set(4).unwrap();
        assert_eq!(m.get(), 1);

        m.recompute().unwrap();
        assert_eq!(m.get(), 4);
        assert_eq!(source.listener_count(), 1);
    }

    #[test]
    fn failing_first_run_is_returned() {
        let result = mirror::<i32, _>(|| Err(ReactiveError::failed("boom")));
        assert_eq!(result.err(), Some(ReactiveError::failed("boom")));
        assert!(!DependencyContext::is_active());
    }

    #[test]
    fn dropped_mirror_detaches() {
        let source = Cell::new(1);
        let s = source.clone();
        let m = mirror(move || Ok(s.track())).unwrap();
        assert_eq!(source.listener_count(), 1);

        drop(m);
        assert_eq!(source.listener_count(), 0);
        assert_eq!(source.end().unwrap().listener_count(), 0);
        source.set(2).unwrap();
    }

    #[test]
    fn mirror_clone_shares_state() {
        let source = Cell::new(1);
        let s = source.clone();
        let m1 = mirror(move || Ok(s.track())).unwrap();
        let m2 = m1.clone();

        assert_eq!(m1.id(), m2.id());
        source.set(9).unwrap();
        assert_eq!(m2.get(), 9);
        assert_eq!(m2.recompute_count(), 2);
    }
}
