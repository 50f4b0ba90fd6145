//! Reactive Primitives
//!
//! This module implements the reactive half of the engine: cells, the
//! dependency context, and mirrors.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state with a list of listeners and an
//! `end` companion cell. Writing a cell synchronously notifies every
//! listener before the write returns.
//!
//! ## Mirrors
//!
//! A Mirror is a derived cell. It re-runs its function whenever any cell it
//! read during its last run is written, and it re-discovers that set of
//! cells on every run.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local context stack to detect
//! dependencies automatically. When a cell is unwrapped through an image, we
//! check if there is an active derivation and, if so, record the cell on it.
//! Everything is single-threaded and synchronous; there is no scheduler and
//! no batching.

mod cell;
mod context;
mod mirror;
mod subscriber;

pub use cell::{Cell, CellId};
pub use context::DependencyContext;
pub use mirror::{mirror, Mirror};
pub use subscriber::DerivationId;
