//! Mirror Core
//!
//! This crate provides a small reactive-computation engine. It implements:
//!
//! - Cells: mutable values with listeners and an `end` companion
//! - Mirrors: derived cells that re-run when anything they read changes
//! - Images: read-only views that unwrap cells and record what was read
//! - A per-prototype shape cache for viewing class instances
//!
//! Everything is single-threaded and synchronous. A write returns only after
//! every mirror that depends on it has been brought up to date.
//!
//! # Architecture
//!
//! The crate is organized into three modules:
//!
//! - `reactive`: cells, the dependency context, and mirrors
//! - `image`: the value model, prototypes, shapes, and image views
//! - `error`: the error type shared by both
//!
//! # Example
//!
//! ```rust
//! use mirror_core::{image, mirror, Cell, Object, Value};
//!
//! # fn main() -> mirror_core::Result<()> {
//! let a = Cell::new(Value::from(1));
//! let b = Cell::new(Value::from(2));
//! let data = Value::from(Object::new().with("a", a.clone()).with("b", b.clone()));
//!
//! let sum = mirror(move || {
//!     let view = image(&data);
//!     Ok(view.get("a")?.as_f64()? + view.get("b")?.as_f64()?)
//! })?;
//! assert_eq!(sum.get(), 3.0);
//!
//! a.set(Value::from(10))?;
//! assert_eq!(sum.get(), 12.0);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod reactive;

pub use error::{ReactiveError, Result};
pub use image::{
    image, is_cell, Array, Function, Image, Object, Prototype, Shape, ShapeRegistry, Value,
};
pub use reactive::{mirror, Cell, CellId, DependencyContext, DerivationId, Mirror};
