//! Images
//!
//! An image is a read-only view over a data graph that unwraps cells
//! transparently. Code written against an image reads plain values, while
//! every cell it passes through is recorded as a dependency of the mirror
//! that is currently running.
//!
//! # Concepts
//!
//! ## Values
//!
//! Data graphs are made of [`Value`]s: primitives, cells, arrays, objects and
//! functions. Objects may be instances of a class described by a
//! [`Prototype`].
//!
//! ## Shapes
//!
//! The structure an image exposes for a class is computed once per
//! prototype and cached in the [`ShapeRegistry`]. Shapes link to the shape
//! of their parent prototype, so a hierarchy is wrapped one level at a time.

mod prototype;
mod proxy;
mod shape;
mod value;

pub use prototype::{Intrinsic, Member, MemberKind, Prototype, PrototypeBuilder, PrototypeId};
pub use proxy::{image, ArrayImage, ArrayImageIter, FunctionImage, Image, ObjectImage};
pub use shape::{Shape, ShapeRegistry};
pub use value::{is_cell, Array, Function, Object, Property, Value};
