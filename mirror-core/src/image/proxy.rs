//! Image Construction
//!
//! [`image`] turns a [`Value`] into a read-only view that unwraps cells as
//! it goes. Every time a read meets a cell, the cell is read and recorded as
//! a dependency of the active derivation, and the read continues with the
//! cell's value (cells holding cells are unwrapped all the way down).
//!
//! Views are cheap and never cached: each property read goes back to the
//! target, so two reads of the same key during one mirror run both see the
//! live value and both record the same cell, which the mirror deduplicates.
//!
//! # Wrapping Rules
//!
//! - Primitives and `null` pass through unchanged.
//! - Own object properties holding functions become methods: calling one
//!   invokes the live function with the real target as receiver and images
//!   the result. Every other own property is a live accessor.
//! - Members of the target's prototype chain are reached through its cached
//!   [`Shape`]: methods as above, getters evaluated against the real target.
//! - Array elements and `length` are live accessors.
//!
//! An image never writes to its target. Mutation happens only when a wrapped
//! function writes to cells itself.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::prototype::Member;
use super::shape::{is_reserved, Shape, ShapeRegistry};
use super::value::{number_to_json, Array, Function, Object, Value};
use crate::error::{ReactiveError, Result};

/// Unwrap `data` and wrap the result in a view.
///
/// Cells met on the way are recorded as dependencies of the active
/// derivation, if there is one.
pub fn image(data: impl Into<Value>) -> Image {
    let mut data = data.into();
    while let Value::Cell(cell) = &data {
        let next = cell.track();
        data = next;
    }

    match data {
        Value::Object(object) => Image::Object(ObjectImage::new(object)),
        Value::Array(array) => Image::Array(ArrayImage { target: array }),
        Value::Function(function) => Image::Function(FunctionImage::free(function)),
        primitive => Image::Value(primitive),
    }
}

/// A view over an unwrapped value.
#[derive(Clone)]
pub enum Image {
    /// A primitive or `null`, passed through.
    Value(Value),
    Object(ObjectImage),
    Array(ArrayImage),
    Function(FunctionImage),
}

impl Image {
    fn kind(&self) -> &'static str {
        match self {
            Image::Value(value) => value.kind(),
            Image::Object(_) => "object",
            Image::Array(_) => "array",
            Image::Function(_) => "function",
        }
    }

    fn mismatch(&self, expected: &'static str) -> ReactiveError {
        ReactiveError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    /// Read a property. Arrays accept `length` and decimal indices.
    pub fn get(&self, key: &str) -> Result<Image> {
        match self {
            Image::Object(object) => object.get(key),
            Image::Array(array) => array.get_key(key),
            other => Err(other.mismatch("object")),
        }
    }

    /// Read an array element.
    pub fn index(&self, index: usize) -> Result<Image> {
        match self {
            Image::Array(array) => array.get(index),
            other => Err(other.mismatch("array")),
        }
    }

    /// Call a function image.
    pub fn call(&self, args: &[Value]) -> Result<Image> {
        match self {
            Image::Function(function) => function.call(args),
            other => Err(ReactiveError::NotCallable(other.kind().to_string())),
        }
    }

    /// Read `name` and call it.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Image> {
        invoke(self.get(name)?, name, args)
    }

    /// Enumerable keys: own enumerable keys for objects, indices for arrays.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Image::Object(object) => object.keys(),
            Image::Array(array) => (0..array.len()).map(|index| index.to_string()).collect(),
            _ => Vec::new(),
        }
    }

    /// Element count for arrays, enumerable key count for objects, zero
    /// otherwise.
    pub fn len(&self) -> usize {
        match self {
            Image::Object(object) => object.keys().len(),
            Image::Array(array) => array.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Image::Value(Value::Null))
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Image::Value(value) => value.as_f64(),
            other => Err(other.mismatch("number")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Image::Value(value) => value.as_bool(),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Image::Value(value) => value.as_str(),
            other => Err(other.mismatch("string")),
        }
    }

    /// The unwrapped value behind this view. Composite views give back their
    /// target.
    pub fn into_value(self) -> Value {
        match self {
            Image::Value(value) => value,
            Image::Object(object) => Value::Object(object.target),
            Image::Array(array) => Value::Array(array.target),
            Image::Function(function) => function.into_value(),
        }
    }

    /// Read the whole reachable graph through the view into JSON.
    ///
    /// Every cell on the way is tracked, so a mirror that snapshots an image
    /// depends on everything the snapshot contains. Methods are omitted from
    /// objects and become `null` elsewhere.
    /// A graph that contains itself fails with [`ReactiveError::Cycle`];
    /// shared children are fine.
    pub fn snapshot(&self) -> Result<serde_json::Value> {
        self.snapshot_within(&mut Vec::new())
    }

    /// `path` holds the composites above this one.
    fn snapshot_within(&self, path: &mut Vec<*const ()>) -> Result<serde_json::Value> {
        match self {
            Image::Value(value) => Ok(primitive_to_json(value)),
            Image::Function(_) => Ok(serde_json::Value::Null),
            Image::Array(array) => {
                enter(path, array.target.as_ptr())?;
                let mut items = Vec::with_capacity(array.len());
                for index in 0..array.len() {
                    items.push(array.get(index)?.snapshot_within(path)?);
                }
                path.pop();
                Ok(serde_json::Value::Array(items))
            }
            Image::Object(object) => {
                enter(path, object.target.as_ptr())?;
                let mut fields = serde_json::Map::new();
                for key in object.keys() {
                    let field = object.get(&key)?;
                    if !matches!(field, Image::Function(_)) {
                        fields.insert(key, field.snapshot_within(path)?);
                    }
                }
                path.pop();
                Ok(serde_json::Value::Object(fields))
            }
        }
    }
}

fn enter(path: &mut Vec<*const ()>, node: *const ()) -> Result<()> {
    if path.contains(&node) {
        return Err(ReactiveError::Cycle);
    }
    path.push(node);
    Ok(())
}

/// Call `member` if it is a method.
fn invoke(member: Image, name: &str, args: &[Value]) -> Result<Image> {
    match member {
        Image::Function(method) => method.call(args),
        _ => Err(ReactiveError::NotCallable(name.to_string())),
    }
}

fn primitive_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => number_to_json(*n),
        Value::String(s) => serde_json::Value::String(s.to_string()),
        _ => serde_json::Value::Null,
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Image::Value(value) => f.debug_tuple("Image").field(value).finish(),
            Image::Object(object) => fmt::Debug::fmt(object, f),
            Image::Array(array) => fmt::Debug::fmt(array, f),
            Image::Function(function) => fmt::Debug::fmt(function, f),
        }
    }
}

// ----------------------------------------------------------------------------
// Objects
// ----------------------------------------------------------------------------

/// How an own key is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Accessor { enumerable: bool },
    Method { enumerable: bool },
}

impl Slot {
    fn enumerable(self) -> bool {
        match self {
            Slot::Accessor { enumerable } | Slot::Method { enumerable } => enumerable,
        }
    }
}

/// View over an object or class instance.
#[derive(Clone)]
pub struct ObjectImage {
    /// Identity link to the viewed object. Never written through.
    target: Object,
    /// Shape of the target's prototype; `None` for plain objects and
    /// instances of intrinsic prototypes.
    shape: Option<Rc<Shape>>,
    slots: Rc<IndexMap<String, Slot>>,
}

impl ObjectImage {
    fn new(target: Object) -> Self {
        let shape = target.prototype().and_then(ShapeRegistry::shape_for);

        let slots: IndexMap<String, Slot> = target
            .entries()
            .into_iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(key, property)| {
                let enumerable = property.enumerable;
                let slot = match property.value {
                    Value::Function(_) => Slot::Method { enumerable },
                    _ => Slot::Accessor { enumerable },
                };
                (key, slot)
            })
            .collect();

        Self {
            target,
            shape,
            slots: Rc::new(slots),
        }
    }

    /// The object this view reads from.
    pub fn target(&self) -> &Object {
        &self.target
    }

    /// The cached shape of the target's prototype, if it has one.
    pub fn shape(&self) -> Option<&Rc<Shape>> {
        self.shape.as_ref()
    }

    fn receiver(&self) -> Value {
        Value::Object(self.target.clone())
    }

    /// Read `key`: own keys first, then the prototype chain.
    pub fn get(&self, key: &str) -> Result<Image> {
        match self.slots.get(key) {
            Some(Slot::Accessor { .. }) => Ok(image(self.target.get(key).unwrap_or_default())),
            Some(Slot::Method { .. }) => Ok(Image::Function(FunctionImage {
                callee: Callee::Property {
                    target: self.target.clone(),
                    key: key.to_string(),
                },
                receiver: self.receiver(),
            })),
            None => self.get_inherited(key),
        }
    }

    fn get_inherited(&self, key: &str) -> Result<Image> {
        let member = self
            .shape
            .as_ref()
            .and_then(|shape| shape.resolve(key))
            .ok_or_else(|| ReactiveError::MissingProperty(key.to_string()))?;

        match member {
            Member::Getter(getter) => Ok(image(getter.call(&self.receiver(), &[])?)),
            Member::Method(method) => Ok(Image::Function(FunctionImage {
                callee: Callee::Fixed(method),
                receiver: self.receiver(),
            })),
        }
    }

    /// Whether `key` is readable through this view.
    pub fn has(&self, key: &str) -> bool {
        self.slots.contains_key(key)
            || self
                .shape
                .as_ref()
                .is_some_and(|shape| shape.kind_of(key).is_some())
    }

    /// Own keys that were enumerable when the view was built, in order.
    pub fn keys(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.enumerable())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Image> {
        invoke(self.get(name)?, name, args)
    }
}

impl fmt::Debug for ObjectImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectImage")
            .field("shape", &self.shape.as_ref().map(|shape| shape.name()))
            .field("keys", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Arrays
// ----------------------------------------------------------------------------

/// View over an array.
#[derive(Clone)]
pub struct ArrayImage {
    target: Array,
}

impl ArrayImage {
    pub fn target(&self) -> &Array {
        &self.target
    }

    /// Live length of the target.
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// Read element `index`. Function elements are bound to the array.
    pub fn get(&self, index: usize) -> Result<Image> {
        let element = self
            .target
            .get(index)
            .ok_or(ReactiveError::IndexOutOfBounds {
                index,
                len: self.target.len(),
            })?;

        match element {
            Value::Function(function) => Ok(Image::Function(FunctionImage {
                callee: Callee::Fixed(function),
                receiver: Value::Array(self.target.clone()),
            })),
            other => Ok(image(other)),
        }
    }

    fn get_key(&self, key: &str) -> Result<Image> {
        if key == "length" {
            return Ok(Image::Value(Value::Number(self.len() as f64)));
        }
        match key.parse::<usize>() {
            Ok(index) => self.get(index),
            Err(_) => Err(ReactiveError::MissingProperty(key.to_string())),
        }
    }

    /// Iterate the elements, reading each one live when it is reached.
    pub fn iter(&self) -> ArrayImageIter<'_> {
        ArrayImageIter {
            image: self,
            next: 0,
        }
    }
}

impl fmt::Debug for ArrayImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayImage")
            .field("len", &self.len())
            .finish()
    }
}

/// Iterator returned by [`ArrayImage::iter`].
pub struct ArrayImageIter<'a> {
    image: &'a ArrayImage,
    next: usize,
}

impl Iterator for ArrayImageIter<'_> {
    type Item = Result<Image>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.image.len() {
            return None;
        }
        let item = self.image.get(self.next);
        self.next += 1;
        Some(item)
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

#[derive(Clone)]
enum Callee {
    Fixed(Function),
    /// Looked up on the target at call time, so replacing the property
    /// replaces what the method calls.
    Property { target: Object, key: String },
}

/// A function bound to the receiver it was read from.
#[derive(Clone)]
pub struct FunctionImage {
    callee: Callee,
    receiver: Value,
}

impl FunctionImage {
    fn free(function: Function) -> Self {
        Self {
            callee: Callee::Fixed(function),
            receiver: Value::Null,
        }
    }

    fn function(&self) -> Result<Function> {
        match &self.callee {
            Callee::Fixed(function) => Ok(function.clone()),
            Callee::Property { target, key } => match target.get(key) {
                Some(Value::Function(function)) => Ok(function),
                _ => Err(ReactiveError::NotCallable(key.clone())),
            },
        }
    }

    /// Invoke the function with the real receiver and image the result.
    pub fn call(&self, args: &[Value]) -> Result<Image> {
        let result = self.function()?.call(&self.receiver, args)?;
        Ok(image(result))
    }

    /// The receiver the function is bound to.
    pub fn receiver(&self) -> &Value {
        &self.receiver
    }

    fn into_value(self) -> Value {
        match self.function() {
            Ok(function) => Value::Function(function),
            Err(_) => Value::Null,
        }
    }
}

impl fmt::Debug for FunctionImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.callee {
            Callee::Fixed(_) => "<fixed>",
            Callee::Property { key, .. } => key.as_str(),
        };
        f.debug_struct("FunctionImage")
            .field("callee", &name)
            .field("receiver", &self.receiver.kind())
            .finish()
    }
}
