//! Dynamic Values
//!
//! The data graphs an image can view are built from [`Value`]: a tagged
//! variant over primitives, cells, arrays, objects and functions. Composite
//! variants are shared handles, so cloning a `Value` never copies a graph
//! and identity is preserved wherever the value travels.
//!
//! Objects keep their own properties in insertion order, each with an
//! enumerability flag, plus an optional [`Prototype`] for class instances.
//! Functions receive their receiver explicitly instead of relying on a
//! dynamic `this`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Error as _, Serialize, SerializeMap, SerializeSeq, Serializer};

use super::prototype::Prototype;
use crate::error::{ReactiveError, Result};
use crate::reactive::{Cell, Mirror};

/// A node in a data graph.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    /// A reactive cell, unwrapped (and tracked) by image reads.
    Cell(Cell<Value>),
    Array(Array),
    Object(Object),
    Function(Function),
}

/// Whether `value` is a reactive cell.
pub fn is_cell(value: &Value) -> bool {
    value.is_cell()
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Cell(_) => "cell",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_cell(&self) -> bool {
        matches!(self, Value::Cell(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Arrays, objects and functions. Everything else passes through an
    /// image unchanged.
    pub fn is_composite(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_) | Value::Function(_))
    }

    fn mismatch(&self, expected: &'static str) -> ReactiveError {
        ReactiveError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Number(n) => Ok(*n),
            other => Err(other.mismatch("number")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s.as_ref()),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_cell(&self) -> Result<&Cell<Value>> {
        match self {
            Value::Cell(cell) => Ok(cell),
            other => Err(other.mismatch("cell")),
        }
    }

    pub fn as_array(&self) -> Result<&Array> {
        match self {
            Value::Array(array) => Ok(array),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn as_object(&self) -> Result<&Object> {
        match self {
            Value::Object(object) => Ok(object),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn as_function(&self) -> Result<&Function> {
        match self {
            Value::Function(function) => Ok(function),
            other => Err(other.mismatch("function")),
        }
    }

    /// Raw own-property read on an object, without unwrapping or tracking.
    ///
    /// This is what method bodies use to reach the cells behind their
    /// receiver.
    pub fn property(&self, key: &str) -> Result<Value> {
        self.as_object()?
            .get(key)
            .ok_or_else(|| ReactiveError::MissingProperty(key.to_string()))
    }

    /// Raw own-property read that must yield a cell.
    pub fn cell_property(&self, key: &str) -> Result<Cell<Value>> {
        self.property(key)?.as_cell().cloned()
    }

    /// Build a plain graph from JSON. No cells are created.
    pub fn from_json(json: &serde_json::Value) -> Value {
        Self::convert_json(json, false)
    }

    /// Build a graph from JSON where every object property holds a cell.
    pub fn reactive_from_json(json: &serde_json::Value) -> Value {
        Self::convert_json(json, true)
    }

    fn convert_json(json: &serde_json::Value, reactive: bool) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::from(s.as_str()),
            serde_json::Value::Array(items) => Value::Array(Array::from_values(
                items
                    .iter()
                    .map(|item| Self::convert_json(item, reactive))
                    .collect(),
            )),
            serde_json::Value::Object(fields) => {
                let object = Object::new();
                for (key, field) in fields {
                    let value = Self::convert_json(field, reactive);
                    if reactive {
                        object.insert(key.clone(), Cell::new(value));
                    } else {
                        object.insert(key.clone(), value);
                    }
                }
                Value::Object(object)
            }
        }
    }
}

/// Convert a number to JSON, keeping integral values integral.
pub(crate) fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    /// Primitives compare by value, everything else by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Cell(cell) => write!(f, "Cell({})", cell.id()),
            Value::Array(array) => fmt_node(array.as_ptr(), f, |f| {
                f.debug_list().entries(array.to_vec()).finish()
            }),
            Value::Object(object) => fmt::Debug::fmt(object, f),
            Value::Function(_) => f.write_str("Function"),
        }
    }
}

/// Untracked snapshot: cells are resolved to their current value, functions
/// become `null` in sequences and are omitted from objects, and only
/// enumerable own properties are written. A graph that contains itself is
/// an error.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let path = RefCell::new(Vec::new());
        Node { value: self, path: &path }.serialize(serializer)
    }
}

/// A value being serialized, with the composites above it.
struct Node<'a> {
    value: &'a Value,
    path: &'a RefCell<Vec<*const ()>>,
}

impl Node<'_> {
    fn child<'b>(&'b self, value: &'b Value) -> Node<'b> {
        Node {
            value,
            path: self.path,
        }
    }

    fn enter<E: serde::ser::Error>(&self, node: *const ()) -> std::result::Result<(), E> {
        let mut path = self.path.borrow_mut();
        if path.contains(&node) {
            return Err(E::custom(ReactiveError::Cycle));
        }
        path.push(node);
        Ok(())
    }

    fn leave(&self) {
        self.path.borrow_mut().pop();
    }
}

impl Serialize for Node<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.value {
            Value::Null | Value::Function(_) => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => number_to_json(*n).serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Cell(cell) => {
                let current = cell.get();
                self.child(&current).serialize(serializer)
            }
            Value::Array(array) => {
                self.enter::<S::Error>(array.as_ptr())?;
                let items = array.to_vec();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(&self.child(item))?;
                }
                self.leave();
                seq.end()
            }
            Value::Object(object) => {
                self.enter::<S::Error>(object.as_ptr())?;
                let fields: Vec<(String, Value)> = object
                    .entries()
                    .into_iter()
                    .filter(|(_, property)| {
                        property.enumerable && !matches!(property.value, Value::Function(_))
                    })
                    .map(|(key, property)| (key, property.value))
                    .collect();
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in &fields {
                    map.serialize_entry(key, &self.child(value))?;
                }
                self.leave();
                map.end()
            }
        }
    }
}

thread_local! {
    /// Composites currently being formatted on this thread, outermost first.
    static FORMATTING: RefCell<Vec<*const ()>> = RefCell::new(Vec::new());
}

/// Format a composite, or `[Circular]` if it is already being formatted
/// further up.
fn fmt_node<F>(node: *const (), f: &mut fmt::Formatter<'_>, body: F) -> fmt::Result
where
    F: FnOnce(&mut fmt::Formatter<'_>) -> fmt::Result,
{
    if FORMATTING.with(|path| path.borrow().contains(&node)) {
        return f.write_str("[Circular]");
    }
    FORMATTING.with(|path| path.borrow_mut().push(node));
    let result = body(f);
    FORMATTING.with(|path| path.borrow_mut().pop());
    result
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Cell<Value>> for Value {
    fn from(cell: Cell<Value>) -> Self {
        Value::Cell(cell)
    }
}

impl From<&Cell<Value>> for Value {
    fn from(cell: &Cell<Value>) -> Self {
        Value::Cell(cell.clone())
    }
}

/// A mirror enters a graph as its own cell.
impl From<Mirror<Value>> for Value {
    fn from(mirror: Mirror<Value>) -> Self {
        Value::Cell(mirror.cell().clone())
    }
}

impl From<&Mirror<Value>> for Value {
    fn from(mirror: &Mirror<Value>) -> Self {
        Value::Cell(mirror.cell().clone())
    }
}

impl From<Array> for Value {
    fn from(array: Array) -> Self {
        Value::Array(array)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Array::from_values(items))
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<&Value> for Value {
    fn from(value: &Value) -> Self {
        value.clone()
    }
}

// ----------------------------------------------------------------------------
// Array
// ----------------------------------------------------------------------------

/// A shared, growable list of values.
#[derive(Clone, Default)]
pub struct Array(Rc<RefCell<Vec<Value>>>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.0.borrow_mut().push(value.into());
    }

    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let mut items = self.0.borrow_mut();
        let len = items.len();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(ReactiveError::IndexOutOfBounds { index, len }),
        }
    }

    /// Copy of the current elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Identity of the shared storage.
    pub(crate) fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }
}

// ----------------------------------------------------------------------------
// Object
// ----------------------------------------------------------------------------

/// An own property of an object.
#[derive(Clone, Debug)]
pub struct Property {
    pub value: Value,
    pub enumerable: bool,
}

struct ObjectData {
    properties: RefCell<IndexMap<String, Property>>,
    prototype: Option<Rc<Prototype>>,
}

/// A shared map of own properties, optionally backed by a prototype.
#[derive(Clone)]
pub struct Object(Rc<ObjectData>);

impl Object {
    /// A plain object, whose prototype is the root object prototype.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// An instance of the class described by `prototype`.
    pub fn with_prototype(prototype: &Rc<Prototype>) -> Self {
        Self::build(Some(Rc::clone(prototype)))
    }

    fn build(prototype: Option<Rc<Prototype>>) -> Self {
        Self(Rc::new(ObjectData {
            properties: RefCell::new(IndexMap::new()),
            prototype,
        }))
    }

    /// Builder-style [`Object::insert`].
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder-style [`Object::insert_hidden`].
    pub fn with_hidden(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert_hidden(key, value);
        self
    }

    /// Insert or replace an enumerable property.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.define(key.into(), value.into(), true);
    }

    /// Insert or replace a non-enumerable property.
    pub fn insert_hidden(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.define(key.into(), value.into(), false);
    }

    fn define(&self, key: String, value: Value, enumerable: bool) {
        self.0
            .properties
            .borrow_mut()
            .insert(key, Property { value, enumerable });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .properties
            .borrow()
            .get(key)
            .map(|property| property.value.clone())
    }

    pub fn property(&self, key: &str) -> Option<Property> {
        self.0.properties.borrow().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0
            .properties
            .borrow_mut()
            .shift_remove(key)
            .map(|property| property.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.properties.borrow().contains_key(key)
    }

    /// Enumerable own keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.0
            .properties
            .borrow()
            .iter()
            .filter(|(_, property)| property.enumerable)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Every own key, enumerable or not.
    pub fn own_keys(&self) -> Vec<String> {
        self.0.properties.borrow().keys().cloned().collect()
    }

    /// Copy of every own property.
    pub fn entries(&self) -> Vec<(String, Property)> {
        self.0
            .properties
            .borrow()
            .iter()
            .map(|(key, property)| (key.clone(), property.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.properties.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.properties.borrow().is_empty()
    }

    pub fn prototype(&self) -> Option<&Rc<Prototype>> {
        self.0.prototype.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Identity of the shared storage.
    pub(crate) fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_node(self.as_ptr(), f, |f| {
            let mut map = f.debug_map();
            if let Some(prototype) = self.prototype() {
                map.entry(&"[[Prototype]]", &prototype.name());
            }
            for (key, property) in self.entries() {
                map.entry(&key, &property.value);
            }
            map.finish()
        })
    }
}

// ----------------------------------------------------------------------------
// Function
// ----------------------------------------------------------------------------

type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value>;

/// A callable value. The first argument is the receiver the function was
/// invoked on (`Value::Null` for a free call).
#[derive(Clone)]
pub struct Function(Rc<NativeFn>);

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn call(&self, receiver: &Value, args: &[Value]) -> Result<Value> {
        (self.0)(receiver, args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Function")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cell_predicate() {
        let cell = Value::from(Cell::new(Value::from(1)));
        assert!(is_cell(&cell));
        assert!(!is_cell(&Value::from(1)));
        assert!(!is_cell(&Value::Null));
    }

    #[test]
    fn composites_compare_by_identity() {
        let object = Object::new();
        let same = Value::from(object.clone());
        assert_eq!(Value::from(object), same);
        assert_ne!(Value::from(Object::new()), Value::from(Object::new()));
        assert_eq!(Value::from("a"), Value::from("a".to_string()));
    }

    #[test]
    fn hidden_properties_are_not_enumerated() {
        let object = Object::new().with("a", 1).with_hidden("secret", 2).with("b", 3);

        assert_eq!(object.keys(), vec!["a", "b"]);
        assert_eq!(object.own_keys(), vec!["a", "secret", "b"]);
        assert_eq!(object.get("secret"), Some(Value::from(2)));
    }

    #[test]
    fn receiver_is_passed_explicitly() {
        let name = Cell::new(Value::from("Pelle"));
        let object = Value::from(Object::new().with("name", name.clone()));
        let rename = Function::new(|this, args| {
            this.cell_property("name")?.set(args[0].clone())?;
            Ok(Value::Null)
        });

        rename.call(&object, &[Value::from("Arne")]).unwrap();
        assert_eq!(name.get(), Value::from("Arne"));

        assert_eq!(
            rename.call(&Value::Null, &[Value::from("x")]),
            Err(ReactiveError::TypeMismatch {
                expected: "object",
                found: "null"
            })
        );
    }

    #[test]
    fn shared_children_serialize_but_cycles_do_not() {
        let child = Object::new().with("x", 1);
        let parent = Value::from(Object::new().with("a", child.clone()).with("b", child));
        assert_eq!(
            serde_json::to_value(&parent).unwrap(),
            json!({"a": {"x": 1}, "b": {"x": 1}})
        );

        let list = Array::new();
        list.push(list.clone());
        let error = serde_json::to_value(Value::from(list.clone())).unwrap_err();
        assert!(error.to_string().contains("cyclic"));
        list.set(0, Value::Null).unwrap();
    }

    #[test]
    fn debug_marks_circular_references() {
        let object = Object::new().with("id", 7);
        object.insert("me", object.clone());

        let printed = format!("{object:?}");
        assert!(printed.contains("[Circular]"));
        assert!(printed.contains("\"id\": Number(7)"));
        object.remove("me");

        let list = Array::from_values(vec![Value::from(1)]);
        list.push(list.clone());
        assert_eq!(format!("{:?}", Value::from(list.clone())), "[Number(1), [Circular]]");
        list.set(1, Value::Null).unwrap();
    }

    #[test]
    fn array_set_checks_bounds() {
        let array = Array::from_values(vec![Value::from(1)]);
        array.set(0, 5).unwrap();
        assert_eq!(array.get(0), Some(Value::from(5)));
        assert_eq!(
            array.set(3, 1),
            Err(ReactiveError::IndexOutOfBounds { index: 3, len: 1 })
        );
    }

    #[test]
    fn reactive_json_wraps_object_fields_in_cells() {
        let graph = Value::reactive_from_json(&json!({"a": 1, "nested": {"b": "x"}}));
        let a = graph.cell_property("a").unwrap();
        assert_eq!(a.get(), Value::from(1));

        let nested = graph.cell_property("nested").unwrap().get();
        assert!(nested.property("b").unwrap().is_cell());
    }

    #[test]
    fn serialization_resolves_cells_and_skips_functions() {
        let object = Object::new()
            .with("a", Cell::new(Value::from(1.5)))
            .with("b", Value::from(vec![Value::from(2), Value::from(true)]))
            .with("f", Function::new(|_, _| Ok(Value::Null)))
            .with_hidden("h", 9);

        let json = serde_json::to_value(Value::from(object)).unwrap();
        assert_eq!(json, json!({"a": 1.5, "b": [2, true]}));
    }
}
