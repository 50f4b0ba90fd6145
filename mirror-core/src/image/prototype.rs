//! Prototypes
//!
//! A [`Prototype`] describes a class: its own members (methods and getters)
//! and the prototype it extends. Instances are [`Object`]s created with
//! [`Object::with_prototype`], so a class hierarchy is a chain of shared,
//! immutable prototypes.
//!
//! Three intrinsic prototypes stand for the built-in roots (objects,
//! functions, regular expressions). The shape registry never synthesizes a
//! shape for them.
//!
//! [`Object`]: super::Object
//! [`Object::with_prototype`]: super::Object::with_prototype

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use super::value::{Function, Value};
use crate::error::Result;

/// Stable identifier of a prototype, used as the shape registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrototypeId(u64);

impl PrototypeId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The built-in root prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Object,
    Function,
    RegExp,
}

/// How a member is exposed through an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// Called with the real target as receiver; the result is imaged.
    Method,
    /// Evaluated against the real target on every read; the result is
    /// imaged.
    Accessor,
}

/// A member defined directly on a prototype.
#[derive(Clone, Debug)]
pub enum Member {
    Method(Function),
    Getter(Function),
}

impl Member {
    pub fn kind(&self) -> MemberKind {
        match self {
            Member::Method(_) => MemberKind::Method,
            Member::Getter(_) => MemberKind::Accessor,
        }
    }
}

/// A class description shared by all of its instances.
pub struct Prototype {
    id: PrototypeId,
    name: String,
    members: IndexMap<String, Member>,
    parent: Option<Rc<Prototype>>,
    intrinsic: Option<Intrinsic>,
}

thread_local! {
    static OBJECT_PROTOTYPE: Rc<Prototype> = Prototype::new_intrinsic(Intrinsic::Object);
    static FUNCTION_PROTOTYPE: Rc<Prototype> = Prototype::new_intrinsic(Intrinsic::Function);
    static REGEXP_PROTOTYPE: Rc<Prototype> = Prototype::new_intrinsic(Intrinsic::RegExp);
}

impl Prototype {
    /// Start describing a class called `name`.
    pub fn builder(name: impl Into<String>) -> PrototypeBuilder {
        PrototypeBuilder {
            name: name.into(),
            members: IndexMap::new(),
            parent: None,
        }
    }

    /// The shared root prototype of the given kind.
    pub fn intrinsic(kind: Intrinsic) -> Rc<Prototype> {
        match kind {
            Intrinsic::Object => OBJECT_PROTOTYPE.with(Rc::clone),
            Intrinsic::Function => FUNCTION_PROTOTYPE.with(Rc::clone),
            Intrinsic::RegExp => REGEXP_PROTOTYPE.with(Rc::clone),
        }
    }

    fn new_intrinsic(kind: Intrinsic) -> Rc<Prototype> {
        let name = match kind {
            Intrinsic::Object => "Object",
            Intrinsic::Function => "Function",
            Intrinsic::RegExp => "RegExp",
        };
        Rc::new(Prototype {
            id: PrototypeId::new(),
            name: name.to_string(),
            members: IndexMap::new(),
            parent: None,
            intrinsic: Some(kind),
        })
    }

    pub fn id(&self) -> PrototypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Rc<Prototype>> {
        self.parent.as_ref()
    }

    pub fn intrinsic_kind(&self) -> Option<Intrinsic> {
        self.intrinsic
    }

    pub fn is_intrinsic(&self) -> bool {
        self.intrinsic.is_some()
    }

    /// A member defined directly on this prototype.
    pub fn own_member(&self, key: &str) -> Option<&Member> {
        self.members.get(key)
    }

    /// Names of the members defined directly on this prototype, in
    /// definition order.
    pub fn own_member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Find `key` on this prototype or the nearest ancestor defining it.
    pub fn lookup(&self, key: &str) -> Option<&Member> {
        match self.members.get(key) {
            Some(member) => Some(member),
            None => self.parent.as_ref().and_then(|parent| parent.lookup(key)),
        }
    }
}

impl fmt::Debug for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prototype")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("parent", &self.parent.as_ref().map(|parent| parent.name()))
            .finish()
    }
}

/// Builder returned by [`Prototype::builder`].
pub struct PrototypeBuilder {
    name: String,
    members: IndexMap<String, Member>,
    parent: Option<Rc<Prototype>>,
}

impl PrototypeBuilder {
    pub fn extends(mut self, parent: &Rc<Prototype>) -> Self {
        self.parent = Some(Rc::clone(parent));
        self
    }

    /// Define a method. It receives the instance and the call arguments.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + 'static,
    {
        self.members
            .insert(name.into(), Member::Method(Function::new(f)));
        self
    }

    /// Define a getter. It receives the instance.
    pub fn getter<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + 'static,
    {
        let getter = Function::new(move |this, _| f(this));
        self.members.insert(name.into(), Member::Getter(getter));
        self
    }

    pub fn build(self) -> Rc<Prototype> {
        Rc::new(Prototype {
            id: PrototypeId::new(),
            name: self.name,
            members: self.members,
            parent: self.parent,
            intrinsic: None,
        })
    }
}
