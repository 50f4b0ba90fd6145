//! Shape Registry
//!
//! A [`Shape`] is the proxy structure synthesized for one prototype: the
//! names of the members it defines, whether each is exposed as a method or
//! an accessor, and a link to the shape of its parent. Instances of a class
//! share one shape, so imaging a thousand objects of the same class builds
//! the structure once.
//!
//! # Algorithm
//!
//! `shape_for(prototype)`:
//!
//! 1. Intrinsic prototypes (root object, root function, regular expression)
//!    get no shape. Images of their instances expose own properties only.
//! 2. A cached shape is returned as is.
//! 3. Otherwise the parent's shape is resolved first, a new shape inheriting
//!    from it is built from this prototype's own member names, cached under
//!    the prototype's id, and returned.
//!
//! The registry is thread-local and lives as long as the thread. Entries are
//! never evicted: the set of classes in a program is finite, and a cached
//! shape keeps its prototype alive on purpose so member lookups through it
//! always succeed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use super::prototype::{Member, MemberKind, Prototype, PrototypeId};

/// Keys used by the proxy machinery itself. They are never wrapped.
pub(crate) const RESERVED_KEYS: &[&str] = &["__proto__", "constructor"];

pub(crate) fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// The synthesized proxy structure for one prototype.
pub struct Shape {
    prototype: Rc<Prototype>,
    members: IndexMap<String, MemberKind>,
    parent: Option<Rc<Shape>>,
}

impl Shape {
    /// Id of the prototype this shape was built from.
    pub fn source(&self) -> PrototypeId {
        self.prototype.id()
    }

    pub fn name(&self) -> &str {
        self.prototype.name()
    }

    pub fn parent(&self) -> Option<&Rc<Shape>> {
        self.parent.as_ref()
    }

    /// Member names defined by this shape's own prototype.
    pub fn own_member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Every member name visible through the chain, nearest first, without
    /// duplicates.
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut shape = Some(self);
        while let Some(current) = shape {
            for name in current.members.keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
            shape = current.parent.as_deref();
        }
        names
    }

    /// How `key` is exposed, if any shape in the chain defines it.
    pub fn kind_of(&self, key: &str) -> Option<MemberKind> {
        match self.members.get(key) {
            Some(kind) => Some(*kind),
            None => self.parent.as_ref().and_then(|parent| parent.kind_of(key)),
        }
    }

    /// The member behind `key`, taken from the nearest prototype in the
    /// chain that defines it.
    pub fn resolve(&self, key: &str) -> Option<Member> {
        if self.members.contains_key(key) {
            return self.prototype.own_member(key).cloned();
        }
        self.parent.as_ref().and_then(|parent| parent.resolve(key))
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shape")
            .field("name", &self.name())
            .field("members", &self.members)
            .field("parent", &self.parent.as_ref().map(|parent| parent.name()))
            .finish()
    }
}

thread_local! {
    static SHAPES: RefCell<HashMap<PrototypeId, Rc<Shape>>> = RefCell::new(HashMap::new());
}

/// The per-thread cache of shapes, keyed by prototype id.
pub struct ShapeRegistry;

impl ShapeRegistry {
    /// Get or build the shape for `prototype`. `None` for intrinsic
    /// prototypes, which are never wrapped.
    pub fn shape_for(prototype: &Rc<Prototype>) -> Option<Rc<Shape>> {
        if prototype.is_intrinsic() {
            return None;
        }

        let cached = SHAPES.with(|shapes| shapes.borrow().get(&prototype.id()).cloned());
        if cached.is_some() {
            return cached;
        }

        // Resolved before touching the registry again: this recurses.
        let parent = prototype.parent().and_then(Self::shape_for);

        let members = prototype
            .own_member_names()
            .filter(|name| !is_reserved(name))
            .filter_map(|name| {
                prototype
                    .own_member(name)
                    .map(|member| (name.to_string(), member.kind()))
            })
            .collect();

        let shape = Rc::new(Shape {
            prototype: Rc::clone(prototype),
            members,
            parent,
        });
        debug!(
            prototype = prototype.name(),
            members = shape.members.len(),
            "built shape"
        );

        SHAPES.with(|shapes| {
            shapes
                .borrow_mut()
                .insert(prototype.id(), Rc::clone(&shape))
        });
        Some(shape)
    }

    /// Whether a shape has been built for `id` on this thread.
    pub fn contains(id: PrototypeId) -> bool {
        SHAPES.with(|shapes| shapes.borrow().contains_key(&id))
    }

    /// Number of shapes built on this thread.
    pub fn len() -> usize {
        SHAPES.with(|shapes| shapes.borrow().len())
    }

    pub fn is_empty() -> bool {
        Self::len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::prototype::Intrinsic;
    use crate::image::value::Value;

    fn animal() -> Rc<Prototype> {
        Prototype::builder("Animal")
            .method("speak", |_, _| Ok(Value::from("...")))
            .getter("legs", |_| Ok(Value::from(4)))
            .build()
    }

    #[test]
    fn shapes_are_built_once_per_prototype() {
        let proto = animal();
        let before = ShapeRegistry::len();

        let first = ShapeRegistry::shape_for(&proto).unwrap();
        let second = ShapeRegistry::shape_for(&proto).unwrap();

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(ShapeRegistry::len(), before + 1);
        assert!(ShapeRegistry::contains(proto.id()));
    }

    #[test]
    fn parent_shapes_are_built_first_and_shared() {
        let base = animal();
        let dog = Prototype::builder("Dog")
            .extends(&base)
            .method("fetch", |_, _| Ok(Value::from("ball")))
            .build();
        let cat = Prototype::builder("Cat").extends(&base).build();

        let dog_shape = ShapeRegistry::shape_for(&dog).unwrap();
        let cat_shape = ShapeRegistry::shape_for(&cat).unwrap();

        let dog_parent = dog_shape.parent().unwrap();
        assert!(Rc::ptr_eq(dog_parent, cat_shape.parent().unwrap()));
        assert_eq!(dog_parent.source(), base.id());
        assert_eq!(dog_shape.member_names(), vec!["fetch", "speak", "legs"]);
        assert_eq!(dog_shape.kind_of("legs"), Some(MemberKind::Accessor));
        assert_eq!(dog_shape.kind_of("fetch"), Some(MemberKind::Method));
        assert!(dog_shape.resolve("speak").is_some());
        assert!(dog_shape.resolve("missing").is_none());
    }

    #[test]
    fn intrinsic_prototypes_terminate_the_chain() {
        for kind in [Intrinsic::Object, Intrinsic::Function, Intrinsic::RegExp] {
            assert!(ShapeRegistry::shape_for(&Prototype::intrinsic(kind)).is_none());
        }

        let pattern = Prototype::builder("Pattern")
            .extends(&Prototype::intrinsic(Intrinsic::RegExp))
            .method("matches", |_, _| Ok(Value::from(true)))
            .build();
        let shape = ShapeRegistry::shape_for(&pattern).unwrap();
        assert!(shape.parent().is_none());
        assert_eq!(shape.member_names(), vec!["matches"]);
    }

    #[test]
    fn reserved_keys_are_skipped() {
        let proto = Prototype::builder("Odd")
            .method("constructor", |_, _| Ok(Value::Null))
            .method("run", |_, _| Ok(Value::Null))
            .build();
        let shape = ShapeRegistry::shape_for(&proto).unwrap();
        assert_eq!(shape.own_member_names().collect::<Vec<_>>(), vec!["run"]);
        assert!(shape.resolve("constructor").is_none());
    }
}
