//! The object & capability registry (C1).
//!
//! Grounded in `examples/ThomasHabets-rustradio/src/lib.rs`'s `Sample`/`Len`
//! trait pattern (one trait per behavior, implemented per concrete type)
//! and in `spec.md` §9's own re-architecting note: *"one trait per
//! capability; values are either trait objects or tagged sum types... a
//! trait-object map keyed by type-id."* This module builds the latter.
//!
//! `spec.md` §3/§4.1 describes objects as heap cells carrying a refcount,
//! a type descriptor, and a `(capability-id, vtable)` table, with weak
//! references as slots the referent clears at teardown. Rust's `Rc`/`Weak`
//! already implement exactly that refcount-and-teardown contract, so this
//! crate does not hand-roll one: an "object" here is anything wrapped in
//! `Rc<T>`, and a weak reference is `std::rc::Weak<T>`. What *is* built is
//! the capability side: a registry that lets a concrete object advertise,
//! at construction time, which capability traits it supports, keyed by a
//! process-stable id, and looked up dynamically without the caller knowing
//! the concrete type.

use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Global, stable identifier for one capability.
///
/// `spec.md` §4.1: *"Capability IDs are stored as addresses of static
/// integer variables so identity is global and stable per process."* In
/// Rust the equivalent stable, collision-free identifier is
/// `TypeId::of::<Marker>()` for a zero-sized marker type unique to each
/// capability — no registry of addresses needs to be maintained by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityId(TypeId);

impl CapabilityId {
    /// Capability id for the capability wrapper type `C` (typically
    /// `Rc<dyn SomeCapabilityTrait>`).
    pub fn of<C: 'static>() -> Self {
        CapabilityId(TypeId::of::<C>())
    }
}

/// A table of (capability-id, vtable) pairs attached to one object.
///
/// Each entry stores a capability handle — conventionally `Rc<dyn Trait>`
/// — boxed as `dyn Any` so it can live in a single homogeneous map. The
/// `Any` downcast at `get` time recovers the concrete capability type,
/// which is the vtable dispatch `spec.md` describes: the caller never
/// needs to know which concrete struct backs the object, only which
/// capability it is asking for.
#[derive(Default)]
pub struct Capabilities {
    table: HashMap<TypeId, Box<dyn Any>>,
}

impl Capabilities {
    /// A fresh, empty capability table.
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register a capability. `cap` is usually an `Rc<dyn Trait>` cloned
    /// from the object's own `Rc`; registering the same capability type
    /// twice overwrites the earlier registration, matching the teacher's
    /// style of initializing fields once in a constructor.
    pub fn insert<C: 'static>(&mut self, cap: C) {
        self.table.insert(TypeId::of::<C>(), Box::new(cap));
    }

    /// `get_interface(obj, cap_id) -> vtable|null` from `spec.md` §4.1.
    /// Returns `None` if the object never registered that capability;
    /// callers that `.expect()` this signal a programming error, exactly
    /// as the spec states.
    pub fn get<C: 'static>(&self) -> Option<&C> {
        self.table.get(&TypeId::of::<C>())?.downcast_ref::<C>()
    }

    /// `is_type` convenience: does this table carry capability `C` at all.
    pub fn supports<C: 'static>(&self) -> bool {
        self.table.contains_key(&TypeId::of::<C>())
    }
}

/// A type descriptor: the non-capability part of `spec.md` §4.1's object
/// header (a display name; lifecycle hooks are simply `Drop`/`Display`/
/// `PartialEq`/`Hash` impls on the concrete Rust type, so they are not
/// reified here as function pointers the way the C source's
/// `UtObjectInterface` does).
#[derive(Debug, Clone, Copy)]
pub struct TypeDescriptor {
    /// Human-readable type name, e.g. `"OwnedBytes"`.
    pub name: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    trait Greet {
        fn greet(&self) -> String;
    }

    struct Dog;
    impl Greet for Dog {
        fn greet(&self) -> String {
            "woof".into()
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut caps = Capabilities::new();
        let dog: Rc<dyn Greet> = Rc::new(Dog);
        caps.insert(dog);
        let found = caps.get::<Rc<dyn Greet>>().expect("capability present");
        assert_eq!(found.greet(), "woof");
    }

    #[test]
    fn missing_capability_is_null_not_panic() {
        let caps = Capabilities::new();
        assert!(caps.get::<Rc<dyn Greet>>().is_none());
        assert!(!caps.supports::<Rc<dyn Greet>>());
    }

    #[test]
    fn reinsertion_replaces_in_place() {
        struct Cat;
        impl Greet for Cat {
            fn greet(&self) -> String {
                "meow".into()
            }
        }
        let mut caps = Capabilities::new();
        caps.insert::<Rc<dyn Greet>>(Rc::new(Dog));
        caps.insert::<Rc<dyn Greet>>(Rc::new(Cat));
        assert_eq!(caps.get::<Rc<dyn Greet>>().unwrap().greet(), "meow");
    }
}
