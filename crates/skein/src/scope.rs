//! Layered variable environment.
//!
//! A [`Scope`] is the set of names an expression can see. Lookup resolves
//! the local level first, then walks the parent chain; writes always land
//! on the local level, so a child never mutates its parent. Names are
//! unique per level and child shadowing is allowed.
//!
//! Scopes can be built from any `Serialize` host object
//! ([`Scope::from_object`]); such a scope tracks the original object and
//! writes through to it so the two stay synchronized. Types that expose
//! callables implement [`Bindable`] instead — the explicit capability
//! interface replacing reflective member walking.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::error::SkeinError;
use crate::value::Value;

/// Hierarchical mutable variable environment.
pub struct Scope {
    /// Local bindings in insertion order; names unique at this level.
    vars: RefCell<Vec<(String, Value)>>,
    parent: Option<Rc<Scope>>,
    /// Original host object a `from_object` scope stays synchronized with.
    backing: Option<Rc<RefCell<serde_json::Map<String, serde_json::Value>>>>,
}

impl Scope {
    /// Creates an empty root scope.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(Vec::new()),
            parent: None,
            backing: None,
        })
    }

    /// Builds a root scope from a host object's members.
    ///
    /// The object serializes through `serde_json`; each top-level member
    /// becomes a binding. The serialized object is tracked, and later
    /// [`set`](Self::set) calls write through to it, keeping the original
    /// in sync.
    ///
    /// # Errors
    ///
    /// Fails when the object does not serialize, or serializes to
    /// something other than a JSON object.
    pub fn from_object(obj: &impl Serialize) -> Result<Rc<Self>, SkeinError> {
        let json = serde_json::to_value(obj)?;
        let serde_json::Value::Object(map) = json else {
            return Err(SkeinError::HostObject(serde::ser::Error::custom(
                "host object must serialize to a JSON object",
            )));
        };
        let vars: Vec<(String, Value)> = map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        Ok(Rc::new(Self {
            vars: RefCell::new(vars),
            parent: None,
            backing: Some(Rc::new(RefCell::new(map))),
        }))
    }

    /// Installs a [`Bindable`] object's members into this scope.
    pub fn extract(self: &Rc<Self>, obj: &impl Bindable) {
        for (name, value) in obj.bindings() {
            self.set(&name, value);
        }
    }

    /// Resolves `name`: the local level first, then the parent chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some((_, v)) = self.vars.borrow().iter().find(|(n, _)| n == name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Binds `name` at the local level, shadowing any parent binding.
    ///
    /// If this scope tracks a host object and the value has a JSON form,
    /// the write goes through to the object as well.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if let (Some(backing), Some(json)) = (&self.backing, value.to_json()) {
            backing.borrow_mut().insert(name.to_string(), json);
        }
        let mut vars = self.vars.borrow_mut();
        match vars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => vars.push((name.to_string(), value)),
        }
    }

    /// True when `name` resolves anywhere on the chain.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes a local binding. Parent bindings are untouched; removing an
    /// unknown name is a no-op.
    pub fn delete(&self, name: &str) {
        self.vars.borrow_mut().retain(|(n, _)| n != name);
        if let Some(backing) = &self.backing {
            backing.borrow_mut().remove(name);
        }
    }

    /// Derives a child scope with the given local overrides.
    ///
    /// The child resolves its locals first and falls back to this scope's
    /// chain; child writes never propagate upward.
    pub fn create_child(
        self: &Rc<Self>,
        locals: impl IntoIterator<Item = (String, Value)>,
    ) -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(locals.into_iter().collect()),
            parent: Some(self.clone()),
            backing: None,
        })
    }

    /// Copies `other`'s local bindings into this level, last write wins.
    /// Collisions are logged, never fatal.
    pub fn merge(&self, other: &Scope) {
        for (name, value) in other.vars.borrow().iter() {
            if self.vars.borrow().iter().any(|(n, _)| n == name) {
                tracing::warn!(name = %name, "scope merge overwrites existing binding");
            }
            self.set(name, value.clone());
        }
    }

    /// Snapshot of the host object this scope tracks, if any.
    pub fn backing_object(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.backing.as_ref().map(|b| b.borrow().clone())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .vars
            .borrow()
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        f.debug_struct("Scope")
            .field("locals", &names)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Explicit capability interface for exposing a type's members to a scope:
/// named getters and pre-bound callables, declared per type instead of
/// discovered by reflection.
///
/// # Example
///
/// ```rust
/// use std::rc::Rc;
/// use skein::{Bindable, Scope, Value};
///
/// struct Counter {
///     label: String,
/// }
///
/// impl Bindable for Counter {
///     fn bindings(&self) -> Vec<(String, Value)> {
///         let label = self.label.clone();
///         vec![
///             ("label".into(), Value::Str(self.label.clone())),
///             (
///                 "describe".into(),
///                 Value::Func(Rc::new(move |_args| {
///                     Ok(Value::Str(format!("counter: {label}")))
///                 })),
///             ),
///         ]
///     }
/// }
///
/// let scope = Scope::new();
/// scope.extract(&Counter { label: "hits".into() });
/// assert!(scope.has("describe"));
/// ```
pub trait Bindable {
    /// The members to expose, as name/value pairs. Callables must already
    /// be bound to their instance.
    fn bindings(&self) -> Vec<(String, Value)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resolution {
        use super::*;

        #[test]
        fn get_set_roundtrip() {
            let scope = Scope::new();
            scope.set("name", "Alice");
            assert_eq!(scope.get("name"), Some(Value::from("Alice")));
        }

        #[test]
        fn missing_name_is_none() {
            assert_eq!(Scope::new().get("ghost"), None);
        }

        #[test]
        fn child_sees_parent_bindings() {
            let parent = Scope::new();
            parent.set("a", 1);
            let child = parent.create_child([]);
            assert_eq!(child.get("a"), Some(Value::Num(1.0)));
        }

        #[test]
        fn locals_shadow_parent() {
            let parent = Scope::new();
            parent.set("a", 1);
            let child = parent.create_child([("a".to_string(), Value::Num(2.0))]);
            assert_eq!(child.get("a"), Some(Value::Num(2.0)));
            assert_eq!(parent.get("a"), Some(Value::Num(1.0)));
        }

        #[test]
        fn child_writes_never_propagate() {
            let parent = Scope::new();
            parent.set("a", 1);
            let child = parent.create_child([]);
            child.set("a", 99);
            assert_eq!(parent.get("a"), Some(Value::Num(1.0)));
            assert_eq!(child.get("a"), Some(Value::Num(99.0)));
        }

        #[test]
        fn delete_is_local_and_idempotent() {
            let parent = Scope::new();
            parent.set("a", 1);
            let child = parent.create_child([("a".to_string(), Value::Num(2.0))]);
            child.delete("a");
            // Shadow removed, parent binding shows through again.
            assert_eq!(child.get("a"), Some(Value::Num(1.0)));
            child.delete("a");
            assert_eq!(parent.get("a"), Some(Value::Num(1.0)));
        }
    }

    mod merging {
        use super::*;

        #[test]
        fn merge_copies_bindings() {
            let a = Scope::new();
            let b = Scope::new();
            b.set("x", 1);
            b.set("y", 2);
            a.merge(&b);
            assert!(a.has("x"));
            assert!(a.has("y"));
        }

        #[test]
        fn merge_collision_last_write_wins() {
            let a = Scope::new();
            a.set("x", "old");
            let b = Scope::new();
            b.set("x", "new");
            a.merge(&b);
            assert_eq!(a.get("x"), Some(Value::from("new")));
        }
    }

    mod host_objects {
        use super::*;
        use serde::Serialize;

        #[derive(Serialize)]
        struct Person {
            name: String,
            age: u32,
        }

        #[test]
        fn members_become_bindings() {
            let scope = Scope::from_object(&Person {
                name: "Alice".into(),
                age: 30,
            })
            .unwrap();
            assert_eq!(scope.get("name"), Some(Value::from("Alice")));
            assert_eq!(scope.get("age"), Some(Value::Num(30.0)));
        }

        #[test]
        fn set_writes_through_to_original() {
            let scope = Scope::from_object(&Person {
                name: "Alice".into(),
                age: 30,
            })
            .unwrap();
            scope.set("name", "Bob");
            let backing = scope.backing_object().unwrap();
            assert_eq!(backing["name"], serde_json::json!("Bob"));
        }

        #[test]
        fn non_object_host_is_rejected() {
            assert!(Scope::from_object(&42).is_err());
        }

        #[test]
        fn bindable_exposes_bound_callable() {
            struct Doubler;
            impl Bindable for Doubler {
                fn bindings(&self) -> Vec<(String, Value)> {
                    vec![(
                        "double".into(),
                        Value::Func(Rc::new(|args| {
                            let Some(Value::Num(n)) = args.first().map(Value::concrete) else {
                                return Err(crate::error::EvalError::Type(
                                    "double expects a number".into(),
                                ));
                            };
                            Ok(Value::Num(n * 2.0))
                        })),
                    )]
                }
            }
            let scope = Scope::new();
            scope.extract(&Doubler);
            let Some(Value::Func(f)) = scope.get("double") else {
                panic!("double not bound");
            };
            assert_eq!(f(&[Value::Num(4.0)]).unwrap(), Value::Num(8.0));
        }
    }
}
