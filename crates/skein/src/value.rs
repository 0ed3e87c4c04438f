//! Runtime value model.
//!
//! [`Value`] is the closed set of shapes an expression can produce or a
//! [`Scope`](crate::Scope) can bind: JSON-like data, plus the three arms the
//! reactive engine needs — [`Observable`](crate::Observable) cells, native
//! callables, and node references captured by `@[ref]`.
//!
//! Plain data converts to and from `serde_json::Value`, so any `Serialize`
//! host object can flow into a scope unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::dom::NodeId;
use crate::error::EvalError;
use crate::observable::Observable;

/// Signature of an application-provided callable bound into a scope.
pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, EvalError>;

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absence of a value; renders as the empty string.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Number (all numerics are f64, like the template language's host).
    Num(f64),
    /// String.
    Str(String),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// A reactive cell. Expressions unwrap it wherever a concrete value is
    /// required; a bare expression yields it as-is so directives can depend
    /// on it.
    Observable(Rc<Observable>),
    /// A pre-bound callable.
    Func(Rc<NativeFn>),
    /// A node captured by `@[ref]`.
    Node(NodeId),
}

impl Value {
    /// Shallow equality, the notification predicate for
    /// [`Observable::set`](crate::Observable::set): scalars compare by
    /// content, observables / callables by pointer identity, nodes by id —
    /// and lists and maps are never shallow-equal, so writing a container
    /// always notifies.
    pub fn shallow_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Observable(a), Value::Observable(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Node(a), Value::Node(b)) => a == b,
            _ => false,
        }
    }

    /// Truthiness: `null`, `false`, `0`, `NaN` and `""` are false; an
    /// observable is as truthy as its current value; everything else is
    /// true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Observable(o) => o.get().is_truthy(),
            _ => true,
        }
    }

    /// Resolves an observable to its current value; any other value is
    /// returned unchanged. Chained observables resolve all the way down.
    pub fn concrete(&self) -> Value {
        let mut v = self.clone();
        while let Value::Observable(o) = v {
            v = o.get();
        }
        v
    }

    /// Display form used when splicing a value into rendered output:
    /// null renders empty, integral numbers render without a fraction,
    /// observables render their current value.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => render_num(*n),
            Value::Str(s) => s.clone(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::render).collect();
                parts.join(",")
            }
            Value::Map(map) => {
                let parts: Vec<String> =
                    map.iter().map(|(k, v)| format!("{k}: {}", v.render())).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Observable(o) => o.get().render(),
            Value::Func(_) => "[function]".to_string(),
            Value::Node(_) => String::new(),
        }
    }

    /// Converts into plain JSON where possible. Observables serialize as
    /// their current value; callables and node references have no JSON
    /// form and yield `None`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Num(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Value::Str(s) => Some(serde_json::Value::String(s.clone())),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                Some(serde_json::Value::Object(out))
            }
            Value::Observable(o) => o.get().to_json(),
            Value::Func(_) | Value::Node(_) => None,
        }
    }
}

fn render_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Num(n) => write!(f, "Num({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Observable(o) => write!(f, "Observable({:?})", o.get()),
            Value::Func(_) => write!(f, "Func(..)"),
            Value::Node(id) => write!(f, "Node({id:?})"),
        }
    }
}

/// Content equality for tests and the `==` operator in expressions.
/// Observables and callables compare by identity; lists and maps by
/// element.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => self.shallow_eq(other),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Num(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Num(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Rc<Observable>> for Value {
    fn from(o: Rc<Observable>) -> Self {
        Value::Observable(o)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}
