//! # Skein - Templating and Reactivity Engine
//!
//! `skein` compiles directive-annotated markup into live content and keeps
//! that content updated when the underlying reactive values change, without
//! a virtual-tree diff pass. A change to one [`Observable`] re-renders
//! exactly the smallest region that depends on it.
//!
//! ## Core Concepts
//!
//! - [`Observable`]: reactive value cell with synchronous, in-order
//!   subscriber notification
//! - [`Scope`]: layered variable environment expressions evaluate against
//! - [`Pipeline`]: the three-phase `parse -> materialize -> hydrate` state
//!   machine
//! - [`Component`]: a template plus scope and [`LoadHooks`], the single
//!   render entry point
//! - Directive syntax: `@(expr)`, `@if/@elseif/@else`, `@for`, `@[ref]`,
//!   `@on[event]`, `@injection[head|tail]`, with `@@` escaping a literal `@`
//!
//! ## Quick Start
//!
//! ```rust
//! use skein::{Observable, Pipeline, Scope, Value};
//!
//! let scope = Scope::new();
//! let count = Observable::new(0);
//! scope.set("count", Value::Observable(count.clone()));
//!
//! let pipeline = Pipeline::parse("<p>Count: @(count)</p>", &scope);
//! pipeline.materialize().unwrap();
//! pipeline.hydrate().unwrap();
//! assert_eq!(pipeline.markup(), "<p>Count: 0</p>");
//!
//! count.set(5);
//! assert_eq!(pipeline.markup(), "<p>Count: 5</p>");
//! ```
//!
//! ## Static vs. Deferred
//!
//! Phase 1 executes any directive whose inputs are all plain values and
//! splices the result as text. A directive that touches an [`Observable`]
//! is deferred as an inert placeholder instead, then hydrated into an
//! independently re-renderable region wired only to the observables its
//! own expressions use. Bracket matching honors string literals and
//! comments; the low-level scanner lives in the `skein-scanner` crate.

pub mod dom;
pub mod error;
pub mod eval;
pub mod observable;
pub mod pipeline;
pub mod rules;
pub mod scope;
pub mod value;

pub use dom::{Document, NodeId, NodeKind};
pub use error::{DirectiveError, EvalError, SkeinError};
pub use eval::{evaluate, find_observables};
pub use observable::{Observable, SubscriptionId};
pub use pipeline::{Component, LoadHooks, NoHooks, Pipeline};
pub use scope::{Bindable, Scope};
pub use value::{NativeFn, Value};
