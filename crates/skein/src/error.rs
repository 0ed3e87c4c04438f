//! Error types for the skein engine.
//!
//! Errors are split by blast radius. [`EvalError`] and [`DirectiveError`]
//! are local to one expression or one directive occurrence: the pipeline
//! catches them at the directive boundary, logs them, records them as
//! diagnostics and renders that directive empty. Only [`SkeinError`] — API
//! misuse like hydrating twice or handing the engine a detached node —
//! propagates to the caller.

use thiserror::Error;

use crate::dom::NodeId;

/// Expression evaluation failure.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// The expression text did not parse.
    #[error("parse error at byte {pos}: {message} in `{snippet}`")]
    Parse {
        /// Byte offset into the expression fragment.
        pos: usize,
        /// What the parser expected or saw.
        message: String,
        /// The offending fragment.
        snippet: String,
    },

    /// An identifier had no binding in the scope chain.
    #[error("undefined variable `{0}`")]
    Undefined(String),

    /// An operand had the wrong shape for its operator.
    #[error("type error: {0}")]
    Type(String),

    /// A callable was invoked with the wrong argument count.
    #[error("call expects {expected} argument(s), got {got}")]
    Arity {
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// Failure raised by an application-provided callable.
    #[error("{0}")]
    Custom(String),
}

/// Failure local to one directive occurrence.
#[derive(Debug, Clone, Error)]
pub enum DirectiveError {
    /// Expression evaluation inside the directive failed.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// `@[ref]` or `@injection` was handed an Observable where a plain
    /// static string is required.
    #[error("{directive} requires a static string target, got an Observable in `{snippet}`")]
    InvalidStaticTarget {
        /// The directive syntax, e.g. `@[ref]`.
        directive: &'static str,
        /// The offending expression text.
        snippet: String,
    },

    /// Injection named a reference that no `@[ref]` ever captured.
    #[error("injection target `{0}` was never captured by @[ref]")]
    MissingTarget(String),

    /// `@for` was given something that is neither a non-negative integer
    /// nor a list.
    #[error("@for cannot iterate {got} in `{snippet}`")]
    BadIterable {
        /// Short description of what the collection evaluated to.
        got: String,
        /// The collection expression text.
        snippet: String,
    },

    /// Malformed directive text (unbalanced body, bad loop header).
    #[error("malformed directive near byte {pos}: {message}")]
    Syntax {
        /// Best-effort byte offset into the template.
        pos: usize,
        /// What was wrong.
        message: String,
    },
}

/// Programmer-facing API misuse. The only error class that crosses the
/// pipeline boundary.
#[derive(Debug, Error)]
pub enum SkeinError {
    /// `hydrate` was called on an already-hydrated pipeline.
    #[error("template is already hydrated")]
    AlreadyHydrated,

    /// A pipeline phase was invoked out of order.
    #[error("`{op}` called before `{needs}`")]
    StageMismatch {
        /// The operation that was attempted.
        op: &'static str,
        /// The phase that must run first.
        needs: &'static str,
    },

    /// A node id that does not belong to the document, or was freed.
    #[error("node {0:?} is not live in this document")]
    DeadNode(NodeId),

    /// Host object could not be converted into scope bindings.
    #[error("host object serialization failed: {0}")]
    HostObject(#[from] serde_json::Error),
}
