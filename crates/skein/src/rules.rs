//! The directive rule set.
//!
//! One closed enum of directive kinds, dispatched exhaustively by the
//! pipeline in fixed priority order — the set is fixed, so there is no
//! open-ended rule registration. Each rule knows how to find its
//! occurrences (delegating bracket matching to `skein-scanner`) and how to
//! execute one occurrence against a scope, reporting the rendered output
//! together with the observables it touched.
//!
//! Only [`Interpolation`](DirectiveKind::Interpolation),
//! [`Conditional`](DirectiveKind::Conditional) and
//! [`Iteration`](DirectiveKind::Iteration) support reactive re-evaluation.
//! Reference capture, event binding and injection are static-target-only:
//! handed an Observable where a plain string is required, they raise
//! [`DirectiveError::InvalidStaticTarget`].

use std::rc::Rc;

use crate::error::{DirectiveError, EvalError};
use crate::eval;
use crate::observable::Observable;
use crate::scope::Scope;
use crate::value::Value;

pub use skein_scanner::{find_attrs, find_balanced, find_blocks, find_chains};

/// The closed set of directive kinds, in pipeline priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// `@for(var in expr) { body }`
    Iteration,
    /// `@if(c) { .. } @elseif(c) { .. } @else { .. }`
    Conditional,
    /// `@(expr)`
    Interpolation,
    /// `@[ref]="expr"`
    RefCapture,
    /// `@on[name]="expr"`
    EventBinding,
    /// `@injection[head|tail]="expr"`
    Injection,
}

impl DirectiveKind {
    /// The directive's source syntax, for diagnostics.
    pub fn syntax(self) -> &'static str {
        match self {
            DirectiveKind::Iteration => "@for",
            DirectiveKind::Conditional => "@if",
            DirectiveKind::Interpolation => "@(..)",
            DirectiveKind::RefCapture => "@[ref]",
            DirectiveKind::EventBinding => "@on[..]",
            DirectiveKind::Injection => "@injection[..]",
        }
    }
}

/// Result of executing one directive occurrence: the rendered output text
/// and the observables the directive's own expressions touched.
#[derive(Debug, Default)]
pub struct Execution {
    /// Rendered output, ready to splice into the template text.
    pub output: String,
    /// Observables this occurrence depends on, deduplicated, in
    /// first-appearance order.
    pub deps: Vec<Rc<Observable>>,
}

/// Recursion hook back into the pipeline: directive bodies are template
/// text and expand with the same static/dynamic split as the top level.
pub trait Expander {
    /// Expands nested template text against `scope`.
    fn expand(&mut self, text: &str, scope: &Rc<Scope>) -> String;
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// Executes `@(expr)`. An observable result renders its current value and
/// becomes a dependency.
pub fn execute_interpolation(
    expr: &str,
    scope: &Rc<Scope>,
) -> Result<Execution, DirectiveError> {
    let value = eval::evaluate(expr, scope)?;
    let mut deps = eval::find_observables(expr, scope);
    if let Value::Observable(o) = &value {
        if !deps.iter().any(|d| Rc::ptr_eq(d, o)) {
            deps.push(o.clone());
        }
    }
    Ok(Execution {
        output: value.render(),
        deps,
    })
}

/// Dependencies of `@(expr)` without executing it.
pub fn interpolation_deps(expr: &str, scope: &Rc<Scope>) -> Vec<Rc<Observable>> {
    eval::find_observables(expr, scope)
}

// ---------------------------------------------------------------------------
// Conditional
// ---------------------------------------------------------------------------

/// One conditional branch: condition text (`None` for `@else`) and body.
pub type CondBranch = (Option<String>, String);

/// Dependencies of a chain: the union over every branch condition, since a
/// flip of any condition can change which branch wins.
pub fn conditional_deps(branches: &[CondBranch], scope: &Rc<Scope>) -> Vec<Rc<Observable>> {
    let mut deps: Vec<Rc<Observable>> = Vec::new();
    for (condition, _) in branches {
        if let Some(condition) = condition {
            for o in eval::find_observables(condition, scope) {
                if !deps.iter().any(|d| Rc::ptr_eq(d, &o)) {
                    deps.push(o);
                }
            }
        }
    }
    deps
}

/// Executes a chain: conditions evaluate in order, the first truthy branch
/// (or a trailing `@else`) wins, and only that branch's body is expanded.
pub fn execute_conditional(
    branches: &[CondBranch],
    scope: &Rc<Scope>,
    expander: &mut dyn Expander,
) -> Result<Execution, DirectiveError> {
    let deps = conditional_deps(branches, scope);
    for (condition, body) in branches {
        let taken = match condition {
            Some(condition) => eval::evaluate(condition, scope)?.is_truthy(),
            None => true,
        };
        if taken {
            return Ok(Execution {
                output: expander.expand(body, scope),
                deps,
            });
        }
    }
    Ok(Execution {
        output: String::new(),
        deps,
    })
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Parsed `@for` header: `var in expr` or `idx,var in expr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterHeader {
    /// Optional index variable.
    pub index_var: Option<String>,
    /// Item (or counter) variable.
    pub var: String,
    /// Collection expression text.
    pub collection: String,
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Parses an iteration header. `pos` is the header's offset in the
/// template, carried into syntax diagnostics.
pub fn parse_iter_header(header: &str, pos: usize) -> Result<IterHeader, DirectiveError> {
    let split = header
        .char_indices()
        .find(|&(i, c)| {
            c.is_whitespace()
                && header[i..].trim_start().starts_with("in")
                && header[i..]
                    .trim_start()
                    .chars()
                    .nth(2)
                    .is_none_or(char::is_whitespace)
        })
        .map(|(i, _)| i);
    let Some(split) = split else {
        return Err(DirectiveError::Syntax {
            pos,
            message: format!("@for header `{header}` has no `in`"),
        });
    };
    let vars = header[..split].trim();
    let collection = header[split..]
        .trim_start()
        .trim_start_matches("in")
        .trim()
        .to_string();
    if collection.is_empty() {
        return Err(DirectiveError::Syntax {
            pos,
            message: "@for header has no collection expression".into(),
        });
    }
    let (index_var, var) = match vars.split_once(',') {
        Some((idx, var)) => (Some(idx.trim().to_string()), var.trim().to_string()),
        None => (None, vars.to_string()),
    };
    if !is_ident(&var) || index_var.as_deref().is_some_and(|v| !is_ident(v)) {
        return Err(DirectiveError::Syntax {
            pos,
            message: format!("@for header `{header}` has a bad loop variable"),
        });
    }
    Ok(IterHeader {
        index_var,
        var,
        collection,
    })
}

/// Dependencies of `@for`: the collection expression's observables.
pub fn iteration_deps(header: &IterHeader, scope: &Rc<Scope>) -> Vec<Rc<Observable>> {
    eval::find_observables(&header.collection, scope)
}

/// Executes `@for`: a numeric collection counts `0..N-1`, a list iterates
/// its elements with an optional index, and each iteration expands the
/// body in a fresh child scope. Strings are rejected as ambiguous, and a
/// negative or fractional count is an error.
pub fn execute_iteration(
    header: &IterHeader,
    body: &str,
    scope: &Rc<Scope>,
    expander: &mut dyn Expander,
) -> Result<Execution, DirectiveError> {
    let deps = iteration_deps(header, scope);
    let collection = eval::evaluate(&header.collection, scope)?.concrete();
    let items: Vec<Value> = match collection {
        Value::Num(n) => {
            if n < 0.0 || n.fract() != 0.0 {
                return Err(DirectiveError::BadIterable {
                    got: format!("the number {n}"),
                    snippet: header.collection.clone(),
                });
            }
            (0..n as usize).map(Value::from).collect()
        }
        Value::List(items) => items,
        Value::Str(_) => {
            return Err(DirectiveError::BadIterable {
                got: "a string (ambiguous: characters or items?)".into(),
                snippet: header.collection.clone(),
            });
        }
        other => {
            return Err(DirectiveError::BadIterable {
                got: crate::eval::kind_name(&other).to_string(),
                snippet: header.collection.clone(),
            });
        }
    };

    let mut output = String::new();
    for (i, item) in items.into_iter().enumerate() {
        let mut locals = vec![(header.var.clone(), item)];
        if let Some(index_var) = &header.index_var {
            locals.push((index_var.clone(), Value::from(i)));
        }
        let child = scope.create_child(locals);
        output.push_str(&expander.expand(body, &child));
    }
    Ok(Execution { output, deps })
}

// ---------------------------------------------------------------------------
// Static-target rules (ref capture, event binding, injection)
// ---------------------------------------------------------------------------

/// Evaluates a static-target expression for `@[ref]` / `@injection`.
///
/// The result must be a plain string. An Observable raises
/// [`DirectiveError::InvalidStaticTarget`]; any other shape is a type
/// error.
pub fn static_target(
    expr: &str,
    scope: &Rc<Scope>,
    directive: &'static str,
) -> Result<String, DirectiveError> {
    match eval::evaluate(expr, scope)? {
        Value::Str(name) => Ok(name),
        Value::Observable(_) => Err(DirectiveError::InvalidStaticTarget {
            directive,
            snippet: expr.to_string(),
        }),
        other => Err(DirectiveError::Eval(EvalError::Type(format!(
            "{directive} target must be a string, got {}",
            crate::eval::kind_name(&other)
        )))),
    }
}

/// Executes an `@on[..]` handler expression: a fresh evaluation per
/// firing, in a child scope that additionally exposes `event`.
pub fn execute_event(
    expr: &str,
    scope: &Rc<Scope>,
    event: Value,
) -> Result<Value, DirectiveError> {
    let child = scope.create_child([("event".to_string(), event)]);
    Ok(eval::evaluate(expr, &child)?)
}
