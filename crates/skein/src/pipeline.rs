//! The three-phase template pipeline.
//!
//! A [`Pipeline`] drives a template through `parsed -> built -> hydrated`:
//!
//! 1. [`parse`](Pipeline::parse) masks `@@` escapes, then runs the rule
//!    passes over the text in fixed priority (iteration, conditional,
//!    interpolation, then the attribute rules, injection strictly last).
//!    A directive whose dependency set is empty executes right there and
//!    splices its output; one that touches an Observable is deferred as an
//!    inert `<w-marker>` carrying its captured expressions and scope.
//!    Nested bodies recurse with the same static/dynamic split.
//! 2. [`materialize`](Pipeline::materialize) parses the now-directive-free
//!    text into the node tree.
//! 3. [`hydrate`](Pipeline::hydrate) walks the tree, executes each marker
//!    against its captured scope, splices the result in place and
//!    subscribes the region to exactly the observables its expressions
//!    touch. Each marker becomes an independently re-renderable region;
//!    a dependency change tears the region's descendants down
//!    (subscriptions released before any node is detached) and rebuilds
//!    its content at the same position.
//!
//! Directive failures never abort a render: they are logged, recorded in
//! [`diagnostics`](Pipeline::diagnostics) and the directive renders empty.
//! Only API misuse (phases out of order, double hydration) reaches the
//! caller as a [`SkeinError`].

use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use skein_scanner::{escape, find_attrs, find_balanced, find_blocks, find_chains};

use crate::dom::{Document, NodeId, NodeKind};
use crate::error::{DirectiveError, SkeinError};
use crate::observable::{Observable, SubscriptionId};
use crate::rules::{self, CondBranch, DirectiveKind, Expander, IterHeader};
use crate::scope::Scope;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Parsed,
    Built,
    Hydrated,
}

/// Captured data for one deferred directive.
#[derive(Clone)]
enum MarkerKind {
    Interp { expr: String },
    Cond { branches: Vec<CondBranch> },
    Iter { header: IterHeader, body: String },
}

#[derive(Clone)]
struct MarkerDef {
    kind: MarkerKind,
    /// Scope current where the directive appeared, loop locals included.
    scope: Rc<Scope>,
}

/// Live output of one hydrated marker.
struct Region {
    nodes: Vec<NodeId>,
    subs: Vec<(Rc<Observable>, SubscriptionId)>,
    /// Regions hydrated inside this one's content; torn down with it.
    children: Vec<u64>,
}

#[derive(Clone, Copy)]
enum InjectPos {
    Head,
    Tail,
}

struct PendingRef {
    name: String,
    scope: Rc<Scope>,
}

struct PendingEvent {
    event: String,
    expr: String,
    scope: Rc<Scope>,
}

struct PendingInjection {
    pos: InjectPos,
    target: String,
}

struct Inner {
    doc: RefCell<Document>,
    stage: Cell<Stage>,
    /// Phase-1 output, still escape-masked.
    expanded: RefCell<String>,
    /// Internal element holding every materialized root, so markers always
    /// have a parent to splice under.
    container: Cell<Option<NodeId>>,
    defs: RefCell<HashMap<u64, MarkerDef>>,
    regions: RefCell<HashMap<u64, Region>>,
    refs: RefCell<HashMap<String, NodeId>>,
    pending_refs: RefCell<HashMap<u64, PendingRef>>,
    pending_events: RefCell<HashMap<u64, PendingEvent>>,
    pending_injections: RefCell<HashMap<u64, PendingInjection>>,
    /// Event names per node, parallel to the document's handler order.
    event_names: RefCell<HashMap<NodeId, Vec<String>>>,
    diagnostics: RefCell<Vec<DirectiveError>>,
    next_id: Cell<u64>,
}

/// A template moving through the three phases.
pub struct Pipeline {
    inner: Rc<Inner>,
}

impl Pipeline {
    /// Phase 1: expands `template` against `scope`.
    ///
    /// Never fails; malformed or failing directives render empty and land
    /// in [`diagnostics`](Self::diagnostics).
    pub fn parse(template: &str, scope: &Rc<Scope>) -> Self {
        let inner = Rc::new(Inner {
            doc: RefCell::new(Document::new()),
            stage: Cell::new(Stage::Parsed),
            expanded: RefCell::new(String::new()),
            container: Cell::new(None),
            defs: RefCell::new(HashMap::new()),
            regions: RefCell::new(HashMap::new()),
            refs: RefCell::new(HashMap::new()),
            pending_refs: RefCell::new(HashMap::new()),
            pending_events: RefCell::new(HashMap::new()),
            pending_injections: RefCell::new(HashMap::new()),
            event_names: RefCell::new(HashMap::new()),
            diagnostics: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        });
        let masked = escape::mask(template);
        let expanded = Inner::expand(&inner, &masked, scope);
        *inner.expanded.borrow_mut() = expanded;
        Pipeline { inner }
    }

    /// Phase 2: materializes the expanded text into the node tree.
    pub fn materialize(&self) -> Result<(), SkeinError> {
        if self.inner.stage.get() != Stage::Parsed {
            return Err(SkeinError::StageMismatch {
                op: "materialize",
                needs: "parse",
            });
        }
        let markup = escape::unmask(&self.inner.expanded.borrow());
        {
            let mut doc = self.inner.doc.borrow_mut();
            let container = doc.create_element("#root");
            let roots = doc.parse_fragment(&markup);
            restore_raw_under(&mut doc, &roots);
            for root in &roots {
                doc.append_child(container, *root)?;
            }
            self.inner.container.set(Some(container));
        }
        self.inner.stage.set(Stage::Built);
        Ok(())
    }

    /// Phase 3: hydrates every marker into a live region and wires refs,
    /// event bindings and injections.
    pub fn hydrate(&self) -> Result<(), SkeinError> {
        match self.inner.stage.get() {
            Stage::Hydrated => return Err(SkeinError::AlreadyHydrated),
            Stage::Parsed => {
                return Err(SkeinError::StageMismatch {
                    op: "hydrate",
                    needs: "materialize",
                })
            }
            Stage::Built => {}
        }
        let roots = self.roots();
        Inner::wire(&self.inner, &roots, None)?;
        self.inner.stage.set(Stage::Hydrated);
        Ok(())
    }

    /// Top-level rendered nodes, in order. Empty before materialization.
    pub fn roots(&self) -> Vec<NodeId> {
        match self.inner.container.get() {
            Some(container) => self.inner.doc.borrow().children(container),
            None => Vec::new(),
        }
    }

    /// Current output as markup text. Before materialization this is the
    /// phase-1 text (deferred directives show as `<w-marker>` elements);
    /// afterwards it serializes the live tree.
    pub fn markup(&self) -> String {
        let Some(container) = self.inner.container.get() else {
            return escape::unmask(&self.inner.expanded.borrow()).replace(RAW_LT, "<");
        };
        let doc = self.inner.doc.borrow();
        doc.children(container)
            .iter()
            .map(|&root| doc.to_markup(root))
            .collect()
    }

    /// Read access to the node tree.
    pub fn document(&self) -> Ref<'_, Document> {
        self.inner.doc.borrow()
    }

    /// Every directive error caught so far, in occurrence order.
    pub fn diagnostics(&self) -> Vec<DirectiveError> {
        self.inner.diagnostics.borrow().clone()
    }

    /// Node captured under `name` by `@[ref]`, once hydrated.
    pub fn get_ref(&self, name: &str) -> Option<NodeId> {
        self.inner.refs.borrow().get(name).copied()
    }

    /// Fires `event` on `node` with `payload`, running each matching
    /// `@on` binding. Returns how many handlers ran. Handler failures are
    /// recorded as diagnostics, never raised.
    pub fn dispatch(&self, node: NodeId, event: &str, payload: impl Into<Value>) -> usize {
        let payload = payload.into();
        let names = self
            .inner
            .event_names
            .borrow()
            .get(&node)
            .cloned()
            .unwrap_or_default();
        let handlers = self.inner.doc.borrow().handlers(node);
        let mut fired = 0;
        for (name, handler) in names.iter().zip(handlers) {
            if name == event {
                (handler.borrow_mut())(&payload);
                fired += 1;
            }
        }
        fired
    }
}

/// Recursion context handed to the rules for nested body expansion.
struct ExpandCx<'a>(&'a Rc<Inner>);

impl Expander for ExpandCx<'_> {
    fn expand(&mut self, text: &str, scope: &Rc<Scope>) -> String {
        Inner::expand(self.0, text, scope)
    }
}

fn marker_markup(id: u64) -> String {
    format!("<w-marker id=\"{id}\"></w-marker>")
}

impl Inner {
    fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn report(&self, err: DirectiveError) {
        tracing::warn!(error = %err, "directive rendered empty");
        self.diagnostics.borrow_mut().push(err);
    }

    fn defer(&self, kind: MarkerKind, scope: &Rc<Scope>) -> u64 {
        let id = self.alloc_id();
        self.defs.borrow_mut().insert(
            id,
            MarkerDef {
                kind,
                scope: scope.clone(),
            },
        );
        id
    }

    // -- phase 1: text passes ------------------------------------------------

    fn expand(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let text = Self::pass_iterations(inner, text, scope);
        let text = Self::pass_conditionals(inner, &text, scope);
        let text = Self::pass_interpolations(inner, &text, scope);
        let text = Self::pass_refs(inner, &text, scope);
        let text = Self::pass_events(inner, &text, scope);
        Self::pass_injections(inner, &text, scope)
    }

    fn pass_iterations(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let blocks = find_blocks(text, "@for");
        if blocks.is_empty() {
            return text.to_string();
        }
        // A loop inside a conditional branch belongs to that branch: it
        // expands through the chain's recursion only if the branch wins.
        let chains: Vec<(usize, usize)> = find_chains(text)
            .iter()
            .map(|c| (c.start, c.end))
            .collect();
        let mut out = String::new();
        let mut last = 0;
        for block in blocks {
            if chains
                .iter()
                .any(|&(start, end)| block.start >= start && block.end <= end)
            {
                continue;
            }
            out.push_str(&text[last..block.start]);
            last = block.end;
            let header = match rules::parse_iter_header(&block.condition, block.start) {
                Ok(header) => header,
                Err(err) => {
                    inner.report(err);
                    continue;
                }
            };
            if rules::iteration_deps(&header, scope).is_empty() {
                match rules::execute_iteration(&header, &block.body, scope, &mut ExpandCx(inner)) {
                    Ok(exec) => out.push_str(&exec.output),
                    Err(err) => inner.report(err),
                }
            } else {
                let id = inner.defer(
                    MarkerKind::Iter {
                        header,
                        body: block.body,
                    },
                    scope,
                );
                out.push_str(&marker_markup(id));
            }
        }
        out.push_str(&text[last..]);
        out
    }

    fn pass_conditionals(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let chains = find_chains(text);
        if chains.is_empty() {
            return text.to_string();
        }
        let mut out = String::new();
        let mut last = 0;
        for chain in chains {
            out.push_str(&text[last..chain.start]);
            last = chain.end;
            let branches: Vec<CondBranch> = chain
                .branches
                .into_iter()
                .map(|b| (b.condition, b.body))
                .collect();
            if rules::conditional_deps(&branches, scope).is_empty() {
                match rules::execute_conditional(&branches, scope, &mut ExpandCx(inner)) {
                    Ok(exec) => out.push_str(&exec.output),
                    Err(err) => inner.report(err),
                }
            } else {
                let id = inner.defer(MarkerKind::Cond { branches }, scope);
                out.push_str(&marker_markup(id));
            }
        }
        out.push_str(&text[last..]);
        out
    }

    fn pass_interpolations(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let spans = find_balanced(text, "@(", ')');
        if spans.is_empty() {
            return text.to_string();
        }
        let mut out = String::new();
        let mut last = 0;
        for span in spans {
            out.push_str(&text[last..span.start]);
            last = span.end;
            let expr = span.inner(text);
            let deferred = if rules::interpolation_deps(expr, scope).is_empty() {
                match rules::execute_interpolation(expr, scope) {
                    Ok(exec) if exec.deps.is_empty() => {
                        out.push_str(&mask_output(&exec.output));
                        false
                    }
                    // The result itself is an Observable, reached through
                    // a list, map or call rather than a free identifier.
                    Ok(_) => true,
                    Err(err) => {
                        inner.report(err);
                        false
                    }
                }
            } else {
                true
            };
            if deferred {
                let id = inner.defer(
                    MarkerKind::Interp {
                        expr: expr.to_string(),
                    },
                    scope,
                );
                out.push_str(&marker_markup(id));
            }
        }
        out.push_str(&text[last..]);
        out
    }

    fn pass_refs(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let matches = find_attrs(text, "@");
        if matches.is_empty() {
            return text.to_string();
        }
        let mut out = String::new();
        let mut last = 0;
        for m in matches {
            out.push_str(&text[last..m.start]);
            last = m.end;
            if m.key != "ref" {
                inner.report(DirectiveError::Syntax {
                    pos: m.start,
                    message: format!("unknown attribute directive `@[{}]`", m.key),
                });
                continue;
            }
            match rules::static_target(&m.value, scope, DirectiveKind::RefCapture.syntax()) {
                Ok(name) => {
                    // The name is visible (as null) from parse time on; the
                    // real node binds at hydration.
                    scope.set(&name, Value::Null);
                    let id = inner.alloc_id();
                    inner.pending_refs.borrow_mut().insert(
                        id,
                        PendingRef {
                            name,
                            scope: scope.clone(),
                        },
                    );
                    out.push_str(&format!("data-skein-ref=\"{id}\""));
                }
                Err(err) => inner.report(err),
            }
        }
        out.push_str(&text[last..]);
        out
    }

    fn pass_events(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let matches = find_attrs(text, "@on");
        if matches.is_empty() {
            return text.to_string();
        }
        let mut out = String::new();
        let mut last = 0;
        for m in matches {
            out.push_str(&text[last..m.start]);
            last = m.end;
            let id = inner.alloc_id();
            inner.pending_events.borrow_mut().insert(
                id,
                PendingEvent {
                    event: m.key,
                    expr: m.value,
                    scope: scope.clone(),
                },
            );
            // The id lives in the attribute name: several bindings on one
            // element must not collapse into a single attribute.
            out.push_str(&format!("data-skein-on-{id}=\"\""));
        }
        out.push_str(&text[last..]);
        out
    }

    fn pass_injections(inner: &Rc<Inner>, text: &str, scope: &Rc<Scope>) -> String {
        let matches = find_attrs(text, "@injection");
        if matches.is_empty() {
            return text.to_string();
        }
        let mut out = String::new();
        let mut last = 0;
        for m in matches {
            out.push_str(&text[last..m.start]);
            last = m.end;
            let pos = match m.key.as_str() {
                "head" => InjectPos::Head,
                "tail" => InjectPos::Tail,
                other => {
                    inner.report(DirectiveError::Syntax {
                        pos: m.start,
                        message: format!(
                            "@injection position must be `head` or `tail`, got `{other}`"
                        ),
                    });
                    continue;
                }
            };
            match rules::static_target(&m.value, scope, DirectiveKind::Injection.syntax()) {
                Ok(target) => {
                    let id = inner.alloc_id();
                    inner
                        .pending_injections
                        .borrow_mut()
                        .insert(id, PendingInjection { pos, target });
                    out.push_str(&format!("data-skein-inject=\"{id}\""));
                }
                Err(err) => inner.report(err),
            }
        }
        out.push_str(&text[last..]);
        out
    }

    // -- phase 3: wiring -----------------------------------------------------

    /// Wires one freshly-inserted set of roots: refs first, then events,
    /// then markers (recursively), injections strictly last.
    fn wire(
        inner: &Rc<Inner>,
        roots: &[NodeId],
        parent_region: Option<u64>,
    ) -> Result<(), SkeinError> {
        Self::wire_refs(inner, roots);
        Self::wire_events(inner, roots);
        for &root in roots {
            let markers = inner.doc.borrow().collect_markers(root);
            for (node, id) in markers {
                if inner.doc.borrow().is_live(node) {
                    Self::hydrate_marker(inner, node, id, parent_region)?;
                }
            }
        }
        Self::wire_injections(inner, roots);
        Ok(())
    }

    fn elements_under(doc: &Document, roots: &[NodeId]) -> Vec<NodeId> {
        fn walk(doc: &Document, id: NodeId, out: &mut Vec<NodeId>) {
            if doc.tag(id).is_some() {
                out.push(id);
            }
            for child in doc.children(id) {
                walk(doc, child, out);
            }
        }
        let mut out = Vec::new();
        for &root in roots {
            walk(doc, root, &mut out);
        }
        out
    }

    fn wire_refs(inner: &Rc<Inner>, roots: &[NodeId]) {
        let mut captures = Vec::new();
        {
            let doc = inner.doc.borrow();
            for el in Self::elements_under(&doc, roots) {
                if let Some(v) = doc.attr(el, "data-skein-ref") {
                    if let Ok(id) = v.parse::<u64>() {
                        captures.push((el, id));
                    }
                }
            }
        }
        for (el, id) in captures {
            let _ = inner.doc.borrow_mut().remove_attr(el, "data-skein-ref");
            let Some(pending) = inner.pending_refs.borrow_mut().remove(&id) else {
                continue;
            };
            pending.scope.set(&pending.name, Value::Node(el));
            inner.refs.borrow_mut().insert(pending.name, el);
        }
    }

    fn wire_events(inner: &Rc<Inner>, roots: &[NodeId]) {
        let mut bindings = Vec::new();
        {
            let doc = inner.doc.borrow();
            for el in Self::elements_under(&doc, roots) {
                if let Ok(NodeKind::Element { attrs, .. }) = doc.kind(el) {
                    for (name, _) in attrs {
                        if let Some(suffix) = name.strip_prefix("data-skein-on-") {
                            if let Ok(id) = suffix.parse::<u64>() {
                                bindings.push((el, id, name.clone()));
                            }
                        }
                    }
                }
            }
        }
        for (el, id, attr_name) in bindings {
            let _ = inner.doc.borrow_mut().remove_attr(el, &attr_name);
            let Some(pending) = inner.pending_events.borrow_mut().remove(&id) else {
                continue;
            };
            let weak = Rc::downgrade(inner);
            let expr = pending.expr;
            let scope = pending.scope;
            inner.doc.borrow_mut().add_handler(el, move |payload: &Value| {
                if let Err(err) = rules::execute_event(&expr, &scope, payload.clone()) {
                    tracing::warn!(error = %err, "event handler failed");
                    if let Some(inner) = weak.upgrade() {
                        inner.diagnostics.borrow_mut().push(err);
                    }
                }
            });
            inner
                .event_names
                .borrow_mut()
                .entry(el)
                .or_default()
                .push(pending.event);
        }
    }

    fn wire_injections(inner: &Rc<Inner>, roots: &[NodeId]) {
        let mut found = Vec::new();
        {
            let doc = inner.doc.borrow();
            for el in Self::elements_under(&doc, roots) {
                if let Some(v) = doc.attr(el, "data-skein-inject") {
                    if let Ok(id) = v.parse::<u64>() {
                        found.push((el, id));
                    }
                }
            }
        }
        for (el, id) in found {
            let _ = inner.doc.borrow_mut().remove_attr(el, "data-skein-inject");
            let Some(pending) = inner.pending_injections.borrow_mut().remove(&id) else {
                continue;
            };
            let Some(target) = inner.refs.borrow().get(&pending.target).copied() else {
                inner.report(DirectiveError::MissingTarget(pending.target));
                continue;
            };
            let mut doc = inner.doc.borrow_mut();
            if !doc.is_live(target) || target == el || is_ancestor(&doc, el, target) {
                tracing::warn!(target = %pending.target, "injection target unusable, skipped");
                continue;
            }
            let spliced = match pending.pos {
                InjectPos::Head => doc.insert_child(target, el, 0),
                InjectPos::Tail => doc.append_child(target, el),
            };
            if let Err(err) = spliced {
                tracing::warn!(error = %err, "injection failed");
            }
        }
    }

    fn def_deps(def: &MarkerDef) -> Vec<Rc<Observable>> {
        match &def.kind {
            MarkerKind::Interp { expr } => rules::interpolation_deps(expr, &def.scope),
            MarkerKind::Cond { branches } => rules::conditional_deps(branches, &def.scope),
            MarkerKind::Iter { header, .. } => rules::iteration_deps(header, &def.scope),
        }
    }

    /// Executes a deferred directive. Failures become diagnostics and
    /// empty output; a failed directive still carries its static
    /// dependencies so the region re-renders on a later change. The
    /// output text is still escape-masked.
    fn execute_def(inner: &Rc<Inner>, def: &MarkerDef) -> rules::Execution {
        let result = match &def.kind {
            MarkerKind::Interp { expr } => {
                rules::execute_interpolation(expr, &def.scope).map(|e| rules::Execution {
                    output: mask_output(&e.output),
                    deps: e.deps,
                })
            }
            MarkerKind::Cond { branches } => {
                rules::execute_conditional(branches, &def.scope, &mut ExpandCx(inner))
            }
            MarkerKind::Iter { header, body } => {
                rules::execute_iteration(header, body, &def.scope, &mut ExpandCx(inner))
            }
        };
        match result {
            Ok(exec) => exec,
            Err(err) => {
                inner.report(err);
                rules::Execution {
                    output: String::new(),
                    deps: Self::def_deps(def),
                }
            }
        }
    }

    /// Subscribes region `id` to each of `deps`, returning the handles.
    fn subscribe_region(
        inner: &Rc<Inner>,
        id: u64,
        deps: Vec<Rc<Observable>>,
    ) -> Vec<(Rc<Observable>, SubscriptionId)> {
        let mut subs = Vec::new();
        for obs in deps {
            let weak = Rc::downgrade(inner);
            let sub = obs.subscribe(move |_, _| {
                if let Some(inner) = weak.upgrade() {
                    if let Err(err) = Inner::rerender(&inner, id) {
                        tracing::warn!(error = %err, marker = id, "re-render failed");
                    }
                }
            });
            subs.push((obs, sub));
        }
        subs
    }

    fn hydrate_marker(
        inner: &Rc<Inner>,
        node: NodeId,
        id: u64,
        parent_region: Option<u64>,
    ) -> Result<(), SkeinError> {
        // An id that already has a live region is not ours to fill again:
        // filling it twice would duplicate the region and leak its
        // subscriptions.
        let def = if inner.regions.borrow().contains_key(&id) {
            None
        } else {
            inner.defs.borrow().get(&id).cloned()
        };
        let Some(def) = def else {
            // A literal w-marker element in the input, not one of ours.
            let anchor = inner.doc.borrow_mut().create_text("");
            inner.doc.borrow_mut().replace_with(node, &[anchor])?;
            return Ok(());
        };

        let exec = Self::execute_def(inner, &def);
        let markup = escape::unmask(&exec.output);

        let mut roots = inner.doc.borrow_mut().parse_fragment(&markup);
        if roots.is_empty() {
            // Empty output keeps an anchor so the position survives.
            roots.push(inner.doc.borrow_mut().create_text(""));
        }
        {
            let mut doc = inner.doc.borrow_mut();
            restore_raw_under(&mut doc, &roots);
        }
        inner.doc.borrow_mut().replace_with(node, &roots)?;

        let subs = Self::subscribe_region(inner, id, exec.deps);
        inner.regions.borrow_mut().insert(
            id,
            Region {
                nodes: roots.clone(),
                subs,
                children: Vec::new(),
            },
        );
        if let Some(parent) = parent_region {
            if let Some(region) = inner.regions.borrow_mut().get_mut(&parent) {
                region.children.push(id);
            }
        }
        Self::wire(inner, &roots, Some(id))
    }

    /// Re-renders one region after a dependency changed.
    fn rerender(inner: &Rc<Inner>, id: u64) -> Result<(), SkeinError> {
        let def = inner.defs.borrow().get(&id).cloned();
        let Some(def) = def else { return Ok(()) };
        if !inner.regions.borrow().contains_key(&id) {
            return Ok(());
        }
        let exec = Self::execute_def(inner, &def);
        let markup = escape::unmask(&exec.output);

        // Descendant subscriptions go first, before any node is detached.
        let children = inner
            .regions
            .borrow()
            .get(&id)
            .map(|r| r.children.clone())
            .unwrap_or_default();
        for child in children {
            Self::teardown(inner, child);
        }

        let old_nodes = inner
            .regions
            .borrow()
            .get(&id)
            .map(|r| r.nodes.clone())
            .unwrap_or_default();
        let Some(&first) = old_nodes.first() else {
            return Ok(());
        };
        let (parent, index) = {
            let doc = inner.doc.borrow();
            let Some(parent) = doc.parent(first) else {
                return Ok(());
            };
            (parent, doc.index_of(parent, first).unwrap_or(0))
        };
        {
            let mut doc = inner.doc.borrow_mut();
            for &n in &old_nodes {
                let _ = doc.remove(n);
            }
        }
        let mut roots = inner.doc.borrow_mut().parse_fragment(&markup);
        if roots.is_empty() {
            roots.push(inner.doc.borrow_mut().create_text(""));
        }
        {
            let mut doc = inner.doc.borrow_mut();
            restore_raw_under(&mut doc, &roots);
            for (offset, &n) in roots.iter().enumerate() {
                doc.insert_child(parent, n, index + offset)?;
            }
        }
        {
            let doc = inner.doc.borrow();
            inner.event_names.borrow_mut().retain(|&n, _| doc.is_live(n));
        }
        // The dependency set can shift between renders (an observable
        // reached through an index or member, say), so the region's
        // subscriptions follow this execution's report.
        let old_subs = inner
            .regions
            .borrow_mut()
            .get_mut(&id)
            .map(|r| std::mem::take(&mut r.subs))
            .unwrap_or_default();
        for (obs, sub) in old_subs {
            obs.unsubscribe(sub);
        }
        let subs = Self::subscribe_region(inner, id, exec.deps);
        if let Some(region) = inner.regions.borrow_mut().get_mut(&id) {
            region.nodes = roots.clone();
            region.children.clear();
            region.subs = subs;
        }
        Self::wire(inner, &roots, Some(id))
    }

    /// Permanently destroys a region: children recursively, then its own
    /// subscriptions, then its deferred definition.
    fn teardown(inner: &Rc<Inner>, id: u64) {
        let Some(region) = inner.regions.borrow_mut().remove(&id) else {
            return;
        };
        for child in region.children {
            Self::teardown(inner, child);
        }
        for (obs, sub) in region.subs {
            obs.unsubscribe(sub);
        }
        inner.defs.borrow_mut().remove(&id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Listeners hold only a weak handle back here; release them so the
        // application's observables do not accumulate dead subscriptions.
        for (_, region) in self.regions.borrow_mut().drain() {
            for (obs, sub) in region.subs {
                obs.unsubscribe(sub);
            }
        }
    }
}

/// Private-use stand-in for a literal `<` coming out of a rendered value.
/// It passes through the markup parser as plain text and is restored only
/// afterwards, so a value can never fabricate an element or a marker.
const RAW_LT: char = '\u{E001}';

/// Masks markup-significant text in rendered output so a value containing
/// `@` or `<` can never be reinterpreted as a directive or a tag by a
/// later pass. Both are restored as literal text at the end.
fn mask_output(output: &str) -> String {
    output
        .replace('@', &escape::SENTINEL.to_string())
        .replace('<', &RAW_LT.to_string())
}

/// Restores masked `<` in text nodes and attribute values under `roots`.
fn restore_raw_under(doc: &mut Document, roots: &[NodeId]) {
    let mut stack: Vec<NodeId> = roots.to_vec();
    while let Some(n) = stack.pop() {
        stack.extend(doc.children(n));
        let fixed_text = doc
            .text(n)
            .filter(|t| t.contains(RAW_LT))
            .map(|t| t.replace(RAW_LT, "<"));
        if let Some(text) = fixed_text {
            let _ = doc.set_text(n, text);
        }
        let fixed_attrs: Vec<(String, String)> = match doc.kind(n) {
            Ok(NodeKind::Element { attrs, .. }) => attrs
                .iter()
                .filter(|(_, v)| v.contains(RAW_LT))
                .map(|(k, v)| (k.clone(), v.replace(RAW_LT, "<")))
                .collect(),
            _ => Vec::new(),
        };
        for (name, value) in fixed_attrs {
            let _ = doc.set_attr(n, &name, &value);
        }
    }
}

fn is_ancestor(doc: &Document, maybe_ancestor: NodeId, node: NodeId) -> bool {
    let mut cur = doc.parent(node);
    while let Some(p) = cur {
        if p == maybe_ancestor {
            return true;
        }
        cur = doc.parent(p);
    }
    false
}

/// Hooks into [`Component::load`]. Every hook defaults to a no-op.
pub trait LoadHooks {
    /// Runs before phase 1, with the scope about to be used.
    fn pre_init(&mut self, _scope: &Rc<Scope>) {}
    /// Runs after materialization, before hydration.
    fn pre_load(&mut self, _pipeline: &Pipeline) {}
    /// Runs once top-level hydration completes.
    fn post_load(&mut self, _pipeline: &Pipeline) {}
}

/// Hook set that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl LoadHooks for NoHooks {}

/// A template plus its scope and lifecycle hooks: the single render entry
/// the surrounding framework calls.
pub struct Component<H = NoHooks> {
    template: String,
    scope: Rc<Scope>,
    hooks: H,
}

impl Component<NoHooks> {
    /// A component without hooks.
    pub fn new(template: impl Into<String>, scope: Rc<Scope>) -> Self {
        Self {
            template: template.into(),
            scope,
            hooks: NoHooks,
        }
    }
}

impl<H: LoadHooks> Component<H> {
    /// A component with lifecycle hooks.
    pub fn with_hooks(template: impl Into<String>, scope: Rc<Scope>, hooks: H) -> Self {
        Self {
            template: template.into(),
            scope,
            hooks,
        }
    }

    /// The component's scope.
    pub fn scope(&self) -> &Rc<Scope> {
        &self.scope
    }

    /// Runs the full render: `pre_init`, parse, materialize, `pre_load`,
    /// hydrate, `post_load`. Returns once top-level hydration completes.
    pub fn load(&mut self) -> Result<Pipeline, SkeinError> {
        self.hooks.pre_init(&self.scope);
        let pipeline = Pipeline::parse(&self.template, &self.scope);
        pipeline.materialize()?;
        self.hooks.pre_load(&pipeline);
        pipeline.hydrate()?;
        self.hooks.post_load(&pipeline);
        Ok(pipeline)
    }
}
