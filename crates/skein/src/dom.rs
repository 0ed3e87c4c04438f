//! In-memory node tree.
//!
//! The pipeline materializes templates into a [`Document`]: an arena of
//! nodes addressed by copyable [`NodeId`]s. Ids are stable for the life of
//! a node, which is what lets tests assert that re-rendering one region
//! leaves sibling node identities untouched.
//!
//! Three node kinds exist: elements, text, and markers — the inert
//! placeholders Phase 1 emits for deferred directives. No marker survives
//! hydration of its owning tree.
//!
//! [`Document::parse_fragment`] is the Phase 2 materializer: a lenient
//! hand-written tag scanner. Unclosed elements auto-close at end of input,
//! a mismatched closer closes the elements opened inside it, and an orphan
//! closer is dropped with a debug log — materialization never fails.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::SkeinError;
use crate::value::Value;

/// Stable handle to a node in a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// What a node is.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// An element with a tag name and attributes in source order.
    Element {
        /// Tag name, lowercased as parsed.
        tag: String,
        /// Attribute name/value pairs.
        attrs: Vec<(String, String)>,
    },
    /// A text run.
    Text(String),
    /// Inert placeholder for a deferred directive.
    Marker(u64),
}

struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

type EventHandler = Rc<RefCell<dyn FnMut(&Value)>>;

/// Arena-backed node tree.
pub struct Document {
    nodes: Vec<Option<NodeData>>,
    handlers: HashMap<NodeId, Vec<EventHandler>>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        }));
        id
    }

    fn data(&self, id: NodeId) -> Result<&NodeData, SkeinError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(SkeinError::DeadNode(id))
    }

    fn data_mut(&mut self, id: NodeId) -> Result<&mut NodeData, SkeinError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(SkeinError::DeadNode(id))
    }

    /// Creates a detached element.
    pub fn create_element(&mut self, tag: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Element {
            tag: tag.into(),
            attrs: Vec::new(),
        })
    }

    /// Creates a detached text node.
    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Text(text.into()))
    }

    /// Creates a detached marker node.
    pub fn create_marker(&mut self, marker_id: u64) -> NodeId {
        self.alloc(NodeKind::Marker(marker_id))
    }

    /// True while the node has not been freed.
    pub fn is_live(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(Option::is_some)
    }

    /// The node's kind.
    pub fn kind(&self, id: NodeId) -> Result<&NodeKind, SkeinError> {
        self.data(id).map(|d| &d.kind)
    }

    /// Element tag name, if `id` is an element.
    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.data(id).ok()?.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Attribute value, if present.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.data(id).ok()?.kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Sets (or replaces) an attribute.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) -> Result<(), SkeinError> {
        if let NodeKind::Element { attrs, .. } = &mut self.data_mut(id)?.kind {
            match attrs.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
        Ok(())
    }

    /// Removes an attribute if present.
    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Result<(), SkeinError> {
        if let NodeKind::Element { attrs, .. } = &mut self.data_mut(id)?.kind {
            attrs.retain(|(n, _)| n != name);
        }
        Ok(())
    }

    /// Text content, if `id` is a text node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.data(id).ok()?.kind {
            NodeKind::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Replaces a text node's content in place.
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) -> Result<(), SkeinError> {
        if let NodeKind::Text(s) = &mut self.data_mut(id)?.kind {
            *s = text.into();
        }
        Ok(())
    }

    /// Parent of `id`, if attached.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.data(id).ok()?.parent
    }

    /// Children of `id`, in order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.data(id).map(|d| d.children.clone()).unwrap_or_default()
    }

    /// Position of `child` under `parent`.
    pub fn index_of(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.data(parent).ok()?.children.iter().position(|&c| c == child)
    }

    /// Appends `child` as the last child of `parent`, detaching it from any
    /// previous parent first.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), SkeinError> {
        self.insert_child(parent, child, usize::MAX)
    }

    /// Inserts `child` under `parent` at `index` (clamped to the child
    /// count), detaching it from any previous parent first.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        index: usize,
    ) -> Result<(), SkeinError> {
        self.detach(child)?;
        let len = self.data(parent)?.children.len();
        let index = index.min(len);
        self.data_mut(parent)?.children.insert(index, child);
        self.data_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Detaches `id` from its parent, leaving it and its subtree live.
    pub fn detach(&mut self, id: NodeId) -> Result<(), SkeinError> {
        if let Some(parent) = self.data(id)?.parent {
            self.data_mut(parent)?.children.retain(|&c| c != id);
            self.data_mut(id)?.parent = None;
        }
        Ok(())
    }

    /// Detaches `id` and frees it and its whole subtree. Event handlers on
    /// freed nodes are dropped.
    pub fn remove(&mut self, id: NodeId) -> Result<(), SkeinError> {
        self.detach(id)?;
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(Some(data)) = self.nodes.get_mut(n.0).map(Option::take) {
                stack.extend(data.children);
                self.handlers.remove(&n);
            }
        }
        Ok(())
    }

    /// Replaces `id` with `replacements` at the same position under its
    /// parent, then frees `id`'s subtree. Returns the position used.
    pub fn replace_with(
        &mut self,
        id: NodeId,
        replacements: &[NodeId],
    ) -> Result<usize, SkeinError> {
        let parent = self.data(id)?.parent.ok_or(SkeinError::DeadNode(id))?;
        let index = self.index_of(parent, id).ok_or(SkeinError::DeadNode(id))?;
        self.remove(id)?;
        for (offset, &node) in replacements.iter().enumerate() {
            self.insert_child(parent, node, index + offset)?;
        }
        Ok(index)
    }

    /// Every marker in the subtree under `id` (inclusive), in document
    /// order.
    pub fn collect_markers(&self, id: NodeId) -> Vec<(NodeId, u64)> {
        let mut out = Vec::new();
        self.walk_markers(id, &mut out);
        out
    }

    fn walk_markers(&self, id: NodeId, out: &mut Vec<(NodeId, u64)>) {
        let Ok(data) = self.data(id) else { return };
        if let NodeKind::Marker(m) = data.kind {
            out.push((id, m));
        }
        for &child in &data.children {
            self.walk_markers(child, out);
        }
    }

    /// Registers an event handler on a node.
    pub fn add_handler(&mut self, id: NodeId, f: impl FnMut(&Value) + 'static) {
        self.handlers
            .entry(id)
            .or_default()
            .push(Rc::new(RefCell::new(f)));
    }

    /// Snapshot of a node's handlers, for dispatch outside any document
    /// borrow.
    pub fn handlers(&self, id: NodeId) -> Vec<EventHandler> {
        self.handlers.get(&id).cloned().unwrap_or_default()
    }

    /// Serializes the subtree under `id` back to markup.
    pub fn to_markup(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_markup(id, &mut out);
        out
    }

    fn write_markup(&self, id: NodeId, out: &mut String) {
        let Ok(data) = self.data(id) else { return };
        match &data.kind {
            NodeKind::Text(s) => out.push_str(s),
            NodeKind::Marker(m) => {
                out.push_str(&format!("<w-marker id=\"{m}\"></w-marker>"));
            }
            NodeKind::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push_str(&format!(" {name}=\"{value}\""));
                }
                out.push('>');
                if !is_void_tag(tag) {
                    for &child in &data.children {
                        self.write_markup(child, out);
                    }
                    out.push_str(&format!("</{tag}>"));
                }
            }
        }
    }

    /// Parses a markup fragment into detached nodes, returning the roots in
    /// order. Lenient: never fails.
    pub fn parse_fragment(&mut self, markup: &str) -> Vec<NodeId> {
        let holder = self.create_element("#fragment");
        let mut open_stack: Vec<NodeId> = vec![holder];
        let mut pos = 0usize;

        while pos < markup.len() {
            let rest = &markup[pos..];
            let Some(lt) = rest.find('<') else {
                self.push_text(&mut open_stack, rest);
                break;
            };
            if lt > 0 {
                self.push_text(&mut open_stack, &rest[..lt]);
                pos += lt;
                continue;
            }
            if rest.starts_with("<!--") {
                pos += match rest.find("-->") {
                    Some(end) => end + 3,
                    None => rest.len(),
                };
                continue;
            }
            let Some(gt) = rest.find('>') else {
                // No closing angle: the rest is text.
                self.push_text(&mut open_stack, rest);
                break;
            };
            let inside = &rest[1..gt];
            pos += gt + 1;

            if let Some(name) = inside.strip_prefix('/') {
                self.close_tag(&mut open_stack, name.trim());
                continue;
            }
            let self_closing = inside.ends_with('/');
            let inside = inside.trim_end_matches('/');
            let (tag, attrs) = parse_tag(inside);
            if tag.is_empty() {
                // `<>` or garbage: keep it as text.
                self.push_text(&mut open_stack, &rest[..gt + 1]);
                continue;
            }
            let node = if tag == "w-marker" {
                let marker_id = attrs
                    .iter()
                    .find(|(n, _)| n == "id")
                    .and_then(|(_, v)| v.parse::<u64>().ok())
                    .unwrap_or(0);
                self.create_marker(marker_id)
            } else {
                let el = self.create_element(tag.clone());
                for (name, value) in &attrs {
                    let _ = self.set_attr(el, name, value);
                }
                el
            };
            let top = *open_stack.last().unwrap_or(&holder);
            let _ = self.append_child(top, node);
            if matches!(self.kind(node), Ok(NodeKind::Element { .. }))
                && !self_closing
                && !is_void_tag(&tag)
            {
                open_stack.push(node);
            }
        }

        let roots = self.children(holder);
        for &root in &roots {
            let _ = self.detach(root);
        }
        let _ = self.remove(holder);
        roots
    }

    fn push_text(&mut self, open_stack: &mut [NodeId], text: &str) {
        if text.is_empty() {
            return;
        }
        let node = self.create_text(text);
        if let Some(&top) = open_stack.last() {
            let _ = self.append_child(top, node);
        }
    }

    /// Closes `name`, auto-closing anything opened inside it. An orphan
    /// closer (tag not on the stack) is dropped.
    fn close_tag(&mut self, open_stack: &mut Vec<NodeId>, name: &str) {
        let on_stack = open_stack
            .iter()
            .skip(1)
            .any(|&id| self.tag(id) == Some(name));
        if !on_stack {
            tracing::debug!(tag = name, "orphan close tag dropped");
            return;
        }
        while open_stack.len() > 1 {
            let Some(top) = open_stack.pop() else { break };
            if self.tag(top) == Some(name) {
                break;
            }
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

fn is_void_tag(tag: &str) -> bool {
    matches!(tag, "br" | "hr" | "img" | "input" | "meta" | "link")
}

/// Splits `<tag a="1" b='2' c>` innards into tag name + attributes.
fn parse_tag(inside: &str) -> (String, Vec<(String, String)>) {
    let inside = inside.trim();
    let name_end = inside
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inside.len());
    let tag = inside[..name_end].to_lowercase();
    let mut attrs = Vec::new();
    let mut rest = inside[name_end..].trim_start();
    while !rest.is_empty() {
        let name_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let name = rest[..name_end].to_string();
        rest = rest[name_end..].trim_start();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            let (value, remainder) = match after_eq.as_bytes().first() {
                Some(&q @ (b'"' | b'\'')) => {
                    let q = q as char;
                    match after_eq[1..].find(q) {
                        Some(end) => (after_eq[1..1 + end].to_string(), &after_eq[end + 2..]),
                        None => (after_eq[1..].to_string(), ""),
                    }
                }
                _ => {
                    let end = after_eq
                        .find(|c: char| c.is_whitespace())
                        .unwrap_or(after_eq.len());
                    (after_eq[..end].to_string(), &after_eq[end..])
                }
            };
            if !name.is_empty() {
                attrs.push((name, value));
            }
            rest = remainder.trim_start();
        } else {
            if !name.is_empty() {
                attrs.push((name, String::new()));
            }
        }
    }
    (tag, attrs)
}
