//! In-memory element tree implementing [`Document`].
//!
//! Supports the selector subset the engine and tests use: type, `#id`, `.class`,
//! `[attr]`, `[attr="value"]`, compounds of those, descendant and `>` child
//! combinators, and comma-separated lists. Observers fire on child-list changes
//! under their root, after the tree lock is released.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use mooring_core::dom::{
    Document, DocumentError, InsertPosition, MutationCallback, NodeRef, ObserverId,
    HIDDEN_ATTRIBUTE,
};
use mooring_core::extension::RenderedContent;

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    style: BTreeMap<String, String>,
    parent: Option<NodeRef>,
    children: Vec<NodeRef>,
    content: Option<RenderedContent>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
            content: None,
        }
    }

    fn has_class(&self, class: &str) -> bool {
        self.attributes
            .get("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }
}

struct Tree {
    nodes: HashMap<NodeRef, Node>,
    next_node: u64,
    root: NodeRef,
    body: NodeRef,
    observers: BTreeMap<ObserverId, (NodeRef, MutationCallback)>,
    next_observer: u64,
    mutations: u64,
}

impl Tree {
    fn alloc(&mut self, node: Node) -> NodeRef {
        let handle = NodeRef(self.next_node);
        self.next_node += 1;
        self.nodes.insert(handle, node);
        handle
    }

    fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    fn contains(&self, ancestor: NodeRef, node: NodeRef) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent(n);
        }
        false
    }

    fn detach(&mut self, node: NodeRef) -> Option<NodeRef> {
        let parent = self.nodes.get_mut(&node)?.parent.take()?;
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|child| *child != node);
        }
        Some(parent)
    }

    /// Connected nodes in document order.
    fn walk(&self) -> Vec<NodeRef> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            order.push(node);
            if let Some(n) = self.nodes.get(&node) {
                stack.extend(n.children.iter().rev().copied());
            }
        }
        order
    }

    /// Callbacks of observers whose root contains one of `targets`.
    fn observers_of(&self, targets: &[NodeRef]) -> Vec<MutationCallback> {
        self.observers
            .values()
            .filter(|(root, _)| targets.iter().any(|t| self.contains(*root, *t)))
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    fn matches_compound(&self, node: NodeRef, compound: &Compound) -> bool {
        let Some(n) = self.nodes.get(&node) else {
            return false;
        };
        if let Some(tag) = &compound.tag {
            if *tag != n.tag {
                return false;
            }
        }
        if let Some(id) = &compound.id {
            if n.attributes.get("id") != Some(id) {
                return false;
            }
        }
        if !compound.classes.iter().all(|c| n.has_class(c)) {
            return false;
        }
        compound.attributes.iter().all(|(name, value)| {
            match (n.attributes.get(name), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            }
        })
    }

    /// Right-to-left match of `parts[..=last]` ending at `node`.
    fn matches_complex(&self, node: NodeRef, parts: &[(Combinator, Compound)], last: usize) -> bool {
        let (combinator, compound) = &parts[last];
        if !self.matches_compound(node, compound) {
            return false;
        }
        if last == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => self
                .parent(node)
                .is_some_and(|p| self.matches_complex(p, parts, last - 1)),
            Combinator::Descendant => {
                let mut current = self.parent(node);
                while let Some(ancestor) = current {
                    if self.matches_complex(ancestor, parts, last - 1) {
                        return true;
                    }
                    current = self.parent(ancestor);
                }
                false
            }
        }
    }
}

/// Shared in-memory document.
pub struct MemoryDocument {
    tree: Mutex<Tree>,
}

impl MemoryDocument {
    /// A document holding `<html><body></body></html>`.
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        let root = NodeRef(0);
        let body = NodeRef(1);
        let mut html = Node::new("html");
        html.children.push(body);
        let mut body_node = Node::new("body");
        body_node.parent = Some(root);
        nodes.insert(root, html);
        nodes.insert(body, body_node);
        Arc::new(Self {
            tree: Mutex::new(Tree {
                nodes,
                next_node: 2,
                root,
                body,
                observers: BTreeMap::new(),
                next_observer: 0,
                mutations: 0,
            }),
        })
    }

    pub fn body(&self) -> NodeRef {
        self.tree.lock().body
    }

    /// Append an element described by `spec` (`tag#id.class1.class2`) to `parent`.
    pub fn add(&self, parent: NodeRef, spec: &str) -> NodeRef {
        let node = self.build(spec);
        self.append(parent, node);
        node
    }

    /// Create a detached element from `spec` without notifying observers.
    pub fn build(&self, spec: &str) -> NodeRef {
        let (head, classes) = match spec.split_once('.') {
            Some((head, rest)) => (head, rest.split('.').collect::<Vec<_>>()),
            None => (spec, Vec::new()),
        };
        let (tag, id) = match head.split_once('#') {
            Some((tag, id)) => (tag, Some(id)),
            None => (head, None),
        };
        let mut node = Node::new(if tag.is_empty() { "div" } else { tag });
        if let Some(id) = id {
            node.attributes.insert("id".to_string(), id.to_string());
        }
        if !classes.is_empty() {
            node.attributes
                .insert("class".to_string(), classes.join(" "));
        }
        self.tree.lock().alloc(node)
    }

    /// Append `node` to `parent`, notifying observers.
    pub fn append(&self, parent: NodeRef, node: NodeRef) {
        let _ = self.insert(node, parent, InsertPosition::Append);
    }

    pub fn children(&self, node: NodeRef) -> Vec<NodeRef> {
        self.tree
            .lock()
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn tag(&self, node: NodeRef) -> Option<String> {
        self.tree.lock().nodes.get(&node).map(|n| n.tag.clone())
    }

    pub fn content(&self, node: NodeRef) -> Option<RenderedContent> {
        self.tree
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.content.clone())
    }

    /// Rendered markup of the element with DOM id `id`.
    pub fn markup_of(&self, id: &str) -> Option<String> {
        let node = self.element_by_id(id)?;
        self.content(node).map(|c| c.markup)
    }

    /// Connected, not `display: none` anywhere up the chain, and not carrying
    /// the hidden marker.
    pub fn is_visible(&self, node: NodeRef) -> bool {
        let tree = self.tree.lock();
        if !tree.contains(tree.root, node) {
            return false;
        }
        let mut current = Some(node);
        while let Some(n) = current {
            let Some(data) = tree.nodes.get(&n) else {
                return false;
            };
            if data.style.get("display").map(String::as_str) == Some("none")
                || data.attributes.contains_key(HIDDEN_ATTRIBUTE)
            {
                return false;
            }
            current = data.parent;
        }
        true
    }

    pub fn observer_count(&self) -> usize {
        self.tree.lock().observers.len()
    }

    /// Child-list mutations applied so far.
    pub fn mutation_count(&self) -> u64 {
        self.tree.lock().mutations
    }

    fn notify(&self, callbacks: Vec<MutationCallback>) {
        for callback in callbacks {
            callback();
        }
    }
}

impl Document for MemoryDocument {
    fn root(&self) -> NodeRef {
        self.tree.lock().root
    }

    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeRef>, DocumentError> {
        let groups = parse_selector_list(selector)
            .ok_or_else(|| DocumentError::InvalidSelector(selector.to_string()))?;
        let tree = self.tree.lock();
        Ok(tree
            .walk()
            .into_iter()
            .filter(|node| {
                groups
                    .iter()
                    .any(|parts| tree.matches_complex(*node, parts, parts.len() - 1))
            })
            .collect())
    }

    fn element_by_id(&self, id: &str) -> Option<NodeRef> {
        let tree = self.tree.lock();
        tree.walk().into_iter().find(|node| {
            tree.nodes
                .get(node)
                .is_some_and(|n| n.attributes.get("id").map(String::as_str) == Some(id))
        })
    }

    fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.tree.lock().parent(node)
    }

    fn contains(&self, ancestor: NodeRef, node: NodeRef) -> bool {
        self.tree.lock().contains(ancestor, node)
    }

    fn is_connected(&self, node: NodeRef) -> bool {
        let tree = self.tree.lock();
        tree.contains(tree.root, node)
    }

    fn create_element(&self, tag: &str) -> NodeRef {
        self.tree.lock().alloc(Node::new(tag))
    }

    fn insert(
        &self,
        node: NodeRef,
        anchor: NodeRef,
        position: InsertPosition,
    ) -> Result<(), DocumentError> {
        let callbacks = {
            let mut tree = self.tree.lock();
            for handle in [node, anchor] {
                if !tree.nodes.contains_key(&handle) {
                    return Err(DocumentError::NodeNotFound(handle));
                }
            }
            let (parent, index) = match position {
                InsertPosition::Before | InsertPosition::After => {
                    let parent = tree.parent(anchor).ok_or(DocumentError::Detached(anchor))?;
                    (parent, None)
                }
                InsertPosition::Prepend => (anchor, Some(0)),
                InsertPosition::Append => (anchor, None),
            };
            if tree.contains(node, parent) {
                return Err(DocumentError::HierarchyRequest(node));
            }

            let old_parent = tree.detach(node);
            let siblings = &tree
                .nodes
                .get(&parent)
                .ok_or(DocumentError::NodeNotFound(parent))?
                .children;
            let at = match position {
                InsertPosition::Before => siblings.iter().position(|c| *c == anchor),
                InsertPosition::After => siblings
                    .iter()
                    .position(|c| *c == anchor)
                    .map(|i| i + 1),
                InsertPosition::Prepend => index,
                InsertPosition::Append => Some(siblings.len()),
            }
            .unwrap_or(siblings.len());

            if let Some(p) = tree.nodes.get_mut(&parent) {
                p.children.insert(at, node);
            }
            if let Some(n) = tree.nodes.get_mut(&node) {
                n.parent = Some(parent);
            }
            tree.mutations += 1;

            let mut targets = vec![parent];
            targets.extend(old_parent);
            tree.observers_of(&targets)
        };
        self.notify(callbacks);
        Ok(())
    }

    fn remove(&self, node: NodeRef) {
        let callbacks = {
            let mut tree = self.tree.lock();
            let Some(parent) = tree.detach(node) else {
                return;
            };
            tree.mutations += 1;
            tree.observers_of(&[parent])
        };
        self.notify(callbacks);
    }

    fn attribute(&self, node: NodeRef, name: &str) -> Option<String> {
        self.tree
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.attributes.get(name).cloned())
    }

    fn set_attribute(&self, node: NodeRef, name: &str, value: &str) {
        if let Some(n) = self.tree.lock().nodes.get_mut(&node) {
            n.attributes.insert(name.to_string(), value.to_string());
        }
    }

    fn remove_attribute(&self, node: NodeRef, name: &str) {
        if let Some(n) = self.tree.lock().nodes.get_mut(&node) {
            n.attributes.remove(name);
        }
    }

    fn style_property(&self, node: NodeRef, name: &str) -> Option<String> {
        self.tree
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.style.get(name).cloned())
    }

    fn set_style_property(&self, node: NodeRef, name: &str, value: Option<&str>) {
        if let Some(n) = self.tree.lock().nodes.get_mut(&node) {
            match value {
                Some(value) => {
                    n.style.insert(name.to_string(), value.to_string());
                }
                None => {
                    n.style.remove(name);
                }
            }
        }
    }

    fn set_content(&self, node: NodeRef, content: &RenderedContent) {
        let callbacks = {
            let mut tree = self.tree.lock();
            let Some(n) = tree.nodes.get_mut(&node) else {
                return;
            };
            n.content = Some(content.clone());
            tree.mutations += 1;
            tree.observers_of(&[node])
        };
        self.notify(callbacks);
    }

    fn observe(&self, root: NodeRef, callback: MutationCallback) -> ObserverId {
        let mut tree = self.tree.lock();
        let id = ObserverId(tree.next_observer);
        tree.next_observer += 1;
        tree.observers.insert(id, (root, callback));
        id
    }

    fn disconnect(&self, observer: ObserverId) {
        self.tree.lock().observers.remove(&observer);
    }
}

// ============================================================================
// Selector parsing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

/// Each group is a list of compounds, each paired with the combinator that
/// links it to the previous one (ignored on the first).
fn parse_selector_list(selector: &str) -> Option<Vec<Vec<(Combinator, Compound)>>> {
    selector.split(',').map(parse_complex).collect()
}

fn parse_complex(selector: &str) -> Option<Vec<(Combinator, Compound)>> {
    let chars: Vec<char> = selector.trim().chars().collect();
    if chars.is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    let mut pos = 0;
    let mut combinator = Combinator::Descendant;

    while pos < chars.len() {
        let compound = parse_compound(&chars, &mut pos)?;
        parts.push((combinator, compound));

        let mut saw_space = false;
        let mut saw_child = false;
        while pos < chars.len() && (chars[pos].is_whitespace() || chars[pos] == '>') {
            if chars[pos] == '>' {
                if saw_child {
                    return None;
                }
                saw_child = true;
            } else {
                saw_space = true;
            }
            pos += 1;
        }
        if pos == chars.len() {
            if saw_child {
                return None;
            }
            break;
        }
        combinator = match (saw_child, saw_space) {
            (true, _) => Combinator::Child,
            (false, true) => Combinator::Descendant,
            (false, false) => return None,
        };
    }
    Some(parts)
}

fn parse_compound(chars: &[char], pos: &mut usize) -> Option<Compound> {
    let mut compound = Compound::default();
    let start = *pos;

    if chars.get(*pos) == Some(&'*') {
        *pos += 1;
    } else {
        let tag = read_ident(chars, pos);
        if !tag.is_empty() {
            compound.tag = Some(tag.to_ascii_lowercase());
        }
    }

    while let Some(c) = chars.get(*pos) {
        match c {
            '#' => {
                *pos += 1;
                let id = read_ident(chars, pos);
                if id.is_empty() {
                    return None;
                }
                compound.id = Some(id);
            }
            '.' => {
                *pos += 1;
                let class = read_ident(chars, pos);
                if class.is_empty() {
                    return None;
                }
                compound.classes.push(class);
            }
            '[' => {
                *pos += 1;
                let close = chars[*pos..].iter().position(|c| *c == ']')? + *pos;
                let inner: String = chars[*pos..close].iter().collect();
                *pos = close + 1;
                compound.attributes.push(parse_attribute(&inner)?);
            }
            _ => break,
        }
    }

    if *pos == start {
        return None;
    }
    Some(compound)
}

fn parse_attribute(inner: &str) -> Option<(String, Option<String>)> {
    match inner.split_once('=') {
        Some((name, value)) => {
            let name = name.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (!name.is_empty()).then(|| (name.to_string(), Some(value.to_string())))
        }
        None => {
            let name = inner.trim();
            (!name.is_empty()).then(|| (name.to_string(), None))
        }
    }
}

fn read_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while let Some(c) = chars.get(*pos) {
        if c.is_alphanumeric() || *c == '-' || *c == '_' {
            *pos += 1;
        } else {
            break;
        }
    }
    chars[start..*pos].iter().collect()
}
