//! Document tree abstraction and the anchor injector built on it.
//!
//! The engine never talks to a concrete DOM. It needs selector queries, a handful
//! of node mutations, inline style and attribute access, and subtree child-list
//! observation. Anything providing [`Document`] can host extensions.

pub mod injector;

pub use injector::{container_dom_id, ContainerEvent, DomInjector, HIDDEN_ATTRIBUTE};

use std::fmt;
use std::sync::Arc;

use crate::extension::RenderedContent;

/// Opaque handle to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub u64);

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Handle to an active mutation observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

/// Where to insert a node relative to an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertPosition {
    /// Sibling immediately before the anchor.
    Before,
    /// Sibling immediately after the anchor.
    After,
    /// First child of the anchor.
    Prepend,
    /// Last child of the anchor.
    Append,
}

/// Invoked after child-list changes somewhere under an observed root.
///
/// May be called synchronously from inside a mutating [`Document`] call, so it
/// must not block or take locks the mutator might hold.
pub type MutationCallback = Arc<dyn Fn() + Send + Sync>;

/// Document failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeRef),

    #[error("Node is not attached: {0}")]
    Detached(NodeRef),

    #[error("Cannot insert {0} into its own subtree")]
    HierarchyRequest(NodeRef),
}

/// The tree-change capability the injector runs on.
pub trait Document: Send + Sync {
    /// Top-level element observed by bootstrap observers.
    fn root(&self) -> NodeRef;

    /// Connected elements matching `selector`, in document order.
    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeRef>, DocumentError>;

    /// Connected element carrying DOM id `id`.
    fn element_by_id(&self, id: &str) -> Option<NodeRef>;

    fn parent(&self, node: NodeRef) -> Option<NodeRef>;

    /// Inclusive descendant check.
    fn contains(&self, ancestor: NodeRef, node: NodeRef) -> bool;

    fn is_connected(&self, node: NodeRef) -> bool;

    /// New detached element.
    fn create_element(&self, tag: &str) -> NodeRef;

    /// Move `node` next to or into `anchor`.
    fn insert(
        &self,
        node: NodeRef,
        anchor: NodeRef,
        position: InsertPosition,
    ) -> Result<(), DocumentError>;

    /// Detach `node` from its parent. No-op for detached nodes.
    fn remove(&self, node: NodeRef);

    fn attribute(&self, node: NodeRef, name: &str) -> Option<String>;

    fn set_attribute(&self, node: NodeRef, name: &str, value: &str);

    fn remove_attribute(&self, node: NodeRef, name: &str);

    /// Inline style property.
    fn style_property(&self, node: NodeRef, name: &str) -> Option<String>;

    /// Set (`Some`) or clear (`None`) an inline style property.
    fn set_style_property(&self, node: NodeRef, name: &str, value: Option<&str>);

    /// Replace the rendered content of a container.
    fn set_content(&self, node: NodeRef, content: &RenderedContent);

    /// Watch `root` and its subtree for child-list changes.
    fn observe(&self, root: NodeRef, callback: MutationCallback) -> ObserverId;

    fn disconnect(&self, observer: ObserverId);
}

/// Shared document handle.
pub type DynDocument = Arc<dyn Document>;

/// Nearest element containing every node in `nodes` (inclusive).
///
/// Walks up from the first node until an ancestor contains all others.
pub fn nearest_common_ancestor(document: &dyn Document, nodes: &[NodeRef]) -> Option<NodeRef> {
    let (first, rest) = nodes.split_first()?;
    let mut candidate = Some(*first);
    while let Some(node) = candidate {
        if rest.iter().all(|other| document.contains(node, *other)) {
            return Some(node);
        }
        candidate = document.parent(node);
    }
    None
}
