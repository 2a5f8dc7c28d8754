//! Mount points the sync engines render into.
//!
//! Widgets never touch a concrete UI. They receive a [`MountPoint`] for the
//! region they own and only create, remove, fill, and reorder its children.
//! [`MemoryDocument`] is a headless tree used by the CLI and tests.

use crate::error::{Result, SyncError};
use crate::protocol::CellDescriptor;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Region,
    Row,
    Cell,
    HeaderRow,
    HeaderCell,
}

/// A region of the page exclusively owned by one widget.
pub trait MountPoint {
    /// Create a node under `parent` (the mount root when `None`), appended
    /// after existing siblings.
    fn create_child(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId;

    /// Detach and drop `node` with its subtree. Returns false if unknown.
    fn remove_child(&mut self, node: NodeId) -> bool;

    /// Replace content and presentation hints of `node`.
    fn set_content(&mut self, node: NodeId, cell: &CellDescriptor);

    /// Reposition `node` among its siblings, clamped to the sibling count.
    fn move_child(&mut self, node: NodeId, index: usize);
}

/// Page-level lookup of mount points and free-standing content regions.
pub trait Document {
    fn mount(&self, element_id: &str) -> Option<Box<dyn MountPoint>>;

    /// Replace the raw content of the element `element_id`.
    fn replace_content(&mut self, element_id: &str, html: &str) -> Result<()>;
}

/// Read-only copy of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub content: String,
    pub class_name: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub children: Vec<NodeId>,
}

#[derive(Debug)]
struct ViewNode {
    kind: NodeKind,
    content: String,
    class_name: Option<String>,
    width: Option<String>,
    height: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl ViewNode {
    fn new(kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            content: String::new(),
            class_name: None,
            width: None,
            height: None,
            parent,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct DocumentTree {
    nodes: HashMap<NodeId, ViewNode>,
    elements: HashMap<String, NodeId>,
    next_id: NodeId,
}

impl DocumentTree {
    fn allocate(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        self.next_id += 1;
        let id = self.next_id;
        self.nodes.insert(id, ViewNode::new(kind, parent));
        if let Some(parent) = parent
            && let Some(parent_node) = self.nodes.get_mut(&parent)
        {
            parent_node.children.push(id);
        }
        id
    }

    fn remove(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        if let Some(parent) = node.parent
            && let Some(parent_node) = self.nodes.get_mut(&parent)
        {
            parent_node.children.retain(|child| *child != id);
        }
        let mut pending = node.children;
        while let Some(child) = pending.pop() {
            if let Some(removed) = self.nodes.remove(&child) {
                pending.extend(removed.children);
            }
        }
        true
    }

    fn reposition(&mut self, id: NodeId, index: usize) {
        let Some(parent) = self.nodes.get(&id).and_then(|node| node.parent) else {
            return;
        };
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|child| *child != id);
            let index = index.min(parent_node.children.len());
            parent_node.children.insert(index, id);
        }
    }

    fn snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.nodes.get(&id).map(|node| NodeSnapshot {
            id,
            kind: node.kind,
            content: node.content.clone(),
            class_name: node.class_name.clone(),
            width: node.width.clone(),
            height: node.height.clone(),
            children: node.children.clone(),
        })
    }
}

/// Headless document tree. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocument {
    tree: Rc<RefCell<DocumentTree>>,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a top-level element. Re-declaring returns the existing node.
    pub fn add_region(&self, element_id: impl Into<String>) -> NodeId {
        let element_id = element_id.into();
        let mut tree = self.tree.borrow_mut();
        if let Some(existing) = tree.elements.get(&element_id) {
            return *existing;
        }
        let id = tree.allocate(NodeKind::Region, None);
        tree.elements.insert(element_id, id);
        id
    }

    pub fn has_region(&self, element_id: &str) -> bool {
        self.tree.borrow().elements.contains_key(element_id)
    }

    pub fn node(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.tree.borrow().snapshot(id)
    }

    pub fn region(&self, element_id: &str) -> Option<NodeSnapshot> {
        let tree = self.tree.borrow();
        let id = *tree.elements.get(element_id)?;
        tree.snapshot(id)
    }

    /// Child contents of every row under `element_id`, in display order.
    pub fn rows(&self, element_id: &str) -> Vec<Vec<String>> {
        let tree = self.tree.borrow();
        let Some(root) = tree.elements.get(element_id).and_then(|id| tree.nodes.get(id)) else {
            return Vec::new();
        };
        root.children
            .iter()
            .filter_map(|row| tree.nodes.get(row))
            .map(|row| {
                row.children
                    .iter()
                    .filter_map(|cell| tree.nodes.get(cell))
                    .map(|cell| cell.content.clone())
                    .collect()
            })
            .collect()
    }

    /// Plain-text rendering, one row per line with cells separated by ` | `.
    pub fn render_text(&self, element_id: &str) -> String {
        let mut rendered = String::new();
        if let Some(region) = self.region(element_id)
            && !region.content.is_empty()
        {
            let _ = writeln!(rendered, "{}", region.content);
        }
        for row in self.rows(element_id) {
            let _ = writeln!(rendered, "{}", row.join(" | "));
        }
        rendered
    }

    /// Mount handle rooted at a declared element.
    pub fn mount_at(&self, element_id: &str) -> Option<MemoryMount> {
        let root = *self.tree.borrow().elements.get(element_id)?;
        Some(MemoryMount {
            tree: Rc::clone(&self.tree),
            root,
        })
    }
}

impl Document for MemoryDocument {
    fn mount(&self, element_id: &str) -> Option<Box<dyn MountPoint>> {
        self.mount_at(element_id)
            .map(|mount| Box::new(mount) as Box<dyn MountPoint>)
    }

    fn replace_content(&mut self, element_id: &str, html: &str) -> Result<()> {
        let mut tree = self.tree.borrow_mut();
        let id = *tree
            .elements
            .get(element_id)
            .ok_or_else(|| SyncError::RenderTargetMissing(element_id.to_string()))?;
        if let Some(node) = tree.nodes.get_mut(&id) {
            node.content = html.to_string();
        }
        Ok(())
    }
}

/// Mount point over one region of a [`MemoryDocument`].
#[derive(Debug, Clone)]
pub struct MemoryMount {
    tree: Rc<RefCell<DocumentTree>>,
    root: NodeId,
}

impl MemoryMount {
    pub fn root(&self) -> NodeId {
        self.root
    }
}

impl MountPoint for MemoryMount {
    fn create_child(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        self.tree
            .borrow_mut()
            .allocate(kind, Some(parent.unwrap_or(self.root)))
    }

    fn remove_child(&mut self, node: NodeId) -> bool {
        if node == self.root {
            return false;
        }
        self.tree.borrow_mut().remove(node)
    }

    fn set_content(&mut self, node: NodeId, cell: &CellDescriptor) {
        if let Some(target) = self.tree.borrow_mut().nodes.get_mut(&node) {
            target.content.clone_from(&cell.content);
            target.class_name.clone_from(&cell.class_name);
            target.width.clone_from(&cell.width);
            target.height.clone_from(&cell.height);
        }
    }

    fn move_child(&mut self, node: NodeId, index: usize) {
        self.tree.borrow_mut().reposition(node, index);
    }
}
