//! Ordered, optionally bounded row store behind table and list widgets.
//!
//! Rows are keyed through a [`KeyedRegistry`]. A row node is created once and
//! never recreated: updates rewrite its cells in place and never move it.
//! When a bound is configured, an insertion that would overflow first evicts
//! one row from the configured edge, so the bound holds after every insert.

use crate::error::{RegistryConflict, Result, SyncError};
use crate::protocol::{CellDescriptor, RowIndex};
use crate::registry::KeyedRegistry;
use crate::view::{Document, MountPoint, NodeId, NodeKind};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Which end of the collection loses a row on overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionEdge {
    Head,
    #[default]
    Tail,
}

/// Node layout used for rows. Behavior is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backing {
    /// Generic nested containers.
    #[default]
    Nested,
    /// Native table rows; cells flagged `header` become header cells.
    Tabular,
}

impl Backing {
    fn cell_kind(self, cell: &CellDescriptor) -> NodeKind {
        match self {
            Self::Tabular if cell.header => NodeKind::HeaderCell,
            _ => NodeKind::Cell,
        }
    }
}

/// Whether an existing key may be rewritten by `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    CreateOnly,
    AllowUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Create,
    Update,
}

/// Enrichment callback run on freshly built or rewritten nodes.
pub type NodeHook = Box<dyn FnMut(&mut dyn MountPoint, NodeId, HookPhase)>;

#[derive(Debug, Clone, Default)]
pub struct CollectionConfig {
    pub max_length: Option<usize>,
    pub eviction_edge: EvictionEdge,
    pub backing: Backing,
}

impl CollectionConfig {
    #[must_use]
    pub fn bounded(max_length: usize, eviction_edge: EvictionEdge) -> Self {
        Self {
            max_length: Some(max_length),
            eviction_edge,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted {
        position: usize,
        evicted: Option<String>,
    },
    Updated,
}

#[derive(Debug)]
struct RowRecord {
    node: NodeId,
    cells: Vec<NodeId>,
}

pub struct RowCollection {
    name: String,
    config: CollectionConfig,
    contents: Box<dyn MountPoint>,
    header: Option<Box<dyn MountPoint>>,
    rows: KeyedRegistry<RowRecord>,
    order: VecDeque<String>,
    header_rows: Vec<NodeId>,
    on_cell: Option<NodeHook>,
    on_row: Option<NodeHook>,
}

impl std::fmt::Debug for RowCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCollection")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("order", &self.order)
            .field("header_rows", &self.header_rows.len())
            .finish_non_exhaustive()
    }
}

impl RowCollection {
    pub fn new(
        name: impl Into<String>,
        contents: Box<dyn MountPoint>,
        mut config: CollectionConfig,
    ) -> Self {
        let name = name.into();
        // A zero bound could never hold after an insert.
        config.max_length = config.max_length.map(|max| max.max(1));
        Self {
            rows: KeyedRegistry::new(name.clone()),
            name,
            config,
            contents,
            header: None,
            order: VecDeque::new(),
            header_rows: Vec::new(),
            on_cell: None,
            on_row: None,
        }
    }

    /// Resolve `{name}_contents` (required) and `{name}_header` (optional).
    pub fn attach(document: &dyn Document, name: &str, config: CollectionConfig) -> Result<Self> {
        let contents_id = format!("{name}_contents");
        let contents = document
            .mount(&contents_id)
            .ok_or(SyncError::RenderTargetMissing(contents_id))?;
        let mut collection = Self::new(name, contents, config);
        collection.header = document.mount(&format!("{name}_header"));
        Ok(collection)
    }

    pub fn with_header(mut self, header: Box<dyn MountPoint>) -> Self {
        self.header = Some(header);
        self
    }

    pub fn on_new_cell(
        mut self,
        hook: impl FnMut(&mut dyn MountPoint, NodeId, HookPhase) + 'static,
    ) -> Self {
        self.on_cell = Some(Box::new(hook));
        self
    }

    pub fn on_new_row(
        mut self,
        hook: impl FnMut(&mut dyn MountPoint, NodeId, HookPhase) + 'static,
    ) -> Self {
        self.on_row = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains(key)
    }

    /// Keys in display order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.order.iter().position(|candidate| candidate == key)
    }

    pub fn row_node(&self, key: &str) -> Option<NodeId> {
        self.rows.get(key).map(|record| record.node)
    }

    pub fn header_rows(&self) -> &[NodeId] {
        &self.header_rows
    }

    /// Insert a new row, or rewrite an existing one when `mode` allows it.
    pub fn add(
        &mut self,
        key: &str,
        cells: &[CellDescriptor],
        index: RowIndex,
        mode: WriteMode,
        row_class: Option<&str>,
    ) -> Result<AddOutcome> {
        if self.rows.contains(key) {
            return match mode {
                WriteMode::AllowUpdate => {
                    self.rewrite(key, cells, row_class)?;
                    Ok(AddOutcome::Updated)
                }
                WriteMode::CreateOnly => {
                    Err(RegistryConflict::DuplicateKey(key.to_string()).into())
                }
            };
        }

        let evicted = match self.config.max_length {
            Some(max) if self.order.len() + 1 > max => self.evict(),
            _ => None,
        };

        let row = self.contents.create_child(None, NodeKind::Row);
        self.contents.set_content(row, &row_descriptor(row_class));
        let mut cell_nodes = Vec::with_capacity(cells.len());
        for cell in cells {
            let node = self.contents.create_child(Some(row), self.config.backing.cell_kind(cell));
            self.contents.set_content(node, cell);
            if let Some(hook) = self.on_cell.as_mut() {
                hook(self.contents.as_mut(), node, HookPhase::Create);
            }
            cell_nodes.push(node);
        }

        let position = index.resolve(self.order.len());
        if position < self.order.len() {
            self.contents.move_child(row, position);
        }
        self.order.insert(position, key.to_string());
        self.rows.add(
            key,
            RowRecord {
                node: row,
                cells: cell_nodes,
            },
        );
        if let Some(hook) = self.on_row.as_mut() {
            hook(self.contents.as_mut(), row, HookPhase::Create);
        }

        debug!(widget = %self.name, key, position, "row added");
        Ok(AddOutcome::Inserted { position, evicted })
    }

    /// Rewrite the cells of an existing row in place.
    pub fn update(&mut self, key: &str, cells: &[CellDescriptor], row_class: Option<&str>) -> Result<()> {
        if !self.rows.contains(key) {
            return Err(RegistryConflict::MissingKey(key.to_string()).into());
        }
        self.rewrite(key, cells, row_class)
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        if !self.rows.contains(key) {
            return Err(RegistryConflict::MissingKey(key.to_string()).into());
        }
        self.detach(key);
        debug!(widget = %self.name, key, "row removed");
        Ok(())
    }

    /// Append an unkeyed header row. Each call adds another row.
    pub fn set_header(&mut self, cells: &[CellDescriptor], row_class: Option<&str>) -> Result<NodeId> {
        let header = self
            .header
            .as_mut()
            .ok_or_else(|| SyncError::RenderTargetMissing(format!("{}_header", self.name)))?;
        let row = header.create_child(None, NodeKind::HeaderRow);
        header.set_content(row, &row_descriptor(row_class));
        for cell in cells {
            let node = header.create_child(Some(row), NodeKind::HeaderCell);
            header.set_content(node, cell);
        }
        self.header_rows.push(row);
        Ok(row)
    }

    fn rewrite(&mut self, key: &str, cells: &[CellDescriptor], row_class: Option<&str>) -> Result<()> {
        let record = self
            .rows
            .get(key)
            .ok_or_else(|| RegistryConflict::MissingKey(key.to_string()))?;
        if cells.len() > record.cells.len() {
            warn!(
                widget = %self.name,
                key,
                existing = record.cells.len(),
                received = cells.len(),
                "update carries more cells than the row holds; extra cells ignored"
            );
        }
        for (node, cell) in record.cells.iter().zip(cells) {
            self.contents.set_content(*node, cell);
            if let Some(hook) = self.on_cell.as_mut() {
                hook(self.contents.as_mut(), *node, HookPhase::Update);
            }
        }
        if let Some(class) = row_class {
            self.contents
                .set_content(record.node, &row_descriptor(Some(class)));
        }
        if let Some(hook) = self.on_row.as_mut() {
            hook(self.contents.as_mut(), record.node, HookPhase::Update);
        }
        debug!(widget = %self.name, key, "row updated");
        Ok(())
    }

    fn evict(&mut self) -> Option<String> {
        let key = match self.config.eviction_edge {
            EvictionEdge::Head => self.order.front(),
            EvictionEdge::Tail => self.order.back(),
        }?
        .clone();
        self.detach(&key);
        debug!(widget = %self.name, key = %key, "row evicted");
        Some(key)
    }

    fn detach(&mut self, key: &str) {
        if let Some(record) = self.rows.remove(key) {
            self.contents.remove_child(record.node);
        }
        if let Some(position) = self.position(key) {
            self.order.remove(position);
        }
    }
}

fn row_descriptor(row_class: Option<&str>) -> CellDescriptor {
    CellDescriptor {
        class_name: row_class.map(ToString::to_string),
        ..CellDescriptor::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::MemoryDocument;
    use quickcheck::quickcheck;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn list(document: &MemoryDocument, config: CollectionConfig) -> Result<RowCollection> {
        document.add_region("feed_contents");
        document.add_region("feed_header");
        RowCollection::attach(document, "feed", config)
    }

    fn cells(content: &str) -> Vec<CellDescriptor> {
        vec![CellDescriptor::new(content)]
    }

    fn contents(document: &MemoryDocument) -> Vec<String> {
        document
            .rows("feed_contents")
            .into_iter()
            .map(|row| row.join(","))
            .collect()
    }

    #[test]
    fn attach_requires_contents_region() {
        let document = MemoryDocument::new();
        document.add_region("feed_header");
        let result = RowCollection::attach(&document, "feed", CollectionConfig::default());
        assert!(matches!(result, Err(SyncError::RenderTargetMissing(id)) if id == "feed_contents"));
    }

    #[test]
    fn rows_insert_at_clamped_index() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::default())?;
        feed.add("a", &cells("a"), RowIndex::Append, WriteMode::CreateOnly, None)?;
        feed.add("b", &cells("b"), RowIndex::Append, WriteMode::CreateOnly, None)?;
        feed.add("c", &cells("c"), RowIndex::At(1), WriteMode::CreateOnly, None)?;
        feed.add("d", &cells("d"), RowIndex::At(99), WriteMode::CreateOnly, None)?;
        feed.add("e", &cells("e"), RowIndex::Head, WriteMode::CreateOnly, None)?;
        assert_eq!(contents(&document), vec!["e", "a", "c", "b", "d"]);
        assert_eq!(feed.keys().collect::<Vec<_>>(), vec!["e", "a", "c", "b", "d"]);
        Ok(())
    }

    #[test]
    fn duplicate_add_without_update_mode_is_rejected() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::default())?;
        feed.add("k", &cells("first"), RowIndex::Head, WriteMode::CreateOnly, None)?;
        let second = feed.add("k", &cells("second"), RowIndex::Head, WriteMode::CreateOnly, None);
        assert!(matches!(
            second,
            Err(SyncError::Registry(RegistryConflict::DuplicateKey(_)))
        ));
        assert_eq!(feed.len(), 1);
        assert_eq!(contents(&document), vec!["first"]);
        Ok(())
    }

    #[test]
    fn update_rewrites_cells_without_moving_row() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::default())?;
        feed.add("a", &cells("a"), RowIndex::Append, WriteMode::CreateOnly, None)?;
        feed.add("b", &cells("b"), RowIndex::Append, WriteMode::CreateOnly, Some("plain"))?;
        let node_before = feed.row_node("b");
        let outcome = feed.add(
            "b",
            &[CellDescriptor::new("b2").with_class("hot")],
            RowIndex::Head,
            WriteMode::AllowUpdate,
            Some("flash"),
        )?;
        assert_eq!(outcome, AddOutcome::Updated);
        assert_eq!(feed.row_node("b"), node_before);
        assert_eq!(feed.position("b"), Some(1));
        assert_eq!(contents(&document), vec!["a", "b2"]);
        let row = node_before.and_then(|node| document.node(node));
        assert_eq!(row.and_then(|row| row.class_name), Some("flash".to_string()));
        Ok(())
    }

    #[test]
    fn update_of_missing_key_is_a_conflict() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::default())?;
        let result = feed.update("ghost", &cells("x"), None);
        assert!(matches!(
            result,
            Err(SyncError::Registry(RegistryConflict::MissingKey(_)))
        ));
        assert!(feed.is_empty());
        Ok(())
    }

    #[test]
    fn bounded_head_eviction_keeps_oldest_appended_rows_out() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::bounded(2, EvictionEdge::Head))?;
        for key in ["a", "b", "c"] {
            feed.add(key, &cells(key), RowIndex::Append, WriteMode::CreateOnly, None)?;
        }
        assert_eq!(contents(&document), vec!["b", "c"]);
        assert!(!feed.contains("a"));
        Ok(())
    }

    #[test]
    fn evicted_key_can_be_added_again() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::bounded(1, EvictionEdge::Tail))?;
        feed.add("a", &cells("a"), RowIndex::Head, WriteMode::CreateOnly, None)?;
        let outcome = feed.add("b", &cells("b"), RowIndex::Head, WriteMode::CreateOnly, None)?;
        assert_eq!(
            outcome,
            AddOutcome::Inserted {
                position: 0,
                evicted: Some("a".to_string())
            }
        );
        feed.add("a", &cells("a"), RowIndex::Head, WriteMode::CreateOnly, None)?;
        assert_eq!(contents(&document), vec!["a"]);
        Ok(())
    }

    #[test]
    fn header_rows_accumulate_outside_the_bound() -> Result<()> {
        let document = MemoryDocument::new();
        let mut feed = list(&document, CollectionConfig::bounded(1, EvictionEdge::Tail))?;
        feed.set_header(&cells("Name"), Some("row-fluid"))?;
        feed.set_header(&cells("Name"), None)?;
        feed.add("a", &cells("a"), RowIndex::Head, WriteMode::CreateOnly, None)?;
        assert_eq!(feed.header_rows().len(), 2);
        assert_eq!(document.rows("feed_header").len(), 2);
        assert_eq!(feed.len(), 1);
        Ok(())
    }

    #[test]
    fn header_without_region_fails() -> Result<()> {
        let document = MemoryDocument::new();
        document.add_region("feed_contents");
        let mut feed = RowCollection::attach(&document, "feed", CollectionConfig::default())?;
        assert!(matches!(
            feed.set_header(&cells("x"), None),
            Err(SyncError::RenderTargetMissing(_))
        ));
        Ok(())
    }

    #[test]
    fn hooks_run_per_cell_then_per_row() -> Result<()> {
        let document = MemoryDocument::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let cell_calls = Rc::clone(&calls);
        let row_calls = Rc::clone(&calls);
        let mut feed = list(&document, CollectionConfig::default())?
            .on_new_cell(move |_, _, phase| cell_calls.borrow_mut().push(("cell", phase)))
            .on_new_row(move |_, _, phase| row_calls.borrow_mut().push(("row", phase)));
        let two = vec![CellDescriptor::new("x"), CellDescriptor::new("y")];
        feed.add("k", &two, RowIndex::Head, WriteMode::CreateOnly, None)?;
        feed.update("k", &two, None)?;
        assert_eq!(
            *calls.borrow(),
            vec![
                ("cell", HookPhase::Create),
                ("cell", HookPhase::Create),
                ("row", HookPhase::Create),
                ("cell", HookPhase::Update),
                ("cell", HookPhase::Update),
                ("row", HookPhase::Update),
            ]
        );
        Ok(())
    }

    #[test]
    fn tabular_backing_marks_header_cells() -> Result<()> {
        let document = MemoryDocument::new();
        let config = CollectionConfig {
            backing: Backing::Tabular,
            ..CollectionConfig::default()
        };
        let mut table = list(&document, config)?;
        table.add(
            "k",
            &[CellDescriptor::new("h").as_header(), CellDescriptor::new("v")],
            RowIndex::Head,
            WriteMode::CreateOnly,
            None,
        )?;
        let row = table.row_node("k").and_then(|node| document.node(node));
        let kinds: Vec<NodeKind> = row
            .map(|row| row.children)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|cell| document.node(cell))
            .map(|cell| cell.kind)
            .collect();
        assert_eq!(kinds, vec![NodeKind::HeaderCell, NodeKind::Cell]);
        Ok(())
    }

    quickcheck! {
        fn unbounded_order_is_insertion_order_minus_removals(count: u8, removals: Vec<u8>) -> bool {
            let document = MemoryDocument::new();
            let Ok(mut feed) = list(&document, CollectionConfig::default()) else {
                return false;
            };
            let mut expected = Vec::new();
            for value in 0..count {
                let key = value.to_string();
                if feed.add(&key, &cells(&key), RowIndex::Append, WriteMode::CreateOnly, None).is_err() {
                    return false;
                }
                expected.push(key);
            }
            for value in removals {
                let key = value.to_string();
                let present = expected.contains(&key);
                if feed.remove(&key).is_ok() != present {
                    return false;
                }
                expected.retain(|candidate| *candidate != key);
            }
            contents(&document) == expected && feed.keys().eq(expected.iter().map(String::as_str))
        }

        fn tail_bound_keeps_most_recent_rows(bound: u8, extra: u8) -> bool {
            let bound = usize::from(bound % 16) + 1;
            let total = bound + usize::from(extra % 16) + 1;
            let document = MemoryDocument::new();
            let Ok(mut feed) = list(&document, CollectionConfig::bounded(bound, EvictionEdge::Tail)) else {
                return false;
            };
            for value in 0..total {
                let key = value.to_string();
                if feed.add(&key, &cells(&key), RowIndex::Head, WriteMode::CreateOnly, None).is_err() {
                    return false;
                }
                if feed.len() > bound {
                    return false;
                }
            }
            let expected: Vec<String> = (total - bound..total).rev().map(|value| value.to_string()).collect();
            feed.len() == bound && contents(&document) == expected
        }
    }
}
