//! Widget-specific handlers a channel routes envelopes to.

use crate::collection::{RowCollection, WriteMode};
use crate::error::{ProtocolError, Result};
use crate::layers::LayeredItems;
use crate::protocol::WidgetOp;
use tracing::debug;

/// A named widget bound to a channel.
pub trait Control {
    fn name(&self) -> &str;

    /// Apply one decoded widget operation.
    fn apply(&mut self, op: WidgetOp) -> Result<()>;

    fn rows(&self) -> Option<&RowCollection> {
        None
    }

    fn layers(&self) -> Option<&LayeredItems> {
        None
    }

    fn layers_mut(&mut self) -> Option<&mut LayeredItems> {
        None
    }
}

fn unsupported(widget: &str, op: &WidgetOp) -> ProtocolError {
    ProtocolError::UnsupportedOp {
        widget: widget.to_string(),
        op: op.code().as_str(),
    }
}

/// Table or list widget over a [`RowCollection`].
#[derive(Debug)]
pub struct RowControl {
    collection: RowCollection,
}

impl RowControl {
    pub fn new(collection: RowCollection) -> Self {
        Self { collection }
    }

    pub fn collection_mut(&mut self) -> &mut RowCollection {
        &mut self.collection
    }
}

impl Control for RowControl {
    fn name(&self) -> &str {
        self.collection.name()
    }

    fn apply(&mut self, op: WidgetOp) -> Result<()> {
        match op {
            WidgetOp::AddRow(row) => {
                self.collection.add(
                    &row.key,
                    &row.cells,
                    row.index,
                    WriteMode::CreateOnly,
                    row.row_class.as_deref(),
                )?;
            }
            WidgetOp::UpdateRow(row) => {
                self.collection
                    .update(&row.key, &row.cells, row.row_class.as_deref())?;
            }
            WidgetOp::RemoveItem { key } => self.collection.remove(&key)?,
            WidgetOp::SetHeader { cells, row_class } => {
                self.collection.set_header(&cells, row_class.as_deref())?;
            }
            other @ (WidgetOp::AddMarker(_) | WidgetOp::AddLine(_)) => {
                return Err(unsupported(self.name(), &other).into());
            }
        }
        Ok(())
    }

    fn rows(&self) -> Option<&RowCollection> {
        Some(&self.collection)
    }
}

/// Map widget over [`LayeredItems`].
#[derive(Debug)]
pub struct MapControl {
    name: String,
    layers: LayeredItems,
}

impl MapControl {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            layers: LayeredItems::new(name.clone()),
            name,
        }
    }
}

impl Control for MapControl {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, op: WidgetOp) -> Result<()> {
        match op {
            WidgetOp::AddMarker(item) | WidgetOp::AddLine(item) => {
                self.layers.add_payload(item)?;
            }
            WidgetOp::RemoveItem { key } => {
                self.layers.remove(&key)?;
            }
            other => return Err(unsupported(&self.name, &other).into()),
        }
        Ok(())
    }

    fn layers(&self) -> Option<&LayeredItems> {
        Some(&self.layers)
    }

    fn layers_mut(&mut self) -> Option<&mut LayeredItems> {
        Some(&mut self.layers)
    }
}

/// Bare widget that only receives generic operations.
#[derive(Debug, Clone)]
pub struct DocumentControl {
    name: String,
}

impl DocumentControl {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Control for DocumentControl {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, op: WidgetOp) -> Result<()> {
        debug!(widget = %self.name, op = op.code().as_str(), "widget op sent to document control");
        Err(unsupported(&self.name, &op).into())
    }
}
