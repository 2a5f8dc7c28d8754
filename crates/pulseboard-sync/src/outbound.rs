//! Producer side of the protocol: frames addressed to one named widget.

use crate::fragment::FragmentCall;
use crate::protocol::{
    CellDescriptor, Coord, GenericOp, MapItemPayload, Operation, RowIndex, RowPayload, Shape,
    WidgetOp,
};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlWriter {
    name: String,
}

impl ControlWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `{name: envelope}`
    pub fn frame(&self, operation: &Operation) -> Value {
        let mut frame = Map::new();
        frame.insert(self.name.clone(), operation.to_value());
        Value::Object(frame)
    }

    pub fn add_row(
        &self,
        key: impl Into<String>,
        cells: Vec<CellDescriptor>,
        index: RowIndex,
        row_class: Option<&str>,
    ) -> Value {
        self.frame(&Operation::Widget(WidgetOp::AddRow(row(key, cells, index, row_class))))
    }

    pub fn update_row(
        &self,
        key: impl Into<String>,
        cells: Vec<CellDescriptor>,
        row_class: Option<&str>,
    ) -> Value {
        self.frame(&Operation::Widget(WidgetOp::UpdateRow(row(
            key,
            cells,
            RowIndex::Head,
            row_class,
        ))))
    }

    pub fn remove_item(&self, key: impl Into<String>) -> Value {
        self.frame(&Operation::Widget(WidgetOp::RemoveItem { key: key.into() }))
    }

    pub fn set_header(&self, cells: Vec<CellDescriptor>, row_class: Option<&str>) -> Value {
        self.frame(&Operation::Widget(WidgetOp::SetHeader {
            cells,
            row_class: row_class.map(ToString::to_string),
        }))
    }

    pub fn add_marker(
        &self,
        key: impl Into<String>,
        coord: Coord,
        properties: Map<String, Value>,
        popup_text: Option<&str>,
    ) -> Value {
        self.frame(&Operation::Widget(WidgetOp::AddMarker(MapItemPayload {
            key: key.into(),
            shape: Shape::Marker(coord),
            properties,
            popup_text: popup_text.map(ToString::to_string),
        })))
    }

    pub fn add_line(
        &self,
        key: impl Into<String>,
        coords: Vec<Coord>,
        properties: Map<String, Value>,
        popup_text: Option<&str>,
    ) -> Value {
        self.frame(&Operation::Widget(WidgetOp::AddLine(MapItemPayload {
            key: key.into(),
            shape: Shape::Line(coords),
            properties,
            popup_text: popup_text.map(ToString::to_string),
        })))
    }

    pub fn set_content(&self, element_id: impl Into<String>, html: impl Into<String>) -> Value {
        self.frame(&Operation::Generic(GenericOp::SetContent {
            element_id: element_id.into(),
            html: html.into(),
        }))
    }

    pub fn run_fragment(&self, calls: &[FragmentCall]) -> Value {
        let source = calls
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.frame(&Operation::Generic(GenericOp::RunFragment { source }))
    }
}

fn row(
    key: impl Into<String>,
    cells: Vec<CellDescriptor>,
    index: RowIndex,
    row_class: Option<&str>,
) -> RowPayload {
    RowPayload {
        key: key.into(),
        cells,
        index,
        row_class: row_class.map(ToString::to_string),
    }
}

/// Merge single-widget frames into one multi-widget frame. Later frames win
/// on a repeated widget name.
pub fn batch(frames: impl IntoIterator<Item = Value>) -> Value {
    let mut merged = Map::new();
    for frame in frames {
        if let Value::Object(entries) = frame {
            merged.extend(entries);
        }
    }
    Value::Object(merged)
}
