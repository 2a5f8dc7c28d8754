//! Operation envelope codec.
//!
//! One inbound frame is a JSON object keyed by widget name; each value is an
//! envelope `{op, hashKey?, ...}`. This module turns a single envelope into a
//! typed [`Operation`] and back. Routing by widget name lives in
//! [`crate::channel`].
//!
//! The protocol carries no sequence numbers or acknowledgements. Frames are
//! applied in arrival order and a dropped frame is not detectable here.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Field carrying the out-of-band keepalive marker.
pub const KEEPALIVE_MARKER: &str = "static_op";
/// Literal reply to a keepalive. Sent bare, never wrapped in an envelope.
pub const KEEPALIVE_REPLY: &str = "PING_BACK";
/// Property key holding the layer groups a map item joins.
pub const GROUPS_PROPERTY: &str = "custom_layers";

/// Wire operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationCode {
    Ping,
    AddMarker,
    AddLine,
    RemoveItem,
    AddRow,
    UpdateRow,
    SetHeader,
    SetContent,
    RunFragment,
}

impl OperationCode {
    pub const ALL: [Self; 9] = [
        Self::Ping,
        Self::AddMarker,
        Self::AddLine,
        Self::RemoveItem,
        Self::AddRow,
        Self::UpdateRow,
        Self::SetHeader,
        Self::SetContent,
        Self::RunFragment,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Ping => 0,
            Self::AddMarker => 1,
            Self::AddLine => 2,
            Self::RemoveItem => 3,
            Self::AddRow => 4,
            Self::UpdateRow => 6,
            Self::SetHeader => 7,
            Self::SetContent => 8,
            Self::RunFragment => 9,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| i64::from(candidate.code()) == code)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::AddMarker => "ADD_MARKER",
            Self::AddLine => "ADD_LINE",
            Self::RemoveItem => "REMOVE_ITEM",
            Self::AddRow => "ADD_ROW",
            Self::UpdateRow => "UPDATE_ROW",
            Self::SetHeader => "SET_HEADER",
            Self::SetContent => "SET_CONTENT",
            Self::RunFragment => "RUN_FRAGMENT",
        }
    }
}

/// One cell of a row: content plus optional presentation hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellDescriptor {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub header: bool,
}

impl CellDescriptor {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn with_size(mut self, width: Option<String>, height: Option<String>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn as_header(mut self) -> Self {
        self.header = true;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CellWire {
    Bare(String),
    Nested(String, Option<String>),
    Tabular(
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<bool>,
    ),
    Object {
        content: String,
        #[serde(default, rename = "className")]
        class_name: Option<String>,
        #[serde(default)]
        width: Option<String>,
        #[serde(default)]
        height: Option<String>,
        #[serde(default)]
        header: Option<bool>,
    },
}

impl From<CellWire> for CellDescriptor {
    fn from(wire: CellWire) -> Self {
        match wire {
            CellWire::Bare(content) => Self::new(content),
            CellWire::Nested(content, class_name) => Self {
                content,
                class_name,
                ..Self::default()
            },
            CellWire::Tabular(content, width, height, class_name, header)
            | CellWire::Object {
                content,
                class_name,
                width,
                height,
                header,
            } => Self {
                content,
                class_name,
                width,
                height,
                header: header.unwrap_or(false),
            },
        }
    }
}

impl<'de> Deserialize<'de> for CellDescriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        CellWire::deserialize(deserializer).map(Self::from)
    }
}

/// Map location as `[lat, lng]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coord {
    pub lat: f64,
    pub lng: f64,
}

impl From<[f64; 2]> for Coord {
    fn from([lat, lng]: [f64; 2]) -> Self {
        Self { lat, lng }
    }
}

impl From<Coord> for [f64; 2] {
    fn from(coord: Coord) -> Self {
        [coord.lat, coord.lng]
    }
}

/// Requested insertion position of a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowIndex {
    At(usize),
    #[default]
    Head,
    Append,
}

impl RowIndex {
    /// Wire value: absent means head, any negative value means append.
    #[must_use]
    pub fn from_wire(raw: Option<i64>) -> Self {
        match raw {
            None | Some(0) => Self::Head,
            Some(value) if value < 0 => Self::Append,
            Some(value) => usize::try_from(value).map_or(Self::Append, Self::At),
        }
    }

    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Head => 0,
            Self::Append => -1,
            Self::At(index) => i64::try_from(index).unwrap_or(-1),
        }
    }

    /// Concrete position within a collection of `len` rows.
    #[must_use]
    pub fn resolve(self, len: usize) -> usize {
        match self {
            Self::Head => 0,
            Self::Append => len,
            Self::At(index) => index.min(len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPayload {
    pub key: String,
    pub cells: Vec<CellDescriptor>,
    pub index: RowIndex,
    pub row_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Marker(Coord),
    Line(Vec<Coord>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapItemPayload {
    pub key: String,
    pub shape: Shape,
    pub properties: Map<String, Value>,
    pub popup_text: Option<String>,
}

impl MapItemPayload {
    /// Named groups from the properties, or `None` when the item belongs to
    /// the primary layer. An empty list counts as absent.
    #[must_use]
    pub fn groups(&self) -> Option<Vec<String>> {
        let groups: Vec<String> = self
            .properties
            .get(GROUPS_PROPERTY)?
            .as_array()?
            .iter()
            .filter_map(|group| match group {
                Value::String(name) => Some(name.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .collect();
        (!groups.is_empty()).then_some(groups)
    }
}

/// Widget-agnostic operations, handled before any widget sees the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericOp {
    SetContent { element_id: String, html: String },
    RunFragment { source: String },
}

impl GenericOp {
    #[must_use]
    pub fn code(&self) -> OperationCode {
        match self {
            Self::SetContent { .. } => OperationCode::SetContent,
            Self::RunFragment { .. } => OperationCode::RunFragment,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WidgetOp {
    AddRow(RowPayload),
    UpdateRow(RowPayload),
    RemoveItem { key: String },
    SetHeader {
        cells: Vec<CellDescriptor>,
        row_class: Option<String>,
    },
    AddMarker(MapItemPayload),
    AddLine(MapItemPayload),
}

impl WidgetOp {
    #[must_use]
    pub fn code(&self) -> OperationCode {
        match self {
            Self::AddRow(_) => OperationCode::AddRow,
            Self::UpdateRow(_) => OperationCode::UpdateRow,
            Self::RemoveItem { .. } => OperationCode::RemoveItem,
            Self::SetHeader { .. } => OperationCode::SetHeader,
            Self::AddMarker(_) => OperationCode::AddMarker,
            Self::AddLine(_) => OperationCode::AddLine,
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Generic(GenericOp),
    Widget(WidgetOp),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    op: Option<i64>,
    #[serde(default)]
    hash_key: Option<Value>,
    #[serde(default)]
    cells: Option<Vec<CellDescriptor>>,
    #[serde(default, alias = "className")]
    row_class: Option<String>,
    #[serde(default)]
    row_index: Option<i64>,
    #[serde(default)]
    coord: Option<Coord>,
    #[serde(default)]
    coords: Option<Vec<Coord>>,
    #[serde(default)]
    properties: Option<Value>,
    #[serde(default)]
    popup_text: Option<String>,
    #[serde(default)]
    element_id: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    javascript: Option<String>,
}

impl RawEnvelope {
    fn key(&self, op: OperationCode) -> Result<String, ProtocolError> {
        match &self.hash_key {
            Some(Value::String(key)) => Ok(key.clone()),
            Some(Value::Number(key)) => Ok(key.to_string()),
            Some(_) => Err(ProtocolError::Malformed(format!(
                "{} hashKey must be a string or integer",
                op.as_str()
            ))),
            None => Err(missing(op, "hashKey")),
        }
    }

    fn cells(&mut self, op: OperationCode) -> Result<Vec<CellDescriptor>, ProtocolError> {
        self.cells.take().ok_or_else(|| missing(op, "cells"))
    }

    fn row(&mut self, op: OperationCode) -> Result<RowPayload, ProtocolError> {
        Ok(RowPayload {
            key: self.key(op)?,
            cells: self.cells(op)?,
            index: RowIndex::from_wire(self.row_index),
            row_class: self.row_class.take(),
        })
    }

    fn map_item(&mut self, op: OperationCode, shape: Shape) -> Result<MapItemPayload, ProtocolError> {
        let properties = match self.properties.take() {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(Value::String(encoded)) => match serde_json::from_str::<Value>(&encoded) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(ProtocolError::Malformed(format!(
                        "{} properties must encode an object",
                        op.as_str()
                    )));
                }
                Err(error) => {
                    return Err(ProtocolError::Malformed(format!(
                        "{} properties are not valid JSON: {}",
                        op.as_str(),
                        error
                    )));
                }
            },
            Some(_) => {
                return Err(ProtocolError::Malformed(format!(
                    "{} properties must be an object",
                    op.as_str()
                )));
            }
        };
        Ok(MapItemPayload {
            key: self.key(op)?,
            shape,
            properties,
            popup_text: self.popup_text.take(),
        })
    }
}

fn missing(op: OperationCode, field: &str) -> ProtocolError {
    ProtocolError::Malformed(format!("{} requires {}", op.as_str(), field))
}

impl Operation {
    #[must_use]
    pub fn code(&self) -> OperationCode {
        match self {
            Self::Generic(op) => op.code(),
            Self::Widget(op) => op.code(),
        }
    }

    #[must_use]
    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Generic(_))
    }

    /// Decode one envelope.
    pub fn parse(value: &Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::Malformed(
                "expected JSON object envelope".to_string(),
            ));
        }
        let mut raw: RawEnvelope = serde_json::from_value(value.clone())
            .map_err(|error| ProtocolError::Malformed(error.to_string()))?;
        let code = raw
            .op
            .ok_or_else(|| ProtocolError::Malformed("missing op".to_string()))?;
        let op = OperationCode::from_code(code).ok_or(ProtocolError::UnknownOp { code })?;

        let operation = match op {
            OperationCode::Ping => {
                return Err(ProtocolError::Malformed(
                    "PING is only valid as an out-of-band keepalive".to_string(),
                ));
            }
            OperationCode::SetContent => Self::Generic(GenericOp::SetContent {
                element_id: raw.element_id.take().ok_or_else(|| missing(op, "elementId"))?,
                html: raw.html.take().unwrap_or_default(),
            }),
            OperationCode::RunFragment => Self::Generic(GenericOp::RunFragment {
                source: raw.javascript.take().ok_or_else(|| missing(op, "javascript"))?,
            }),
            OperationCode::AddRow => Self::Widget(WidgetOp::AddRow(raw.row(op)?)),
            OperationCode::UpdateRow => Self::Widget(WidgetOp::UpdateRow(raw.row(op)?)),
            OperationCode::RemoveItem => Self::Widget(WidgetOp::RemoveItem { key: raw.key(op)? }),
            OperationCode::SetHeader => Self::Widget(WidgetOp::SetHeader {
                cells: raw.cells(op)?,
                row_class: raw.row_class.take(),
            }),
            OperationCode::AddMarker => {
                let coord = raw.coord.ok_or_else(|| missing(op, "coord"))?;
                Self::Widget(WidgetOp::AddMarker(raw.map_item(op, Shape::Marker(coord))?))
            }
            OperationCode::AddLine => {
                let coords = raw.coords.take().ok_or_else(|| missing(op, "coords"))?;
                Self::Widget(WidgetOp::AddLine(raw.map_item(op, Shape::Line(coords))?))
            }
        };
        Ok(operation)
    }

    /// Encode as a wire envelope. Map properties are sent JSON-encoded.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let op = self.code().code();
        match self {
            Self::Generic(GenericOp::SetContent { element_id, html }) => {
                json!({"op": op, "elementId": element_id, "html": html})
            }
            Self::Generic(GenericOp::RunFragment { source }) => {
                json!({"op": op, "javascript": source})
            }
            Self::Widget(WidgetOp::AddRow(row) | WidgetOp::UpdateRow(row)) => {
                let mut value = json!({
                    "op": op,
                    "hashKey": row.key,
                    "cells": row.cells,
                    "rowIndex": row.index.to_wire(),
                });
                insert_optional(&mut value, "rowClass", row.row_class.as_ref());
                value
            }
            Self::Widget(WidgetOp::RemoveItem { key }) => json!({"op": op, "hashKey": key}),
            Self::Widget(WidgetOp::SetHeader { cells, row_class }) => {
                let mut value = json!({"op": op, "cells": cells});
                insert_optional(&mut value, "rowClass", row_class.as_ref());
                value
            }
            Self::Widget(WidgetOp::AddMarker(item) | WidgetOp::AddLine(item)) => {
                let mut value = json!({"op": op, "hashKey": item.key});
                match &item.shape {
                    Shape::Marker(coord) => value["coord"] = json!(coord),
                    Shape::Line(coords) => value["coords"] = json!(coords),
                }
                if !item.properties.is_empty() {
                    value["properties"] =
                        Value::String(Value::Object(item.properties.clone()).to_string());
                }
                insert_optional(&mut value, "popupText", item.popup_text.as_ref());
                value
            }
        }
    }
}

fn insert_optional(value: &mut Value, field: &str, item: Option<&String>) {
    if let (Some(object), Some(item)) = (value.as_object_mut(), item) {
        object.insert(field.to_string(), Value::String(item.clone()));
    }
}

/// The keepalive frame a server sends.
#[must_use]
pub fn keepalive_frame() -> Value {
    let mut frame = Map::new();
    frame.insert(
        KEEPALIVE_MARKER.to_string(),
        Value::from(OperationCode::Ping.code()),
    );
    Value::Object(frame)
}
