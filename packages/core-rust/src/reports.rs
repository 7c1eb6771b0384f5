//! Report line kinds and their decoders.
//!
//! Downloaded reports are tab-separated text whose columns depend on the
//! report type. Each supported type is a [`ReportKind`] variant registered in
//! [`REGISTRY`] together with the tag the upstream API uses for it and the
//! function that decodes its lines.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Supported report types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    /// Unsuppressed FBA inventory snapshot.
    FbaUnsuppressedInventory,
}

/// Decodes the full text of a report into one map per line.
pub type ReportDecoder = fn(&str) -> Result<Vec<Value>, ReportError>;

/// One entry of the report registration table.
pub struct ReportRegistration {
    pub kind: ReportKind,
    pub tag: &'static str,
    pub decoder: ReportDecoder,
}

/// Every report type this system knows how to decode.
pub static REGISTRY: &[ReportRegistration] = &[ReportRegistration {
    kind: ReportKind::FbaUnsuppressedInventory,
    tag: "_GET_FBA_MYI_UNSUPPRESSED_INVENTORY_DATA_",
    decoder: decode_typed_tsv,
}];

/// Failure to decode a report.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReportError {
    #[error("unsupported report type: {0}")]
    Unsupported(String),

    #[error("line {line}: column {column} value {value:?} is not a valid {expected}")]
    Cast {
        line: usize,
        column: String,
        value: String,
        expected: &'static str,
    },
}

impl ReportKind {
    /// Looks up a kind by its upstream type tag.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Unsupported`] for unregistered tags.
    pub fn from_tag(tag: &str) -> Result<Self, ReportError> {
        REGISTRY
            .iter()
            .find(|r| r.tag == tag)
            .map(|r| r.kind)
            .ok_or_else(|| ReportError::Unsupported(tag.to_string()))
    }

    /// The upstream type tag of this kind.
    #[must_use]
    pub fn tag(self) -> &'static str {
        self.registration().map_or("", |r| r.tag)
    }

    /// Decodes a report of this kind.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::Cast`] when a typed column holds an invalid value.
    pub fn decode(self, text: &str) -> Result<Vec<Value>, ReportError> {
        let registration = self
            .registration()
            .ok_or_else(|| ReportError::Unsupported(format!("{self:?}")))?;
        (registration.decoder)(text)
    }

    fn registration(self) -> Option<&'static ReportRegistration> {
        REGISTRY.iter().find(|r| r.kind == self)
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Decodes a header-first TSV document, casting columns by name.
///
/// Column names have `-` replaced by `_`. Empty cells in typed columns
/// become `Null`.
///
/// # Errors
///
/// Returns [`ReportError::Cast`] when a typed column holds an invalid value.
pub fn decode_typed_tsv(text: &str) -> Result<Vec<Value>, ReportError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();

    lines
        .enumerate()
        .map(|(index, line)| {
            let mut row = BTreeMap::new();
            let mut cells = line.split('\t');
            for column in &columns {
                let cell = cells.next().unwrap_or("").trim();
                let value = cast_cell(column, cell).ok_or_else(|| ReportError::Cast {
                    line: index + 2,
                    column: (*column).to_string(),
                    value: cell.to_string(),
                    expected: expected_type(column),
                })?;
                row.insert(column.replace('-', "_"), value);
            }
            Ok(Value::Map(row))
        })
        .collect()
}

fn expected_type(column: &str) -> &'static str {
    if column.contains("price") || column.contains("volume") {
        "float"
    } else if column.contains("quantity") {
        "integer"
    } else if column.contains("exists") {
        "boolean"
    } else {
        "string"
    }
}

fn cast_cell(column: &str, cell: &str) -> Option<Value> {
    let kind = expected_type(column);
    if kind != "string" && cell.is_empty() {
        return Some(Value::Null);
    }
    match kind {
        "float" => cell.parse::<f64>().ok().map(Value::Float),
        "integer" => cell.parse::<i64>().ok().map(Value::Int),
        "boolean" => Some(Value::Bool(match cell.to_ascii_lowercase().as_str() {
            "no" | "false" => false,
            _ => true,
        })),
        _ => Some(Value::from(cell)),
    }
}
