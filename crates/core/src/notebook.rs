//! Notebook document persistence.
//!
//! A notebook file is a JSON document of the form
//! `{ "cells": [{ "kind", "language", "value", "metadata": { "id" } }] }`.
//! Only `metadata.id` matters to execution tracking: it is the stable
//! per-cell half of an [`ExecutionKey`](crate::types::ExecutionKey).
//! Fields this module does not know about are kept and written back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Whether a cell holds prose or executable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CellKind {
    Markup,
    Code,
}

impl TryFrom<u8> for CellKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Markup),
            2 => Ok(Self::Code),
            other => Err(format!("unknown cell kind {other}")),
        }
    }
}

impl From<CellKind> for u8 {
    fn from(kind: CellKind) -> Self {
        match kind {
            CellKind::Markup => 1,
            CellKind::Code => 2,
        }
    }
}

/// Per-cell metadata. `id` is always present once a document is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMetadata {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One persisted cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookCellData {
    pub kind: CellKind,
    pub language: String,
    pub value: String,
    pub metadata: CellMetadata,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotebookCellData {
    /// A code cell with a freshly generated id.
    pub fn code(language: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Code,
            language: language.into(),
            value: value.into(),
            metadata: CellMetadata {
                id: new_cell_id(),
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }
}

/// A whole notebook document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotebookData {
    pub cells: Vec<NotebookCellData>,
}

impl NotebookData {
    pub fn cell(&self, id: &str) -> Option<&NotebookCellData> {
        self.cells.iter().find(|c| c.id() == id)
    }
}

// ---- on-disk shape (ids may be missing) ----

#[derive(Deserialize)]
struct RawNotebook {
    #[serde(default)]
    cells: Vec<RawCell>,
}

#[derive(Deserialize)]
struct RawCell {
    kind: CellKind,
    #[serde(default)]
    language: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Default, Deserialize)]
struct RawMetadata {
    id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn new_cell_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Decode notebook bytes.
///
/// Never fails: bytes that are not a valid notebook document yield an empty
/// notebook so that opening a damaged file still succeeds. Cells without an
/// id get a fresh one.
pub fn deserialize_notebook(bytes: &[u8]) -> NotebookData {
    let raw: RawNotebook = match serde_json::from_slice(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable notebook document, opening it empty");
            return NotebookData::default();
        }
    };

    let cells = raw
        .cells
        .into_iter()
        .map(|cell| NotebookCellData {
            kind: cell.kind,
            language: cell.language,
            value: cell.value,
            metadata: CellMetadata {
                id: cell.metadata.id.unwrap_or_else(new_cell_id),
                extra: cell.metadata.extra,
            },
            extra: cell.extra,
        })
        .collect();

    NotebookData { cells }
}

/// Encode a notebook as pretty-printed JSON.
pub fn serialize_notebook(notebook: &NotebookData) -> Result<Vec<u8>, CoreError> {
    Ok(serde_json::to_vec_pretty(notebook)?)
}
