// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row-level mutation events.
//!
//! A [`SourceEvent`] is one committed source transaction: every
//! [`RowChange`] in it must land on the destination atomically.
//!
//! Changes carry full row images. Applying an insert or update upserts the
//! image by primary key and a delete removes the key, so replaying an
//! already-applied event leaves the destination unchanged.

use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A row image keyed by primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Primary key.
    pub id: i64,
    /// Column values, excluding the primary key.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl Row {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Look up a column. `id` resolves to the primary key.
    pub fn column(&self, name: &str) -> Option<serde_json::Value> {
        if name == "id" {
            return Some(serde_json::Value::from(self.id));
        }
        self.values.get(name).cloned()
    }
}

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for RowOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub op: RowOp,
    /// After-image for insert/update, before-image (at least the key) for delete.
    pub row: Row,
}

impl RowChange {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            op: RowOp::Insert,
            row,
        }
    }

    pub fn update(table: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            op: RowOp::Update,
            row,
        }
    }

    pub fn delete(table: impl Into<String>, id: i64) -> Self {
        Self {
            table: table.into(),
            op: RowOp::Delete,
            row: Row::new(id),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.op == RowOp::Delete
    }
}

/// One committed source transaction at a log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub position: Position,
    /// Source commit time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub changes: Vec<RowChange>,
}

impl SourceEvent {
    /// Tables touched by this transaction, deduplicated.
    pub fn tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for change in &self.changes {
            if !out.contains(&change.table.as_str()) {
                out.push(&change.table);
            }
        }
        out
    }
}

/// A consistent table snapshot.
///
/// `position` is the log head at the instant the snapshot was taken; every
/// event after it is not reflected in `rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub position: Position,
    pub rows: Vec<Row>,
}
