// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter compiler.
//!
//! Turns a declarative table selection ([`FilterSpec`]) into an immutable
//! [`Filter`] evaluated against source events. Compilation is pure and fails
//! only on malformed identifiers or an empty table list.
//!
//! # Row Predicate
//!
//! An optional predicate keeps rows whose sharding column falls inside a
//! half-open [`KeyRange`] of unsigned keyspace ids:
//!
//! | Change | Column in range | Out of range / missing |
//! |--------|-----------------|------------------------|
//! | insert | kept | dropped |
//! | update | kept | rewritten as delete |
//! | delete | kept | kept |
//!
//! Rewriting updates that leave the range removes rows that moved away, and
//! deletes are always forwarded because removing an absent key is a no-op.

use crate::error::{MigrationError, Result};
use crate::event::{Row, RowChange, RowOp, SourceEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Maximum identifier length accepted by the storage engine.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Validate a table or column identifier: `[A-Za-z_][A-Za-z0-9_$]*`, 1..=64 chars.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrationError::InvalidFilter("empty identifier".to_string()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrationError::InvalidFilter(format!(
            "identifier {:?} exceeds {} characters",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return Err(MigrationError::InvalidFilter(format!(
            "malformed identifier {:?}",
            name
        )));
    }
    Ok(())
}

/// Half-open range of keyspace ids: `start <= id < end`.
///
/// `end == None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl KeyRange {
    /// The range covering every keyspace id.
    pub const FULL: KeyRange = KeyRange {
        start: 0,
        end: None,
    };

    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.start && self.end.map_or(true, |end| id < end)
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// Parse a shard-style range such as `-80`, `40-c0` or `80-`.
    ///
    /// Each bound is a hex prefix of the 64-bit keyspace id, so `80` means
    /// `0x8000_0000_0000_0000`. `-` alone is the full range.
    pub fn parse(s: &str) -> Result<Self> {
        let (lo, hi) = s
            .split_once('-')
            .ok_or_else(|| MigrationError::InvalidFilter(format!("invalid key range {:?}", s)))?;
        let start = if lo.is_empty() { 0 } else { parse_hex_prefix(lo)? };
        let end = if hi.is_empty() { None } else { Some(parse_hex_prefix(hi)?) };
        if let Some(end) = end {
            if end <= start {
                return Err(MigrationError::InvalidFilter(format!(
                    "empty key range {:?}",
                    s
                )));
            }
        }
        Ok(Self { start, end })
    }
}

fn parse_hex_prefix(s: &str) -> Result<u64> {
    if s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MigrationError::InvalidFilter(format!(
            "invalid key range bound {:?}",
            s
        )));
    }
    let mut padded = s.to_string();
    while padded.len() < 16 {
        padded.push('0');
    }
    u64::from_str_radix(&padded, 16)
        .map_err(|e| MigrationError::InvalidFilter(format!("invalid key range bound {:?}: {}", s, e)))
}

fn format_hex_prefix(v: u64) -> String {
    let mut hex = format!("{:016x}", v);
    while hex.len() > 2 && hex.ends_with("00") {
        hex.truncate(hex.len() - 2);
    }
    hex
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start != 0 {
            write!(f, "{}", format_hex_prefix(self.start))?;
        }
        write!(f, "-")?;
        if let Some(end) = self.end {
            write!(f, "{}", format_hex_prefix(end))?;
        }
        Ok(())
    }
}

/// Per-row keep predicate on a sharding column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowPredicate {
    pub column: String,
    pub range: KeyRange,
}

/// Declarative filter input, persisted with each stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Source keyspace the tables belong to.
    pub keyspace: String,
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<RowPredicate>,
}

impl FilterSpec {
    pub fn new(keyspace: impl Into<String>, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keyspace: keyspace.into(),
            tables: tables.into_iter().map(Into::into).collect(),
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, column: impl Into<String>, range: KeyRange) -> Self {
        self.predicate = Some(RowPredicate {
            column: column.into(),
            range,
        });
        self
    }
}

/// Compiled, immutable filter.
#[derive(Debug, Clone)]
pub struct Filter {
    spec: FilterSpec,
    table_set: HashSet<String>,
}

impl Filter {
    /// Compile a filter. Duplicate tables collapse, first occurrence wins.
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        if spec.tables.is_empty() {
            return Err(MigrationError::InvalidFilter("empty table list".to_string()));
        }
        let mut table_set = HashSet::new();
        let mut ordered = Vec::with_capacity(spec.tables.len());
        for table in &spec.tables {
            validate_identifier(table)?;
            if table_set.insert(table.clone()) {
                ordered.push(table.clone());
            }
        }
        // Full-range predicates are dropped so equivalent filters compare equal.
        let predicate = match &spec.predicate {
            Some(p) => {
                validate_identifier(&p.column)?;
                if p.range.is_full() {
                    None
                } else {
                    Some(p.clone())
                }
            }
            None => None,
        };
        Ok(Self {
            spec: FilterSpec {
                keyspace: spec.keyspace.clone(),
                tables: ordered,
                predicate,
            },
            table_set,
        })
    }

    /// Normalized spec (deduplicated tables).
    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn tables(&self) -> &[String] {
        &self.spec.tables
    }

    pub fn matches_table(&self, table: &str) -> bool {
        self.table_set.contains(table)
    }

    /// Whether a row image passes the row predicate.
    pub fn keeps_row(&self, row: &Row) -> bool {
        let Some(pred) = &self.spec.predicate else {
            return true;
        };
        match row.column(&pred.column).as_ref().and_then(keyspace_id) {
            Some(id) => pred.range.contains(id),
            None => false,
        }
    }

    /// Filter one change. Returns the change to apply on the destination, if any.
    pub fn filter_change(&self, change: &RowChange) -> Option<RowChange> {
        if !self.matches_table(&change.table) {
            return None;
        }
        match change.op {
            RowOp::Delete => Some(change.clone()),
            RowOp::Insert if self.keeps_row(&change.row) => Some(change.clone()),
            RowOp::Insert => None,
            RowOp::Update if self.keeps_row(&change.row) => Some(change.clone()),
            RowOp::Update => Some(RowChange::delete(change.table.clone(), change.row.id)),
        }
    }

    /// Filter a whole source transaction, preserving change order.
    pub fn apply(&self, event: &SourceEvent) -> Vec<RowChange> {
        event
            .changes
            .iter()
            .filter_map(|c| self.filter_change(c))
            .collect()
    }

    /// Filter snapshot rows for bulk copy.
    pub fn filter_rows(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().filter(|r| self.keeps_row(r)).collect()
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.spec.keyspace == other.spec.keyspace
            && self.table_set == other.table_set
            && self.spec.predicate == other.spec.predicate
    }
}

impl Eq for Filter {}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.spec.keyspace, self.spec.tables.join(","))?;
        if let Some(pred) = &self.spec.predicate {
            write!(f, " where {} in {}", pred.column, pred.range)?;
        }
        Ok(())
    }
}

/// Interpret a column value as an unsigned keyspace id.
///
/// Negative integers map through their two's complement bit pattern.
fn keyspace_id(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_i64().map(|v| v as u64))
}
