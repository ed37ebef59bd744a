// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage partition integration traits.
//!
//! Defines what the control plane needs from the underlying storage engine.
//! The engine itself is external; the daemon provides a [`PartitionBackend`]
//! per shard and a [`PartitionResolver`] that maps shard references to them.
//!
//! # Example
//!
//! ```rust,no_run
//! use keyspace_migrator::partition::{BoxFuture, PartitionBackend};
//! use keyspace_migrator::event::{Row, RowChange, Snapshot, SourceEvent};
//! use keyspace_migrator::position::Position;
//!
//! struct MyBackend;
//!
//! impl PartitionBackend for MyBackend {
//!     fn head(&self) -> BoxFuture<'_, Position> {
//!         Box::pin(async { Ok(Position::START) })
//!     }
//!     fn read_events(&self, _after: Position, _max: usize) -> BoxFuture<'_, Vec<SourceEvent>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//!     fn snapshot(&self, _table: &str) -> BoxFuture<'_, Snapshot> {
//!         Box::pin(async { Ok(Snapshot { position: Position::START, rows: vec![] }) })
//!     }
//!     fn apply(&self, _changes: Vec<RowChange>) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn bulk_load(&self, _table: &str, _rows: Vec<Row>) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn truncate(&self, _table: &str) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use crate::event::{Row, RowChange, Snapshot, SourceEvent};
use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Result type for partition operations.
pub type PartitionResult<T> = std::result::Result<T, PartitionError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = PartitionResult<T>> + Send + 'a>>;

/// Failure reported by a storage partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// Connection loss, lock wait timeout. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Constraint violation, schema mismatch. Needs an operator.
    #[error("data: {0}")]
    Data(String),

    /// The partition is gone.
    #[error("partition lost: {0}")]
    Lost(String),
}

impl PartitionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A shard of one keyspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionRef {
    pub keyspace: String,
    pub shard: String,
}

impl PartitionRef {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard)
    }
}

impl FromStr for PartitionRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ks, shard)) if !ks.is_empty() && !shard.is_empty() && !shard.contains('/') => {
                Ok(PartitionRef::new(ks, shard))
            }
            _ => Err(format!("invalid partition reference {:?}, expected keyspace/shard", s)),
        }
    }
}

/// Query traffic class.
///
/// Cutover proceeds in declaration order, least risky first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    #[serde(rename = "rdonly")]
    ReadOnly,
    Replica,
    Primary,
}

impl TrafficClass {
    /// All classes in cutover order.
    pub const ALL: [TrafficClass; 3] = [
        TrafficClass::ReadOnly,
        TrafficClass::Replica,
        TrafficClass::Primary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "rdonly",
            Self::Replica => "replica",
            Self::Primary => "primary",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rdonly" | "readonly" => Ok(Self::ReadOnly),
            "replica" => Ok(Self::Replica),
            "primary" | "master" => Ok(Self::Primary),
            other => Err(format!("unknown traffic class {:?}", other)),
        }
    }
}

/// What the control plane needs from one storage partition.
///
/// Implementations must keep the mutation log gap-free and make `apply`
/// atomic: either every change lands (and is appended to the log as one
/// event) or none does.
pub trait PartitionBackend: Send + Sync + 'static {
    /// Position of the latest committed event.
    fn head(&self) -> BoxFuture<'_, Position>;

    /// Up to `max` events strictly after `after`, in log order.
    fn read_events(&self, after: Position, max: usize) -> BoxFuture<'_, Vec<SourceEvent>>;

    /// Consistent snapshot of one table, with the head position it reflects.
    fn snapshot(&self, table: &str) -> BoxFuture<'_, Snapshot>;

    /// Apply one transaction atomically.
    fn apply(&self, changes: Vec<RowChange>) -> BoxFuture<'_, ()>;

    /// Upsert rows without producing log events.
    fn bulk_load(&self, table: &str, rows: Vec<Row>) -> BoxFuture<'_, ()>;

    /// Remove every row of a table without producing log events.
    fn truncate(&self, table: &str) -> BoxFuture<'_, ()>;
}

/// Maps partition references to live backends.
pub trait PartitionResolver: Send + Sync + 'static {
    fn resolve(&self, partition: &PartitionRef) -> Option<Arc<dyn PartitionBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_ref_display_and_parse() {
        let p = PartitionRef::new("source_keyspace", "0");
        assert_eq!(p.to_string(), "source_keyspace/0");
        assert_eq!("source_keyspace/0".parse::<PartitionRef>().unwrap(), p);
        assert_eq!(
            "ks/-80".parse::<PartitionRef>().unwrap(),
            PartitionRef::new("ks", "-80")
        );
    }

    #[test]
    fn test_partition_ref_parse_rejects_malformed() {
        assert!("ks".parse::<PartitionRef>().is_err());
        assert!("/0".parse::<PartitionRef>().is_err());
        assert!("ks/".parse::<PartitionRef>().is_err());
        assert!("ks/0/1".parse::<PartitionRef>().is_err());
    }

    #[test]
    fn test_traffic_class_order() {
        assert!(TrafficClass::ReadOnly < TrafficClass::Replica);
        assert!(TrafficClass::Replica < TrafficClass::Primary);
        assert_eq!(TrafficClass::ALL[0], TrafficClass::ReadOnly);
    }

    #[test]
    fn test_traffic_class_parse() {
        assert_eq!("rdonly".parse::<TrafficClass>().unwrap(), TrafficClass::ReadOnly);
        assert_eq!("REPLICA".parse::<TrafficClass>().unwrap(), TrafficClass::Replica);
        assert_eq!("master".parse::<TrafficClass>().unwrap(), TrafficClass::Primary);
        assert!("batch".parse::<TrafficClass>().is_err());
    }

    #[test]
    fn test_traffic_class_serde_uses_short_names() {
        assert_eq!(serde_json::to_string(&TrafficClass::ReadOnly).unwrap(), "\"rdonly\"");
        assert_eq!(serde_json::to_string(&TrafficClass::Primary).unwrap(), "\"primary\"");
        let back: TrafficClass = serde_json::from_str("\"replica\"").unwrap();
        assert_eq!(back, TrafficClass::Replica);
    }

    #[test]
    fn test_partition_error_transient() {
        assert!(PartitionError::Transient("x".into()).is_transient());
        assert!(!PartitionError::Data("x".into()).is_transient());
        assert!(!PartitionError::Lost("x".into()).is_transient());
    }
}
