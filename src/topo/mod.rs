// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topology store: the shared, versioned metadata the control plane
//! coordinates through.
//!
//! Every mutable shared resource (routing rules, shard blacklists, migration
//! records) lives here under optimistic concurrency. There are no in-process
//! globals, so independent orchestrator instances interoperate safely.
//!
//! ```text
//! keyspaces/<ks>                    KeyspaceRecord
//! keyspaces/<ks>/shards/<shard>     ShardRecord (key range, tablet controls)
//! routing_rules                     RoutingRules
//! migrations/<a>+<b>                MigrationRecord (a < b)
//! ```
//!
//! Backends implement [`TopoStore`] over opaque bytes; [`Topology`] layers
//! typed JSON records on top.

pub mod records;
pub mod sqlite;

pub use records::{KeyspaceRecord, ShardRecord, TabletControl, Topology};
pub use sqlite::SqliteTopo;

use crate::error::{MigrationError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Boxed future returned by [`TopoStore`] methods.
pub type TopoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A value with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Versioned key-value collaborator.
///
/// Versions start at 1 on create and increase by one on every update.
pub trait TopoStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> TopoFuture<'_, Option<Versioned>>;

    /// Create-if-absent. Fails with `AlreadyExists` otherwise.
    fn create(&self, key: &str, value: Vec<u8>) -> TopoFuture<'_, u64>;

    /// Compare-and-swap. Fails with `Conflict` if the stored version differs
    /// and `NotFound` if the key is absent.
    fn update(&self, key: &str, value: Vec<u8>, expected_version: u64) -> TopoFuture<'_, u64>;

    /// Versioned delete.
    fn delete(&self, key: &str, expected_version: u64) -> TopoFuture<'_, ()>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> TopoFuture<'_, Vec<String>>;
}

/// In-memory topology store.
#[derive(Default)]
pub struct MemoryTopo {
    entries: RwLock<BTreeMap<String, Versioned>>,
}

impl MemoryTopo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TopoStore for MemoryTopo {
    fn get(&self, key: &str) -> TopoFuture<'_, Option<Versioned>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.entries.read().await.get(&key).cloned()) })
    }

    fn create(&self, key: &str, value: Vec<u8>) -> TopoFuture<'_, u64> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&key) {
                return Err(MigrationError::AlreadyExists(key));
            }
            entries.insert(key, Versioned { value, version: 1 });
            Ok(1)
        })
    }

    fn update(&self, key: &str, value: Vec<u8>, expected_version: u64) -> TopoFuture<'_, u64> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&key)
                .ok_or_else(|| MigrationError::NotFound(key.clone()))?;
            if entry.version != expected_version {
                return Err(MigrationError::Conflict {
                    key,
                    expected: expected_version,
                });
            }
            entry.value = value;
            entry.version += 1;
            Ok(entry.version)
        })
    }

    fn delete(&self, key: &str, expected_version: u64) -> TopoFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            match entries.get(&key) {
                None => Err(MigrationError::NotFound(key)),
                Some(e) if e.version != expected_version => Err(MigrationError::Conflict {
                    key,
                    expected: expected_version,
                }),
                Some(_) => {
                    entries.remove(&key);
                    Ok(())
                }
            }
        })
    }

    fn list(&self, prefix: &str) -> TopoFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            Ok(self
                .entries
                .read()
                .await
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect())
        })
    }
}
