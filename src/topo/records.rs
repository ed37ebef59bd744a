// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed topology records.
//!
//! Records are JSON documents stored under fixed key paths. Reads return the
//! record together with its version so callers can write back with
//! compare-and-swap.

use super::TopoStore;
use crate::error::{MigrationError, Result};
use crate::filter::{validate_identifier, KeyRange};
use crate::partition::{PartitionRef, TrafficClass};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

const KEYSPACES_PREFIX: &str = "keyspaces/";

pub fn keyspace_key(keyspace: &str) -> String {
    format!("{}{}", KEYSPACES_PREFIX, keyspace)
}

pub fn shard_key(partition: &PartitionRef) -> String {
    format!("{}{}/shards/{}", KEYSPACES_PREFIX, partition.keyspace, partition.shard)
}

/// Keyspace metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRecord {
    pub name: String,
    /// Column holding the keyspace id for sharded keyspaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding_column: Option<String>,
}

/// Serving controls for one traffic class on a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletControl {
    pub class: TrafficClass,
    #[serde(default)]
    pub blacklisted_tables: BTreeSet<String>,
}

/// Shard metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// `None` means the shard owns every keyspace id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
    #[serde(default)]
    pub tablet_controls: Vec<TabletControl>,
}

impl ShardRecord {
    /// Tables blacklisted for writes served by `class`.
    pub fn blacklisted(&self, class: TrafficClass) -> BTreeSet<String> {
        self.tablet_controls
            .iter()
            .find(|c| c.class == class)
            .map(|c| c.blacklisted_tables.clone())
            .unwrap_or_default()
    }

    pub fn is_blacklisted(&self, class: TrafficClass, table: &str) -> bool {
        self.tablet_controls
            .iter()
            .any(|c| c.class == class && c.blacklisted_tables.contains(table))
    }

    /// Add tables to the class blacklist. Returns whether anything changed.
    pub fn add_blacklist<'a>(
        &mut self,
        class: TrafficClass,
        tables: impl IntoIterator<Item = &'a String>,
    ) -> bool {
        let idx = match self.tablet_controls.iter().position(|c| c.class == class) {
            Some(i) => i,
            None => {
                self.tablet_controls.push(TabletControl {
                    class,
                    blacklisted_tables: BTreeSet::new(),
                });
                self.tablet_controls.sort_by_key(|c| c.class);
                self.tablet_controls
                    .iter()
                    .position(|c| c.class == class)
                    .unwrap_or(0)
            }
        };
        let control = &mut self.tablet_controls[idx];
        let mut changed = false;
        for t in tables {
            changed |= control.blacklisted_tables.insert(t.clone());
        }
        self.prune();
        changed
    }

    /// Remove tables from the class blacklist. Returns whether anything changed.
    pub fn remove_blacklist<'a>(
        &mut self,
        class: TrafficClass,
        tables: impl IntoIterator<Item = &'a String>,
    ) -> bool {
        let mut changed = false;
        if let Some(control) = self.tablet_controls.iter_mut().find(|c| c.class == class) {
            for t in tables {
                changed |= control.blacklisted_tables.remove(t);
            }
        }
        self.prune();
        changed
    }

    fn prune(&mut self) {
        self.tablet_controls
            .retain(|c| !c.blacklisted_tables.is_empty());
    }
}

/// Typed access to the topology store.
#[derive(Clone)]
pub struct Topology {
    store: Arc<dyn TopoStore>,
}

impl Topology {
    pub fn new(store: Arc<dyn TopoStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TopoStore> {
        &self.store
    }

    // =========================================================================
    // Generic JSON records
    // =========================================================================

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, u64)>> {
        match self.store.get(key).await? {
            Some(v) => Ok(Some((serde_json::from_slice(&v.value)?, v.version))),
            None => Ok(None),
        }
    }

    pub async fn create_json<T: Serialize>(&self, key: &str, value: &T) -> Result<u64> {
        self.store.create(key, serde_json::to_vec(value)?).await
    }

    pub async fn update_json<T: Serialize>(&self, key: &str, value: &T, version: u64) -> Result<u64> {
        self.store.update(key, serde_json::to_vec(value)?, version).await
    }

    pub async fn delete(&self, key: &str, version: u64) -> Result<()> {
        self.store.delete(key, version).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.store.list(prefix).await
    }

    // =========================================================================
    // Keyspaces and shards
    // =========================================================================

    /// Register a keyspace. Fails if it already exists.
    pub async fn create_keyspace(&self, name: &str, sharding_column: Option<&str>) -> Result<()> {
        validate_identifier(name).map_err(|_| {
            MigrationError::Config(format!("invalid keyspace name {:?}", name))
        })?;
        let record = KeyspaceRecord {
            name: name.to_string(),
            sharding_column: sharding_column.map(str::to_string),
        };
        self.create_json(&keyspace_key(name), &record).await?;
        info!(keyspace = %name, "Created keyspace");
        Ok(())
    }

    pub async fn get_keyspace(&self, name: &str) -> Result<Option<KeyspaceRecord>> {
        Ok(self
            .get_json::<KeyspaceRecord>(&keyspace_key(name))
            .await?
            .map(|(r, _)| r))
    }

    /// Keyspace names, sorted.
    pub async fn list_keyspaces(&self) -> Result<Vec<String>> {
        Ok(self
            .list(KEYSPACES_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| {
                let rest = k.strip_prefix(KEYSPACES_PREFIX)?;
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    /// Register a shard under an existing keyspace.
    pub async fn create_shard(&self, partition: &PartitionRef, key_range: Option<KeyRange>) -> Result<()> {
        if self.get_keyspace(&partition.keyspace).await?.is_none() {
            return Err(MigrationError::NotFound(format!(
                "keyspace {}",
                partition.keyspace
            )));
        }
        let record = ShardRecord {
            key_range,
            tablet_controls: Vec::new(),
        };
        self.create_json(&shard_key(partition), &record).await?;
        info!(partition = %partition, "Created shard");
        Ok(())
    }

    /// Shard record with its version. `NotFound` if absent.
    pub async fn get_shard(&self, partition: &PartitionRef) -> Result<(ShardRecord, u64)> {
        self.get_json(&shard_key(partition))
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("shard {}", partition)))
    }

    pub async fn update_shard(&self, partition: &PartitionRef, record: &ShardRecord, version: u64) -> Result<u64> {
        self.update_json(&shard_key(partition), record, version).await
    }

    /// Shards of a keyspace, sorted by name.
    pub async fn list_shards(&self, keyspace: &str) -> Result<Vec<PartitionRef>> {
        let prefix = format!("{}{}/shards/", KEYSPACES_PREFIX, keyspace);
        Ok(self
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .map(|shard| PartitionRef::new(keyspace, shard))
            })
            .collect())
    }
}
