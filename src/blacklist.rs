// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write blacklists.
//!
//! A blacklist is a per (partition, traffic class) set of tables whose writes
//! are rejected. It is stored as a tablet control inside the shard record and
//! written with compare-and-swap on that record.
//!
//! During a migration the blacklist sits on the losing side of the latest
//! committed phase: on the destination primary until primary cutover, on the
//! source afterwards.

use crate::error::Result;
use crate::partition::{PartitionRef, TrafficClass};
use crate::topo::Topology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

/// Whether a change adds or removes tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistAction {
    Install,
    Remove,
}

impl BlacklistAction {
    pub fn inverse(self) -> Self {
        match self {
            Self::Install => Self::Remove,
            Self::Remove => Self::Install,
        }
    }

    /// Of `tables`, those whose membership in `current` this action changes.
    pub fn effective(self, current: &BTreeSet<String>, tables: &BTreeSet<String>) -> BTreeSet<String> {
        match self {
            Self::Install => tables.difference(current).cloned().collect(),
            Self::Remove => tables.intersection(current).cloned().collect(),
        }
    }
}

impl fmt::Display for BlacklistAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// One blacklist mutation on one shard.
///
/// `tables` only lists tables whose membership actually changes, so the
/// inverse restores the prior state exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistChange {
    pub partition: PartitionRef,
    pub class: TrafficClass,
    pub tables: BTreeSet<String>,
    pub action: BlacklistAction,
}

impl BlacklistChange {
    pub fn install(partition: PartitionRef, class: TrafficClass, tables: BTreeSet<String>) -> Self {
        Self {
            partition,
            class,
            tables,
            action: BlacklistAction::Install,
        }
    }

    pub fn remove(partition: PartitionRef, class: TrafficClass, tables: BTreeSet<String>) -> Self {
        Self {
            partition,
            class,
            tables,
            action: BlacklistAction::Remove,
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            action: self.action.inverse(),
            ..self.clone()
        }
    }
}

impl fmt::Display for BlacklistChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables: Vec<&str> = self.tables.iter().map(String::as_str).collect();
        write!(
            f,
            "{} {}@{} [{}]",
            self.action,
            self.partition,
            self.class,
            tables.join(",")
        )
    }
}

/// Reads and writes blacklists through shard records.
#[derive(Clone)]
pub struct BlacklistStore {
    topo: Topology,
}

impl BlacklistStore {
    pub fn new(topo: Topology) -> Self {
        Self { topo }
    }

    /// Tables blacklisted on a partition for a class.
    pub async fn get(&self, partition: &PartitionRef, class: TrafficClass) -> Result<BTreeSet<String>> {
        let (shard, _) = self.topo.get_shard(partition).await?;
        Ok(shard.blacklisted(class))
    }

    /// Apply a change unconditionally: reads the shard record and writes it
    /// back with CAS. Already-applied changes are a no-op.
    ///
    /// A concurrent writer surfaces as `Conflict`.
    pub async fn apply(&self, change: &BlacklistChange) -> Result<()> {
        if change.tables.is_empty() {
            return Ok(());
        }
        let (mut shard, version) = self.topo.get_shard(&change.partition).await?;
        let changed = match change.action {
            BlacklistAction::Install => shard.add_blacklist(change.class, &change.tables),
            BlacklistAction::Remove => shard.remove_blacklist(change.class, &change.tables),
        };
        if !changed {
            debug!(change = %change, "Blacklist already in place");
            return Ok(());
        }
        let result = self.topo.update_shard(&change.partition, &shard, version).await;
        if let Err(e) = &result {
            if e.is_conflict() {
                crate::metrics::record_cas_conflict(&crate::topo::records::shard_key(&change.partition));
            }
        }
        result?;

        crate::metrics::record_blacklist_change(
            &change.partition.to_string(),
            change.class.as_str(),
            &change.action.to_string(),
            change.tables.len(),
        );
        info!(
            partition = %change.partition,
            class = %change.class,
            action = %change.action,
            tables = change.tables.len(),
            "Blacklist updated"
        );
        Ok(())
    }
}
