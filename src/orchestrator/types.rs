// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration records and phase deltas.
//!
//! # Phase Order
//!
//! ```text
//!            clone_tables()         cutover(rdonly)          cutover(replica)         cutover(primary)
//!   (none) ─────────────────→ Clone ────────────────→ CutoverReadOnly ─────────→ CutoverReplica ─────────→ CutoverPrimary
//!     ↑                         │  ↑                    │                          │                          │
//!     └──── cancel() ───────────┘  └──── reverse() ─────┘ ←──── reverse() ─────────┘ ←──── reverse() ──────────┤
//!                                                                                                             │
//!                                                                                            finalize() ──────┘ (record deleted)
//! ```
//!
//! A record holds the stack of committed phases, each with the delta it
//! applied. Reversing pops the latest phase and applies the stored inverse.
//! A pending intent is written before any external write so a retry can
//! finish (or a reverse can undo) exactly what was started.

use crate::blacklist::BlacklistChange;
use crate::partition::TrafficClass;
use crate::routing::{RoutingRules, RuleKey};
use crate::stream::StreamId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MIGRATIONS_PREFIX: &str = "migrations/";

/// Identifies a migration by its keyspace pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MigrationKey {
    pub source_keyspace: String,
    pub destination_keyspace: String,
}

impl MigrationKey {
    pub fn new(source_keyspace: impl Into<String>, destination_keyspace: impl Into<String>) -> Self {
        Self {
            source_keyspace: source_keyspace.into(),
            destination_keyspace: destination_keyspace.into(),
        }
    }

    /// Topology key, derived from the sorted keyspace pair so at most one
    /// migration exists per unordered pair.
    pub fn record_key(&self) -> String {
        let (a, b) = if self.source_keyspace <= self.destination_keyspace {
            (&self.source_keyspace, &self.destination_keyspace)
        } else {
            (&self.destination_keyspace, &self.source_keyspace)
        };
        format!("{}{}+{}", MIGRATIONS_PREFIX, a, b)
    }

    pub fn prefix() -> &'static str {
        MIGRATIONS_PREFIX
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source_keyspace, self.destination_keyspace)
    }
}

/// Migration phases in the order they must be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Clone,
    CutoverReadOnly,
    CutoverReplica,
    CutoverPrimary,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Clone,
        Phase::CutoverReadOnly,
        Phase::CutoverReplica,
        Phase::CutoverPrimary,
    ];

    /// The cutover phase serving a traffic class.
    pub fn cutover(class: TrafficClass) -> Phase {
        match class {
            TrafficClass::ReadOnly => Phase::CutoverReadOnly,
            TrafficClass::Replica => Phase::CutoverReplica,
            TrafficClass::Primary => Phase::CutoverPrimary,
        }
    }

    /// Traffic class moved by a cutover phase. `None` for Clone.
    pub fn class(self) -> Option<TrafficClass> {
        match self {
            Phase::Clone => None,
            Phase::CutoverReadOnly => Some(TrafficClass::ReadOnly),
            Phase::CutoverReplica => Some(TrafficClass::Replica),
            Phase::CutoverPrimary => Some(TrafficClass::Primary),
        }
    }

    /// The phase that must be committed before this one.
    pub fn previous(self) -> Option<Phase> {
        match self {
            Phase::Clone => None,
            Phase::CutoverReadOnly => Some(Phase::Clone),
            Phase::CutoverReplica => Some(Phase::CutoverReadOnly),
            Phase::CutoverPrimary => Some(Phase::CutoverReplica),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Clone => "clone",
            Phase::CutoverReadOnly => "cutover_rdonly",
            Phase::CutoverReplica => "cutover_replica",
            Phase::CutoverPrimary => "cutover_primary",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clone" => Ok(Phase::Clone),
            "cutover_rdonly" => Ok(Phase::CutoverReadOnly),
            "cutover_replica" => Ok(Phase::CutoverReplica),
            "cutover_primary" => Ok(Phase::CutoverPrimary),
            other => Err(format!("unknown phase {:?}", other)),
        }
    }
}

/// Which way writes currently replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Source → destination.
    Forward,
    /// Destination → source, after a primary cutover with reverse replication.
    Reversed,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reversed => write!(f, "reversed"),
        }
    }
}

/// One routing rule mutation with the value it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleChange {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<String>>,
}

impl RuleChange {
    pub fn inverse(&self) -> Self {
        Self {
            key: self.key.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

/// Everything a phase writes outside the stream engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDelta {
    pub phase: Phase,
    #[serde(default)]
    pub rules: Vec<RuleChange>,
    #[serde(default)]
    pub blacklists: Vec<BlacklistChange>,
}

impl PhaseDelta {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            rules: Vec::new(),
            blacklists: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.blacklists.is_empty()
    }

    /// The delta that restores the state this one was planned against.
    pub fn inverse(&self) -> Self {
        Self {
            phase: self.phase,
            rules: self.rules.iter().rev().map(RuleChange::inverse).collect(),
            blacklists: self.blacklists.iter().rev().map(BlacklistChange::inverse).collect(),
        }
    }

    /// Write the `after` side of every rule change into `rules`.
    ///
    /// Returns whether `rules` changed.
    pub fn apply_rules(&self, rules: &mut RoutingRules) -> bool {
        let mut changed = false;
        for change in &self.rules {
            let Ok(key) = change.key.parse::<RuleKey>() else {
                continue;
            };
            let current = rules.get(&key).cloned();
            if current == change.after {
                continue;
            }
            match &change.after {
                Some(targets) => {
                    rules.set(&key, targets.clone());
                }
                None => {
                    rules.remove(&key);
                }
            }
            changed = true;
        }
        changed
    }
}

/// Whether a pending intent moves forward or undoes a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Apply,
    Reverse,
}

/// A phase that started writing but has not committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIntent {
    pub kind: IntentKind,
    /// The delta being written (already inverted for a reverse).
    pub delta: PhaseDelta,
    #[serde(default)]
    pub reverse_replication: bool,
}

/// A committed phase and the delta it applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedPhase {
    pub delta: PhaseDelta,
    /// Milliseconds since the Unix epoch.
    pub committed_at: i64,
}

impl CommittedPhase {
    pub fn phase(&self) -> Phase {
        self.delta.phase
    }
}

/// Persisted state of one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub source_keyspace: String,
    pub destination_keyspace: String,
    pub tables: Vec<String>,
    pub direction: Direction,
    #[serde(default)]
    pub committed: Vec<CommittedPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingIntent>,
    #[serde(default)]
    pub forward_streams: Vec<StreamId>,
    #[serde(default)]
    pub reverse_streams: Vec<StreamId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MigrationRecord {
    pub fn new(key: &MigrationKey, tables: Vec<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            source_keyspace: key.source_keyspace.clone(),
            destination_keyspace: key.destination_keyspace.clone(),
            tables,
            direction: Direction::Forward,
            committed: Vec::new(),
            pending: None,
            forward_streams: Vec::new(),
            reverse_streams: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(&self.source_keyspace, &self.destination_keyspace)
    }

    /// Latest committed phase.
    pub fn latest_phase(&self) -> Option<Phase> {
        self.committed.last().map(CommittedPhase::phase)
    }

    pub fn latest(&self) -> Option<&CommittedPhase> {
        self.committed.last()
    }

    pub fn all_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.forward_streams.iter().chain(self.reverse_streams.iter()).copied()
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
