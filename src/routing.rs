// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing rule store.
//!
//! The whole rule set lives under one topology key and is only ever replaced
//! wholesale with compare-and-swap. A rule maps a query target to an ordered
//! list of `keyspace.table` destinations:
//!
//! ```text
//! destination_keyspace.moving1         → [source_keyspace.moving1]
//! moving1                              → [source_keyspace.moving1]
//! source_keyspace.moving1@rdonly       → [destination_keyspace.moving1]
//! ```
//!
//! # Precedence
//!
//! For a target (`keyspace?`, `table`, `class`) the first present key wins:
//!
//! 1. `keyspace.table@class`
//! 2. `keyspace.table`
//! 3. `table@class`
//! 4. `table`
//! 5. default routing to the query's own keyspace
//!
//! The store itself enforces nothing beyond atomic replacement.

use crate::error::{MigrationError, Result};
use crate::filter::validate_identifier;
use crate::partition::TrafficClass;
use crate::topo::Topology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Topology key holding the rule set.
pub const ROUTING_RULES_KEY: &str = "routing_rules";

/// Parsed form of a rule key: `[keyspace.]table[@class]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub keyspace: Option<String>,
    pub table: String,
    pub class: Option<TrafficClass>,
}

impl RuleKey {
    pub fn new(keyspace: Option<&str>, table: &str, class: Option<TrafficClass>) -> Self {
        Self {
            keyspace: keyspace.map(str::to_string),
            table: table.to_string(),
            class,
        }
    }

    pub fn qualified(keyspace: &str, table: &str) -> Self {
        Self::new(Some(keyspace), table, None)
    }

    pub fn unqualified(table: &str) -> Self {
        Self::new(None, table, None)
    }

    pub fn with_class(mut self, class: TrafficClass) -> Self {
        self.class = Some(class);
        self
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ks) = &self.keyspace {
            write!(f, "{}.", ks)?;
        }
        write!(f, "{}", self.table)?;
        if let Some(class) = self.class {
            write!(f, "@{}", class)?;
        }
        Ok(())
    }
}

impl FromStr for RuleKey {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        let (target, class) = match s.split_once('@') {
            Some((t, c)) => {
                let class = c
                    .parse::<TrafficClass>()
                    .map_err(MigrationError::InvalidFilter)?;
                (t, Some(class))
            }
            None => (s, None),
        };
        let (keyspace, table) = match target.split_once('.') {
            Some((ks, t)) => {
                validate_identifier(ks)?;
                (Some(ks.to_string()), t)
            }
            None => (None, target),
        };
        validate_identifier(table)?;
        Ok(Self {
            keyspace,
            table: table.to_string(),
            class,
        })
    }
}

/// Format a `keyspace.table` routing destination.
pub fn target(keyspace: &str, table: &str) -> String {
    format!("{}.{}", keyspace, table)
}

/// Split a `keyspace.table` destination.
pub fn split_target(target: &str) -> Option<(&str, &str)> {
    target.split_once('.')
}

/// Where a query target resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A rule matched; `targets` is its destination list.
    Rule { key: String, targets: Vec<String> },
    /// No rule matched; route to the query's own keyspace.
    Default,
}

/// The complete rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingRules {
    rules: BTreeMap<String, Vec<String>>,
}

impl RoutingRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, key: &RuleKey) -> Option<&Vec<String>> {
        self.rules.get(&key.to_string())
    }

    /// Set a rule, returning the prior destinations.
    pub fn set(&mut self, key: &RuleKey, targets: Vec<String>) -> Option<Vec<String>> {
        self.rules.insert(key.to_string(), targets)
    }

    /// Remove a rule, returning the prior destinations.
    pub fn remove(&mut self, key: &RuleKey) -> Option<Vec<String>> {
        self.rules.remove(&key.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.rules.iter()
    }

    /// Resolve a query target by precedence.
    pub fn resolve(&self, keyspace: Option<&str>, table: &str, class: TrafficClass) -> Resolution {
        let mut candidates = Vec::with_capacity(4);
        if let Some(ks) = keyspace {
            candidates.push(RuleKey::qualified(ks, table).with_class(class));
            candidates.push(RuleKey::qualified(ks, table));
        }
        candidates.push(RuleKey::unqualified(table).with_class(class));
        candidates.push(RuleKey::unqualified(table));

        for key in candidates {
            let key = key.to_string();
            if let Some(targets) = self.rules.get(&key) {
                return Resolution::Rule {
                    key,
                    targets: targets.clone(),
                };
            }
        }
        Resolution::Default
    }

    /// Keyspace a query target lands in, applying default routing.
    ///
    /// `None` when the target is unqualified and no rule matches.
    pub fn resolve_keyspace(&self, keyspace: Option<&str>, table: &str, class: TrafficClass) -> Option<String> {
        match self.resolve(keyspace, table, class) {
            Resolution::Rule { targets, .. } => targets
                .first()
                .and_then(|t| split_target(t))
                .map(|(ks, _)| ks.to_string()),
            Resolution::Default => keyspace.map(str::to_string),
        }
    }
}

impl FromIterator<(RuleKey, Vec<String>)> for RoutingRules {
    fn from_iter<I: IntoIterator<Item = (RuleKey, Vec<String>)>>(iter: I) -> Self {
        let mut rules = RoutingRules::new();
        for (k, v) in iter {
            rules.set(&k, v);
        }
        rules
    }
}

/// Versioned, CAS-guarded access to the rule set.
#[derive(Clone)]
pub struct RoutingRuleStore {
    topo: Topology,
}

impl RoutingRuleStore {
    pub fn new(topo: Topology) -> Self {
        Self { topo }
    }

    /// Current rules and version. An absent record reads as empty at version 0.
    pub async fn read(&self) -> Result<(RoutingRules, u64)> {
        Ok(self
            .topo
            .get_json::<RoutingRules>(ROUTING_RULES_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Replace the rule set if the stored version is still `expected_version`.
    ///
    /// Returns the new version. Never overwrites blindly.
    pub async fn compare_and_swap(&self, expected_version: u64, rules: &RoutingRules) -> Result<u64> {
        let result = if expected_version == 0 {
            self.topo
                .create_json(ROUTING_RULES_KEY, rules)
                .await
                .map_err(|e| match e {
                    MigrationError::AlreadyExists(key) => MigrationError::Conflict { key, expected: 0 },
                    other => other,
                })
        } else {
            self.topo
                .update_json(ROUTING_RULES_KEY, rules, expected_version)
                .await
                .map_err(|e| match e {
                    MigrationError::NotFound(key) => MigrationError::Conflict {
                        key,
                        expected: expected_version,
                    },
                    other => other,
                })
        };

        match &result {
            Ok(version) => {
                debug!(version, rules = rules.len(), "Routing rules updated");
            }
            Err(e) if e.is_conflict() => {
                warn!(expected_version, "Routing rules CAS conflict");
                crate::metrics::record_cas_conflict(ROUTING_RULES_KEY);
            }
            Err(_) => {}
        }
        result
    }
}
