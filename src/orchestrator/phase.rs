// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Phase planning.
//!
//! Planners are pure: given the current rules and shard records they return
//! the [`PhaseDelta`] that moves the migration into the phase. Rule changes
//! record the value they replace and blacklist changes list only tables
//! whose membership actually changes, so the stored inverse restores the
//! planned-against state exactly.
//!
//! | Phase           | Rules (per table `t`)                                   | Blacklists                              |
//! |-----------------|---------------------------------------------------------|-----------------------------------------|
//! | Clone           | `dst.t → src.t`, `t → src.t`                            | install dst primary                     |
//! | CutoverReadOnly | `src.t@rdonly`, `dst.t@rdonly`, `t@rdonly` → `dst.t`    | install src rdonly                      |
//! | CutoverReplica  | `src.t@replica`, `dst.t@replica`, `t@replica` → `dst.t` | install src replica                     |
//! | CutoverPrimary  | every rule on `t` replaced by `src.t → dst.t`, `t → dst.t` | install src primary, remove dst primary |

use super::types::{Phase, PhaseDelta, RuleChange};
use crate::blacklist::{BlacklistAction, BlacklistChange};
use crate::partition::{PartitionRef, TrafficClass};
use crate::routing::{target, RoutingRules, RuleKey};
use crate::topo::ShardRecord;
use std::collections::{BTreeMap, BTreeSet};

/// Current state a phase is planned against.
pub struct PlanInput<'a> {
    pub source_keyspace: &'a str,
    pub destination_keyspace: &'a str,
    pub tables: &'a [String],
    pub source_shards: &'a BTreeMap<PartitionRef, ShardRecord>,
    pub destination_shards: &'a BTreeMap<PartitionRef, ShardRecord>,
    pub rules: &'a RoutingRules,
}

impl PlanInput<'_> {
    fn table_set(&self) -> BTreeSet<String> {
        self.tables.iter().cloned().collect()
    }
}

/// Plan the delta that enters `phase`.
pub fn plan(phase: Phase, input: &PlanInput<'_>) -> PhaseDelta {
    let mut builder = DeltaBuilder::new(phase, input.rules);
    let tables = input.table_set();
    let src = input.source_keyspace;
    let dst = input.destination_keyspace;

    match phase {
        Phase::Clone => {
            for t in input.tables {
                builder.set_rule(RuleKey::qualified(dst, t), vec![target(src, t)]);
                builder.set_rule(RuleKey::unqualified(t), vec![target(src, t)]);
            }
            builder.blacklist(
                input.destination_shards,
                TrafficClass::Primary,
                BlacklistAction::Install,
                &tables,
            );
        }
        Phase::CutoverReadOnly | Phase::CutoverReplica => {
            let class = match phase {
                Phase::CutoverReadOnly => TrafficClass::ReadOnly,
                _ => TrafficClass::Replica,
            };
            for t in input.tables {
                let moved = vec![target(dst, t)];
                builder.set_rule(RuleKey::qualified(src, t).with_class(class), moved.clone());
                builder.set_rule(RuleKey::qualified(dst, t).with_class(class), moved.clone());
                builder.set_rule(RuleKey::unqualified(t).with_class(class), moved);
            }
            builder.blacklist(input.source_shards, class, BlacklistAction::Install, &tables);
        }
        Phase::CutoverPrimary => {
            let desired: BTreeMap<String, Vec<String>> = input
                .tables
                .iter()
                .flat_map(|t| {
                    [
                        (RuleKey::qualified(src, t).to_string(), vec![target(dst, t)]),
                        (RuleKey::unqualified(t).to_string(), vec![target(dst, t)]),
                    ]
                })
                .collect();

            for (key, before) in input.rules.iter() {
                if desired.contains_key(key) {
                    continue;
                }
                let Ok(parsed) = key.parse::<RuleKey>() else {
                    continue;
                };
                let on_moved_table = tables.contains(&parsed.table)
                    && match parsed.keyspace.as_deref() {
                        None => true,
                        Some(ks) => ks == src || ks == dst,
                    };
                if on_moved_table {
                    builder.unset_rule(key, before);
                }
            }
            for t in input.tables {
                builder.set_rule(RuleKey::qualified(src, t), vec![target(dst, t)]);
                builder.set_rule(RuleKey::unqualified(t), vec![target(dst, t)]);
            }

            builder.blacklist(
                input.source_shards,
                TrafficClass::Primary,
                BlacklistAction::Install,
                &tables,
            );
            builder.blacklist(
                input.destination_shards,
                TrafficClass::Primary,
                BlacklistAction::Remove,
                &tables,
            );
        }
    }

    builder.finish()
}

struct DeltaBuilder<'a> {
    delta: PhaseDelta,
    rules: &'a RoutingRules,
}

impl<'a> DeltaBuilder<'a> {
    fn new(phase: Phase, rules: &'a RoutingRules) -> Self {
        Self {
            delta: PhaseDelta::new(phase),
            rules,
        }
    }

    fn set_rule(&mut self, key: RuleKey, targets: Vec<String>) {
        let before = self.rules.get(&key).cloned();
        if before.as_ref() == Some(&targets) {
            return;
        }
        self.delta.rules.push(RuleChange {
            key: key.to_string(),
            before,
            after: Some(targets),
        });
    }

    fn unset_rule(&mut self, key: &str, before: &[String]) {
        self.delta.rules.push(RuleChange {
            key: key.to_string(),
            before: Some(before.to_vec()),
            after: None,
        });
    }

    fn blacklist(
        &mut self,
        shards: &BTreeMap<PartitionRef, ShardRecord>,
        class: TrafficClass,
        action: BlacklistAction,
        tables: &BTreeSet<String>,
    ) {
        for (partition, shard) in shards {
            let effective = action.effective(&shard.blacklisted(class), tables);
            if effective.is_empty() {
                continue;
            }
            self.delta.blacklists.push(BlacklistChange {
                partition: partition.clone(),
                class,
                tables: effective,
                action,
            });
        }
    }

    fn finish(self) -> PhaseDelta {
        self.delta
    }
}
