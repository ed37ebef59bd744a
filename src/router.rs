// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query front-end view of routing state.
//!
//! [`RoutingView`] holds an eventually-refreshed snapshot of the routing
//! rules, keyspaces and shard records (including blacklists). Readers clone
//! an `Arc` out of a watch channel and never wait on a refresh.
//!
//! [`QueryRouter`] uses that snapshot to pick a physical target for a query
//! and to reject writes to blacklisted tables:
//!
//! ```text
//! (keyspace?, table, class) ──resolve──► keyspace.table ──shard_for──► ks/shard
//!                                                               │
//!                                             blacklisted? ─────┴──► "disallowed: blacklisted"
//! ```

use crate::error::{MigrationError, Result};
use crate::event::RowChange;
use crate::partition::{PartitionRef, PartitionResolver, TrafficClass};
use crate::routing::{split_target, Resolution, RoutingRuleStore, RoutingRules};
use crate::topo::{KeyspaceRecord, ShardRecord, Topology};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Point-in-time routing state.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub rules: RoutingRules,
    pub rules_version: u64,
    pub keyspaces: BTreeMap<String, KeyspaceRecord>,
    pub shards: BTreeMap<PartitionRef, ShardRecord>,
    /// Milliseconds since the Unix epoch.
    pub refreshed_at: i64,
}

/// A routed query target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub keyspace: String,
    pub table: String,
    /// The rule that matched, `None` for default routing.
    pub rule: Option<String>,
}

/// Eventually-refreshed routing state.
#[derive(Clone)]
pub struct RoutingView {
    topo: Topology,
    rules: RoutingRuleStore,
    tx: Arc<watch::Sender<Arc<RoutingSnapshot>>>,
    rx: watch::Receiver<Arc<RoutingSnapshot>>,
}

impl RoutingView {
    /// Create an empty view. Call [`refresh`](Self::refresh) to populate it.
    pub fn new(topo: Topology) -> Self {
        let (tx, rx) = watch::channel(Arc::new(RoutingSnapshot::default()));
        Self {
            rules: RoutingRuleStore::new(topo.clone()),
            topo,
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.rx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingSnapshot>> {
        self.rx.clone()
    }

    /// Re-read rules and shard records from the topology store.
    pub async fn refresh(&self) -> Result<Arc<RoutingSnapshot>> {
        let (rules, rules_version) = self.rules.read().await?;
        let mut keyspaces = BTreeMap::new();
        let mut shards = BTreeMap::new();
        for name in self.topo.list_keyspaces().await? {
            if let Some(record) = self.topo.get_keyspace(&name).await? {
                keyspaces.insert(name.clone(), record);
            }
            for partition in self.topo.list_shards(&name).await? {
                // Shard may be deleted between list and get
                match self.topo.get_shard(&partition).await {
                    Ok((record, _)) => {
                        shards.insert(partition, record);
                    }
                    Err(MigrationError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        crate::metrics::set_routing_rules(rules.len());
        let snapshot = Arc::new(RoutingSnapshot {
            rules,
            rules_version,
            keyspaces,
            shards,
            refreshed_at: chrono::Utc::now().timestamp_millis(),
        });
        self.tx.send_replace(Arc::clone(&snapshot));
        debug!(rules_version, "Routing view refreshed");
        Ok(snapshot)
    }

    /// Refresh periodically until `shutdown` flips to true.
    pub fn spawn_refresh(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let view = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = view.refresh().await {
                            warn!(error = %e, "Routing view refresh failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Routes queries and enforces write blacklists.
pub struct QueryRouter {
    view: RoutingView,
    resolver: Arc<dyn PartitionResolver>,
}

impl QueryRouter {
    pub fn new(view: RoutingView, resolver: Arc<dyn PartitionResolver>) -> Self {
        Self { view, resolver }
    }

    pub fn view(&self) -> &RoutingView {
        &self.view
    }

    /// Resolve a query target to a keyspace and table.
    pub fn route(&self, keyspace: Option<&str>, table: &str, class: TrafficClass) -> Result<RouteDecision> {
        let snapshot = self.view.snapshot();
        route_in(&snapshot, keyspace, table, class)
    }

    /// Shard of `keyspace` owning `keyspace_id`.
    ///
    /// Unsharded keyspaces (a single shard with no key range) ignore the id.
    pub fn shard_for(&self, keyspace: &str, keyspace_id: Option<u64>) -> Result<PartitionRef> {
        let snapshot = self.view.snapshot();
        shard_in(&snapshot, keyspace, keyspace_id)
    }

    /// Reject a write to a blacklisted table.
    pub fn check_write(&self, partition: &PartitionRef, class: TrafficClass, table: &str) -> Result<()> {
        let snapshot = self.view.snapshot();
        check_in(&snapshot, partition, class, table)
    }

    /// Route and execute one write transaction on the primary.
    ///
    /// Every change must land on the same shard. Returns the shard written.
    pub async fn execute_write(&self, keyspace: Option<&str>, changes: Vec<RowChange>) -> Result<PartitionRef> {
        let snapshot = self.view.snapshot();
        let mut target: Option<PartitionRef> = None;
        let mut routed = Vec::with_capacity(changes.len());

        for mut change in changes {
            let decision = route_in(&snapshot, keyspace, &change.table, TrafficClass::Primary)?;
            let keyspace_id = snapshot
                .keyspaces
                .get(&decision.keyspace)
                .and_then(|ks| ks.sharding_column.as_deref())
                .and_then(|col| change.row.column(col))
                .and_then(|v| v.as_u64().or_else(|| v.as_i64().map(|i| i as u64)));
            let partition = shard_in(&snapshot, &decision.keyspace, keyspace_id)?;
            check_in(&snapshot, &partition, TrafficClass::Primary, &decision.table)?;

            match &target {
                Some(existing) if existing != &partition => {
                    return Err(MigrationError::precondition(format!(
                        "transaction spans shards {} and {}",
                        existing, partition
                    )));
                }
                Some(_) => {}
                None => target = Some(partition),
            }
            change.table = decision.table;
            routed.push(change);
        }

        let partition = target.ok_or_else(|| MigrationError::precondition("empty transaction"))?;
        let backend = self
            .resolver
            .resolve(&partition)
            .ok_or_else(|| MigrationError::NotFound(format!("partition {}", partition)))?;
        backend
            .apply(routed)
            .await
            .map_err(|e| MigrationError::partition(&partition, e))?;
        Ok(partition)
    }
}

fn route_in(
    snapshot: &RoutingSnapshot,
    keyspace: Option<&str>,
    table: &str,
    class: TrafficClass,
) -> Result<RouteDecision> {
    match snapshot.rules.resolve(keyspace, table, class) {
        Resolution::Rule { key, targets } => {
            let first = targets.first().ok_or_else(|| {
                MigrationError::precondition(format!("routing rule {} has no targets", key))
            })?;
            let (ks, t) = split_target(first).ok_or_else(|| {
                MigrationError::precondition(format!("routing rule {} has malformed target {}", key, first))
            })?;
            Ok(RouteDecision {
                keyspace: ks.to_string(),
                table: t.to_string(),
                rule: Some(key),
            })
        }
        Resolution::Default => match keyspace {
            Some(ks) => Ok(RouteDecision {
                keyspace: ks.to_string(),
                table: table.to_string(),
                rule: None,
            }),
            None => Err(MigrationError::precondition(format!(
                "table {} not found: no routing rule and no keyspace given",
                table
            ))),
        },
    }
}

fn shard_in(snapshot: &RoutingSnapshot, keyspace: &str, keyspace_id: Option<u64>) -> Result<PartitionRef> {
    let shards: Vec<(&PartitionRef, &ShardRecord)> = snapshot
        .shards
        .iter()
        .filter(|(p, _)| p.keyspace == keyspace)
        .collect();

    if let [(partition, record)] = shards.as_slice() {
        if record.key_range.is_none() {
            return Ok((*partition).clone());
        }
    }

    let id = keyspace_id.ok_or_else(|| {
        MigrationError::precondition(format!("keyspace {} is sharded; a keyspace id is required", keyspace))
    })?;
    shards
        .into_iter()
        .find(|(_, record)| record.key_range.map_or(true, |r| r.contains(id)))
        .map(|(p, _)| p.clone())
        .ok_or_else(|| MigrationError::NotFound(format!("no shard of {} owns keyspace id {}", keyspace, id)))
}

fn check_in(snapshot: &RoutingSnapshot, partition: &PartitionRef, class: TrafficClass, table: &str) -> Result<()> {
    let blacklisted = snapshot
        .shards
        .get(partition)
        .map_or(false, |s| s.is_blacklisted(class, table));
    if blacklisted {
        crate::metrics::record_blacklist_rejection(&partition.to_string(), table);
        return Err(MigrationError::Blacklisted {
            table: table.to_string(),
            partition: partition.to_string(),
            class: class.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::{BlacklistChange, BlacklistStore};
    use crate::event::Row;
    use crate::filter::KeyRange;
    use crate::memory::{MemoryPartition, MemoryResolver};
    use crate::routing::{target, RuleKey};
    use crate::topo::MemoryTopo;

    struct Fixture {
        topo: Topology,
        router: QueryRouter,
        source: Arc<MemoryPartition>,
        dest: Arc<MemoryPartition>,
    }

    async fn fixture() -> Fixture {
        let topo = Topology::new(Arc::new(MemoryTopo::new()));
        topo.create_keyspace("source", None).await.unwrap();
        topo.create_keyspace("dest", None).await.unwrap();
        let src_ref = PartitionRef::new("source", "0");
        let dst_ref = PartitionRef::new("dest", "0");
        topo.create_shard(&src_ref, None).await.unwrap();
        topo.create_shard(&dst_ref, None).await.unwrap();

        let resolver = Arc::new(MemoryResolver::new());
        let source = resolver.register(src_ref, Arc::new(MemoryPartition::new()));
        let dest = resolver.register(dst_ref, Arc::new(MemoryPartition::new()));
        source.create_table("t").await;
        dest.create_table("t").await;

        let view = RoutingView::new(topo.clone());
        view.refresh().await.unwrap();
        Fixture {
            topo,
            router: QueryRouter::new(view, resolver),
            source,
            dest,
        }
    }

    #[tokio::test]
    async fn test_default_routing_to_own_keyspace() {
        let f = fixture().await;
        let d = f.router.route(Some("source"), "t", TrafficClass::Primary).unwrap();
        assert_eq!(d.keyspace, "source");
        assert_eq!(d.rule, None);
        assert!(f.router.route(None, "t", TrafficClass::Primary).is_err());
    }

    #[tokio::test]
    async fn test_rules_visible_after_refresh_only() {
        let f = fixture().await;
        let store = RoutingRuleStore::new(f.topo.clone());
        let mut rules = RoutingRules::new();
        rules.set(&RuleKey::unqualified("t"), vec![target("dest", "t")]);
        store.compare_and_swap(0, &rules).await.unwrap();

        // Stale until refreshed
        assert!(f.router.route(None, "t", TrafficClass::Replica).is_err());
        f.router.view().refresh().await.unwrap();
        let d = f.router.route(None, "t", TrafficClass::Replica).unwrap();
        assert_eq!(d.keyspace, "dest");
        assert_eq!(d.rule.as_deref(), Some("t"));
        assert_eq!(f.router.view().snapshot().rules_version, 1);
    }

    #[tokio::test]
    async fn test_execute_write_follows_routing() {
        let f = fixture().await;
        let written = f
            .router
            .execute_write(Some("source"), vec![RowChange::insert("t", Row::new(1))])
            .await
            .unwrap();
        assert_eq!(written, PartitionRef::new("source", "0"));
        assert_eq!(f.source.row_count("t").await, 1);
        assert_eq!(f.dest.row_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_blacklisted_write_rejected() {
        let f = fixture().await;
        let blacklists = BlacklistStore::new(f.topo.clone());
        blacklists
            .apply(&BlacklistChange::install(
                PartitionRef::new("source", "0"),
                TrafficClass::Primary,
                ["t".to_string()].into(),
            ))
            .await
            .unwrap();
        f.router.view().refresh().await.unwrap();

        let err = f
            .router
            .execute_write(Some("source"), vec![RowChange::insert("t", Row::new(1))])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disallowed: blacklisted"));
        assert_eq!(f.source.row_count("t").await, 0);

        // Other classes unaffected
        assert!(f
            .router
            .check_write(&PartitionRef::new("source", "0"), TrafficClass::Replica, "t")
            .is_ok());
    }

    #[tokio::test]
    async fn test_shard_for_sharded_keyspace() {
        let topo = Topology::new(Arc::new(MemoryTopo::new()));
        topo.create_keyspace("ks", Some("keyspace_id")).await.unwrap();
        let lo = PartitionRef::new("ks", "-80");
        let hi = PartitionRef::new("ks", "80-");
        topo.create_shard(&lo, Some(KeyRange::parse("-80").unwrap())).await.unwrap();
        topo.create_shard(&hi, Some(KeyRange::parse("80-").unwrap())).await.unwrap();

        let view = RoutingView::new(topo);
        view.refresh().await.unwrap();
        let router = QueryRouter::new(view, Arc::new(MemoryResolver::new()));

        assert_eq!(router.shard_for("ks", Some(1)).unwrap(), lo);
        assert_eq!(router.shard_for("ks", Some(u64::MAX)).unwrap(), hi);
        assert!(router.shard_for("ks", None).is_err());
        assert!(router.shard_for("nope", Some(1)).is_err());
    }

    #[tokio::test]
    async fn test_spawn_refresh_stops_on_shutdown() {
        let f = fixture().await;
        let (tx, rx) = watch::channel(false);
        let handle = f.router.view().spawn_refresh(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
