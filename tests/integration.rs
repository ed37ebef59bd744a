// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Keyspace Migrator
//!
//! Every test runs an in-memory cluster: memory partitions, a memory or
//! SQLite topology store, and a SQLite stream store in a temp directory.
//! No external services are required.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Run specific test
//! cargo test --test integration lifecycle
//! ```
//!
//! # Test Organization
//! - `lifecycle_*` - Full clone → cutover → reverse → finalize flows
//! - `router_*` - Query routing and write blacklists between phases
//! - `sharded_*` - Unsharded source into a multi-shard destination
//! - `sqlite_topo_*` - Same flows over the SQLite topology store

mod common;

use common::{eventually, strings, wait_for_rows, Cluster, EVENTUALLY};
use keyspace_migrator::{
    Direction, MigrationError, MigrationKey, PartitionRef, Phase, Row, RowChange, SqliteTopo,
    StreamState, TrafficClass,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SRC: &str = "commerce";
const DST: &str = "customer";
const TABLES: &[&str] = &["customer", "corder"];

fn key() -> MigrationKey {
    MigrationKey::new(SRC, DST)
}

fn customer(id: i64) -> Row {
    Row::new(id).with("email", format!("user{}@example.com", id))
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn lifecycle_rule_counts_through_every_phase() {
    let cluster = Cluster::new().await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let destination = cluster.add_keyspace(DST, None, &["0"], TABLES).await.remove(0);
    for id in 1..=3 {
        source.insert("customer", customer(id)).await.unwrap();
    }
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    assert_eq!(orch.routing_rules().await.unwrap().len(), 4);
    assert_eq!(destination.row_count("customer").await, 3);

    orch.cutover(&key(), TrafficClass::ReadOnly, false).await.unwrap();
    assert_eq!(orch.routing_rules().await.unwrap().len(), 10);

    orch.cutover(&key(), TrafficClass::Replica, false).await.unwrap();
    assert_eq!(orch.routing_rules().await.unwrap().len(), 16);

    orch.reverse(&key(), Phase::CutoverReplica).await.unwrap();
    assert_eq!(orch.routing_rules().await.unwrap().len(), 10);

    orch.cutover(&key(), TrafficClass::Replica, false).await.unwrap();
    assert_eq!(orch.routing_rules().await.unwrap().len(), 16);

    let record = orch.cutover(&key(), TrafficClass::Primary, false).await.unwrap();
    assert_eq!(orch.routing_rules().await.unwrap().len(), 4);
    assert_eq!(record.latest_phase(), Some(Phase::CutoverPrimary));
    assert!(record.reverse_streams.is_empty());

    orch.finalize(&key()).await.unwrap();
    assert!(orch.list().await.unwrap().is_empty());
    assert!(cluster.engine.list().await.is_empty());
    // Finalize leaves the flipped rules in place.
    assert_eq!(orch.routing_rules().await.unwrap().len(), 4);
}

#[tokio::test]
async fn lifecycle_concurrent_writes_converge_during_clone() {
    let cluster = Cluster::new().await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let destination = cluster.add_keyspace(DST, None, &["0"], TABLES).await.remove(0);
    for id in 1..=50 {
        source.insert("customer", customer(id)).await.unwrap();
    }

    let writer = {
        let source = source.clone();
        tokio::spawn(async move {
            for id in 51..=100 {
                source.insert("customer", customer(id)).await.unwrap();
                if id % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
            // Rewrites and removals after the copy must also land.
            source
                .execute(vec![RowChange::update("customer", customer(7).with("email", "changed"))])
                .await
                .unwrap();
            source.execute(vec![RowChange::delete("customer", 8)]).await.unwrap();
        })
    };

    cluster
        .orchestrator
        .clone_tables(&key(), &strings(TABLES))
        .await
        .unwrap();
    writer.await.unwrap();

    assert!(wait_for_rows(&destination, "customer", 99).await);
    let converged = eventually(EVENTUALLY, || async {
        destination.rows("customer").await == source.rows("customer").await
    })
    .await;
    assert!(converged, "destination did not converge to the source rows");
}

#[tokio::test]
async fn lifecycle_reverse_back_to_clone_restores_rules_exactly() {
    let cluster = Cluster::new().await;
    cluster.add_keyspace(SRC, None, &["0"], TABLES).await;
    cluster.add_keyspace(DST, None, &["0"], TABLES).await;
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    let after_clone = orch.routing_rules().await.unwrap();

    orch.cutover(&key(), TrafficClass::ReadOnly, false).await.unwrap();
    orch.cutover(&key(), TrafficClass::Replica, false).await.unwrap();
    orch.reverse(&key(), Phase::CutoverReplica).await.unwrap();
    orch.reverse(&key(), Phase::CutoverReadOnly).await.unwrap();

    assert_eq!(orch.routing_rules().await.unwrap(), after_clone);
    let status = orch.status(&key()).await.unwrap();
    assert_eq!(status.record.latest_phase(), Some(Phase::Clone));
    assert!(status.streams.iter().all(|s| s.state == StreamState::Running));
}

#[tokio::test]
async fn lifecycle_repeated_cutover_is_idempotent() {
    let cluster = Cluster::new().await;
    cluster.add_keyspace(SRC, None, &["0"], TABLES).await;
    cluster.add_keyspace(DST, None, &["0"], TABLES).await;
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    orch.cutover(&key(), TrafficClass::ReadOnly, false).await.unwrap();
    let rules = orch.routing_rules().await.unwrap();

    let record = orch.cutover(&key(), TrafficClass::ReadOnly, false).await.unwrap();
    assert_eq!(record.committed.len(), 2);
    assert_eq!(orch.routing_rules().await.unwrap(), rules);
}

#[tokio::test]
async fn lifecycle_primary_with_reverse_replication_and_reverse() {
    let cluster = Cluster::new().await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let destination = cluster.add_keyspace(DST, None, &["0"], TABLES).await.remove(0);
    source.insert("customer", customer(1)).await.unwrap();
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    orch.cutover(&key(), TrafficClass::ReadOnly, false).await.unwrap();
    orch.cutover(&key(), TrafficClass::Replica, false).await.unwrap();
    let record = orch.cutover(&key(), TrafficClass::Primary, true).await.unwrap();
    assert_eq!(record.direction, Direction::Reversed);
    assert_eq!(record.reverse_streams.len(), 1);

    let forward = cluster.engine.status(record.forward_streams[0]).await.unwrap();
    assert_eq!(forward.state, StreamState::Stopped);

    // Writes now land on the destination and flow back to the source.
    let router = cluster.router().await;
    let written = router
        .execute_write(None, vec![RowChange::insert("customer", customer(2))])
        .await
        .unwrap();
    assert_eq!(written, PartitionRef::new(DST, "0"));
    assert_eq!(destination.row_count("customer").await, 2);
    assert!(wait_for_rows(&source, "customer", 2).await);

    let record = orch.reverse(&key(), Phase::CutoverPrimary).await.unwrap();
    assert_eq!(record.direction, Direction::Forward);
    assert!(record.reverse_streams.is_empty());
    assert_eq!(orch.routing_rules().await.unwrap().len(), 16);

    // Forward replication is back.
    let forward = cluster.engine.status(record.forward_streams[0]).await.unwrap();
    assert!(forward.state.is_active());
    source.insert("customer", customer(3)).await.unwrap();
    assert!(wait_for_rows(&destination, "customer", 3).await);
}

#[tokio::test]
async fn lifecycle_cancel_after_clone_cleans_up() {
    let cluster = Cluster::new().await;
    cluster.add_keyspace(SRC, None, &["0"], TABLES).await;
    cluster.add_keyspace(DST, None, &["0"], TABLES).await;
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    orch.cancel(&key()).await.unwrap();

    assert!(orch.routing_rules().await.unwrap().is_empty());
    assert!(cluster.engine.list().await.is_empty());
    let err = orch.status(&key()).await.unwrap_err();
    assert!(matches!(err, MigrationError::NotFound(_)));

    let router = cluster.router().await;
    router
        .check_write(&PartitionRef::new(DST, "0"), TrafficClass::Primary, "customer")
        .unwrap();
}

// =============================================================================
// Router Tests
// =============================================================================

#[tokio::test]
async fn router_blacklists_follow_the_phases() {
    let cluster = Cluster::new().await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let destination = cluster.add_keyspace(DST, None, &["0"], TABLES).await.remove(0);
    let orch = &cluster.orchestrator;
    let src_primary = PartitionRef::new(SRC, "0");
    let dst_primary = PartitionRef::new(DST, "0");

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    let router = cluster.router().await;

    // Unqualified and destination-qualified names go to the source.
    let decision = router.route(None, "customer", TrafficClass::Primary).unwrap();
    assert_eq!(decision.keyspace, SRC);
    let decision = router.route(Some(DST), "corder", TrafficClass::ReadOnly).unwrap();
    assert_eq!(decision.keyspace, SRC);

    let err = router
        .check_write(&dst_primary, TrafficClass::Primary, "customer")
        .unwrap_err();
    assert!(err.to_string().contains("disallowed: blacklisted"), "{}", err);

    router
        .execute_write(None, vec![RowChange::insert("customer", customer(10))])
        .await
        .unwrap();
    assert!(wait_for_rows(&destination, "customer", 1).await);

    orch.cutover(&key(), TrafficClass::ReadOnly, false).await.unwrap();
    let router = cluster.router().await;
    assert_eq!(
        router.route(None, "customer", TrafficClass::ReadOnly).unwrap().keyspace,
        DST
    );
    assert_eq!(
        router.route(None, "customer", TrafficClass::Replica).unwrap().keyspace,
        SRC
    );

    orch.cutover(&key(), TrafficClass::Replica, false).await.unwrap();
    orch.cutover(&key(), TrafficClass::Primary, false).await.unwrap();
    let router = cluster.router().await;
    for class in TrafficClass::ALL {
        assert_eq!(router.route(Some(SRC), "customer", class).unwrap().keyspace, DST);
    }

    let err = router
        .check_write(&src_primary, TrafficClass::Primary, "customer")
        .unwrap_err();
    assert!(err.to_string().contains("disallowed: blacklisted"), "{}", err);
    router
        .check_write(&dst_primary, TrafficClass::Primary, "customer")
        .unwrap();

    router
        .execute_write(Some(SRC), vec![RowChange::insert("customer", customer(11))])
        .await
        .unwrap();
    assert_eq!(destination.row_count("customer").await, 2);
    assert_eq!(source.row_count("customer").await, 1);
}

#[tokio::test]
async fn router_unrelated_tables_keep_default_routing() {
    let cluster = Cluster::new().await;
    cluster.add_keyspace(SRC, None, &["0"], &["customer", "corder", "product"]).await;
    cluster.add_keyspace(DST, None, &["0"], TABLES).await;

    cluster
        .orchestrator
        .clone_tables(&key(), &strings(TABLES))
        .await
        .unwrap();
    let router = cluster.router().await;

    let decision = router.route(Some(SRC), "product", TrafficClass::Primary).unwrap();
    assert_eq!(decision.keyspace, SRC);
    assert!(decision.rule.is_none());
    assert!(router.route(None, "product", TrafficClass::Primary).is_err());
}

// =============================================================================
// Sharded Destination Tests
// =============================================================================

const HIGH: u64 = 1 << 63;

fn sharded_customer(id: i64, keyspace_id: u64) -> Row {
    customer(id).with("customer_id", keyspace_id)
}

#[tokio::test]
async fn sharded_clone_splits_rows_by_key_range() {
    let cluster = Cluster::new().await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let shards = cluster
        .add_keyspace(DST, Some("customer_id"), &["-80", "80-"], TABLES)
        .await;
    for id in 1..=10 {
        let keyspace_id = if id % 2 == 0 { HIGH + id as u64 } else { id as u64 };
        source.insert("customer", sharded_customer(id, keyspace_id)).await.unwrap();
    }

    let record = cluster
        .orchestrator
        .clone_tables(&key(), &strings(TABLES))
        .await
        .unwrap();
    assert_eq!(record.forward_streams.len(), 2);
    assert_eq!(shards[0].row_count("customer").await, 5);
    assert_eq!(shards[1].row_count("customer").await, 5);
    assert!(shards[1].rows("customer").await.iter().all(|r| r.id % 2 == 0));

    // A row that moves out of a shard's range is removed there.
    source
        .execute(vec![RowChange::update("customer", sharded_customer(1, HIGH + 1))])
        .await
        .unwrap();
    assert!(wait_for_rows(&shards[0], "customer", 4).await);
    assert!(wait_for_rows(&shards[1], "customer", 6).await);
}

#[tokio::test]
async fn sharded_primary_cutover_reverse_replicates_every_shard() {
    let cluster = Cluster::new().await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let shards = cluster
        .add_keyspace(DST, Some("customer_id"), &["-80", "80-"], TABLES)
        .await;
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    for class in TrafficClass::ALL {
        orch.cutover(&key(), class, true).await.unwrap();
    }
    let status = orch.status(&key()).await.unwrap();
    assert_eq!(status.record.reverse_streams.len(), 2);

    let router = cluster.router().await;
    let low = router
        .execute_write(None, vec![RowChange::insert("customer", sharded_customer(1, 5))])
        .await
        .unwrap();
    let high = router
        .execute_write(None, vec![RowChange::insert("customer", sharded_customer(2, HIGH + 5))])
        .await
        .unwrap();
    assert_eq!(low, PartitionRef::new(DST, "-80"));
    assert_eq!(high, PartitionRef::new(DST, "80-"));
    assert_eq!(shards[0].row_count("customer").await, 1);
    assert_eq!(shards[1].row_count("customer").await, 1);

    assert!(wait_for_rows(&source, "customer", 2).await);

    orch.finalize(&key()).await.unwrap();
    assert!(cluster.engine.list().await.is_empty());
}

#[tokio::test]
async fn sharded_destination_without_column_rejected() {
    let cluster = Cluster::new().await;
    cluster.add_keyspace(SRC, None, &["0"], TABLES).await;
    cluster.add_keyspace(DST, None, &["-80", "80-"], TABLES).await;

    let err = cluster
        .orchestrator
        .clone_tables(&key(), &strings(TABLES))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Precondition(_)));
    assert!(cluster.engine.list().await.is_empty());
}

// =============================================================================
// SQLite Topology Tests
// =============================================================================

async fn sqlite_cluster(dir: &TempDir) -> Cluster {
    let topo = SqliteTopo::new(dir.path().join("topo.db"), true).await.unwrap();
    Cluster::with_topo(Arc::new(topo)).await
}

#[tokio::test]
async fn sqlite_topo_full_lifecycle() {
    let topo_dir = TempDir::new().unwrap();
    let cluster = sqlite_cluster(&topo_dir).await;
    let source = cluster.add_keyspace(SRC, None, &["0"], TABLES).await.remove(0);
    let destination = cluster.add_keyspace(DST, None, &["0"], TABLES).await.remove(0);
    source.insert("corder", Row::new(1).with("sku", "SKU-1001")).await.unwrap();
    let orch = &cluster.orchestrator;

    orch.clone_tables(&key(), &strings(TABLES)).await.unwrap();
    assert_eq!(destination.row_count("corder").await, 1);
    let mut counts = vec![orch.routing_rules().await.unwrap().len()];
    for class in TrafficClass::ALL {
        orch.cutover(&key(), class, false).await.unwrap();
        counts.push(orch.routing_rules().await.unwrap().len());
    }
    assert_eq!(counts, vec![4, 10, 16, 4]);

    let listed = orch.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].tables, strings(TABLES));

    orch.finalize(&key()).await.unwrap();
    assert!(orch.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_topo_migration_survives_restart() {
    let topo_dir = TempDir::new().unwrap();
    {
        let cluster = sqlite_cluster(&topo_dir).await;
        cluster.add_keyspace(SRC, None, &["0"], TABLES).await;
        cluster.add_keyspace(DST, None, &["0"], TABLES).await;
        cluster
            .orchestrator
            .clone_tables(&key(), &strings(TABLES))
            .await
            .unwrap();
        cluster
            .orchestrator
            .cutover(&key(), TrafficClass::ReadOnly, false)
            .await
            .unwrap();
        cluster.engine.shutdown().await;
    }

    // Fresh topology handle on the same file sees the committed phases.
    let topo = SqliteTopo::new(topo_dir.path().join("topo.db"), true).await.unwrap();
    let reopened = Cluster::with_topo(Arc::new(topo)).await;
    assert_eq!(reopened.orchestrator.routing_rules().await.unwrap().len(), 10);
    let listed = reopened.orchestrator.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].latest_phase(), Some(Phase::CutoverReadOnly));
}
