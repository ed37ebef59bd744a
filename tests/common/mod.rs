// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory cluster: topology, partitions, stream engine, orchestrator
//! - Polling helpers for eventually-consistent assertions

#![allow(dead_code)]

use keyspace_migrator::{
    KeyRange, MemoryPartition, MemoryResolver, MemoryTopo, Orchestrator, OrchestratorSettings,
    PartitionRef, QueryRouter, RoutingView, StreamEngine, StreamSettings, StreamStore, TopoStore,
    Topology,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Default wait for eventually-consistent assertions.
pub const EVENTUALLY: Duration = Duration::from_secs(10);

/// Everything a migration test needs, backed by memory and a temp SQLite file.
pub struct Cluster {
    pub dir: TempDir,
    pub topo: Topology,
    pub resolver: Arc<MemoryResolver>,
    pub engine: Arc<StreamEngine>,
    pub orchestrator: Orchestrator,
}

impl Cluster {
    /// Cluster over an in-memory topology store.
    pub async fn new() -> Self {
        Self::with_topo(Arc::new(MemoryTopo::new())).await
    }

    /// Cluster over the given topology store.
    pub async fn with_topo(store: Arc<dyn TopoStore>) -> Self {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(MemoryResolver::new());
        let topo = Topology::new(store);
        let engine = open_engine(&dir.path().join("streams.db"), resolver.clone()).await;
        let orchestrator = Orchestrator::new(
            topo.clone(),
            engine.clone(),
            resolver.clone(),
            OrchestratorSettings::for_testing(),
        );
        Self {
            dir,
            topo,
            resolver,
            engine,
            orchestrator,
        }
    }

    pub fn stream_db(&self) -> PathBuf {
        self.dir.path().join("streams.db")
    }

    /// Create a keyspace and one memory partition per shard.
    ///
    /// Shard `"0"` is unsharded (no key range); any other name is parsed
    /// as a key range such as `-80` or `80-`.
    pub async fn add_keyspace(
        &self,
        name: &str,
        sharding_column: Option<&str>,
        shards: &[&str],
        tables: &[&str],
    ) -> Vec<Arc<MemoryPartition>> {
        self.topo.create_keyspace(name, sharding_column).await.unwrap();
        let mut partitions = Vec::new();
        for shard in shards {
            let partition = PartitionRef::new(name, *shard);
            let range = if *shard == "0" {
                None
            } else {
                Some(KeyRange::parse(shard).unwrap())
            };
            self.topo.create_shard(&partition, range).await.unwrap();

            let backend = self
                .resolver
                .register(partition, Arc::new(MemoryPartition::new()));
            for table in tables {
                backend.create_table(table).await;
            }
            partitions.push(backend);
        }
        partitions
    }

    /// A query router with a freshly loaded routing view.
    pub async fn router(&self) -> QueryRouter {
        let view = RoutingView::new(self.topo.clone());
        view.refresh().await.unwrap();
        QueryRouter::new(view, self.resolver.clone())
    }
}

/// Open a stream engine on `path` and recover its persisted streams.
pub async fn open_engine(path: &std::path::Path, resolver: Arc<MemoryResolver>) -> Arc<StreamEngine> {
    let store = Arc::new(StreamStore::new(path, true).await.unwrap());
    let engine = Arc::new(StreamEngine::new(store, resolver, StreamSettings::for_testing()));
    engine.recover().await.unwrap();
    engine
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `partition` holds exactly `expected` rows of `table`.
pub async fn wait_for_rows(partition: &MemoryPartition, table: &str, expected: usize) -> bool {
    eventually(EVENTUALLY, || async { partition.row_count(table).await == expected }).await
}
