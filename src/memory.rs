// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory reference partition backend.
//!
//! [`MemoryPartition`] keeps tables as ordered maps and records every applied
//! transaction in a gap-free log, which makes it a complete event source for
//! the stream engine. It also supports fault injection so retry and error
//! paths can be exercised without a real storage engine.
//!
//! # Example
//! ```rust,ignore
//! let source = MemoryPartition::new();
//! source.create_table("moving1").await;
//! source.insert("moving1", Row::new(1).with("msg", "hi")).await?;
//!
//! // Next two applies fail transiently, the third succeeds
//! source.inject_apply_faults(vec![PartitionError::Transient("lock wait".into()); 2]);
//! ```

use crate::event::{Row, RowChange, RowOp, Snapshot, SourceEvent};
use crate::partition::{
    BoxFuture, PartitionBackend, PartitionError, PartitionRef, PartitionResolver, PartitionResult,
};
use crate::position::Position;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    tables: BTreeMap<String, BTreeMap<i64, Row>>,
    log: Vec<SourceEvent>,
}

impl Inner {
    fn head(&self) -> Position {
        Position(self.log.len() as u64)
    }
}

/// In-memory partition with a mutation log.
#[derive(Default)]
pub struct MemoryPartition {
    inner: RwLock<Inner>,
    /// Faults returned by the next `apply` calls, front first.
    apply_faults: Mutex<VecDeque<PartitionError>>,
    /// Faults returned by the next `read_events` calls, front first.
    read_faults: Mutex<VecDeque<PartitionError>>,
    /// When set, every call fails with `Lost`.
    lost: AtomicBool,
    apply_calls: AtomicUsize,
}

impl MemoryPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table. No-op if it already exists.
    pub async fn create_table(&self, table: &str) {
        self.inner
            .write()
            .await
            .tables
            .entry(table.to_string())
            .or_default();
    }

    pub async fn has_table(&self, table: &str) -> bool {
        self.inner.read().await.tables.contains_key(table)
    }

    /// Client write: one insert as its own transaction.
    pub async fn insert(&self, table: &str, row: Row) -> PartitionResult<Position> {
        self.execute(vec![RowChange::insert(table, row)]).await
    }

    /// Client write: one transaction. Returns the event's position.
    pub async fn execute(&self, changes: Vec<RowChange>) -> PartitionResult<Position> {
        self.apply_inner(changes).await
    }

    /// Rows of a table ordered by primary key. Empty if the table is absent.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .read()
            .await
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.inner
            .read()
            .await
            .tables
            .get(table)
            .map_or(0, |t| t.len())
    }

    /// Position of the latest logged transaction, ignoring injected faults.
    pub async fn head_position(&self) -> Position {
        self.inner.read().await.head()
    }

    /// Queue faults for upcoming `apply` calls.
    pub fn inject_apply_faults(&self, faults: Vec<PartitionError>) {
        let mut queue = self.apply_faults.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(faults);
    }

    /// Queue faults for upcoming `read_events` calls.
    pub fn inject_read_faults(&self, faults: Vec<PartitionError>) {
        let mut queue = self.read_faults.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(faults);
    }

    /// Simulate losing (or regaining) the partition.
    pub fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::SeqCst);
    }

    /// Number of `apply` calls, including failed ones.
    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    fn check_lost(&self) -> PartitionResult<()> {
        if self.lost.load(Ordering::SeqCst) {
            Err(PartitionError::Lost("partition unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_fault(queue: &Mutex<VecDeque<PartitionError>>) -> Option<PartitionError> {
        queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    async fn apply_inner(&self, changes: Vec<RowChange>) -> PartitionResult<Position> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.check_lost()?;
        if let Some(fault) = Self::next_fault(&self.apply_faults) {
            return Err(fault);
        }

        let mut inner = self.inner.write().await;

        // Validate everything first so the transaction is all-or-nothing.
        for change in &changes {
            if !inner.tables.contains_key(&change.table) {
                return Err(PartitionError::Data(format!(
                    "table '{}' doesn't exist",
                    change.table
                )));
            }
        }

        for change in &changes {
            if let Some(table) = inner.tables.get_mut(&change.table) {
                match change.op {
                    RowOp::Insert | RowOp::Update => {
                        table.insert(change.row.id, change.row.clone());
                    }
                    RowOp::Delete => {
                        table.remove(&change.row.id);
                    }
                }
            }
        }

        let position = inner.head().next();
        inner.log.push(SourceEvent {
            position,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            changes,
        });
        Ok(position)
    }
}

impl PartitionBackend for MemoryPartition {
    fn head(&self) -> BoxFuture<'_, Position> {
        Box::pin(async move {
            self.check_lost()?;
            Ok(self.inner.read().await.head())
        })
    }

    fn read_events(&self, after: Position, max: usize) -> BoxFuture<'_, Vec<SourceEvent>> {
        Box::pin(async move {
            self.check_lost()?;
            if let Some(fault) = Self::next_fault(&self.read_faults) {
                return Err(fault);
            }
            let inner = self.inner.read().await;
            // Position p lives at index p - 1.
            let start = (after.sequence() as usize).min(inner.log.len());
            let end = start.saturating_add(max).min(inner.log.len());
            Ok(inner.log[start..end].to_vec())
        })
    }

    fn snapshot(&self, table: &str) -> BoxFuture<'_, Snapshot> {
        let table = table.to_string();
        Box::pin(async move {
            self.check_lost()?;
            let inner = self.inner.read().await;
            let rows = inner
                .tables
                .get(&table)
                .ok_or_else(|| PartitionError::Data(format!("table '{}' doesn't exist", table)))?
                .values()
                .cloned()
                .collect();
            Ok(Snapshot {
                position: inner.head(),
                rows,
            })
        })
    }

    fn apply(&self, changes: Vec<RowChange>) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.apply_inner(changes).await.map(|_| ()) })
    }

    fn bulk_load(&self, table: &str, rows: Vec<Row>) -> BoxFuture<'_, ()> {
        let table = table.to_string();
        Box::pin(async move {
            self.check_lost()?;
            let mut inner = self.inner.write().await;
            let target = inner
                .tables
                .get_mut(&table)
                .ok_or_else(|| PartitionError::Data(format!("table '{}' doesn't exist", table)))?;
            for row in rows {
                target.insert(row.id, row);
            }
            Ok(())
        })
    }

    fn truncate(&self, table: &str) -> BoxFuture<'_, ()> {
        let table = table.to_string();
        Box::pin(async move {
            self.check_lost()?;
            let mut inner = self.inner.write().await;
            if let Some(t) = inner.tables.get_mut(&table) {
                t.clear();
            }
            Ok(())
        })
    }
}

/// Resolver over a fixed set of in-memory partitions.
#[derive(Default)]
pub struct MemoryResolver {
    partitions: std::sync::RwLock<HashMap<PartitionRef, Arc<MemoryPartition>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition, returning the shared handle.
    pub fn register(&self, partition: PartitionRef, backend: Arc<MemoryPartition>) -> Arc<MemoryPartition> {
        let mut map = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        map.insert(partition, Arc::clone(&backend));
        backend
    }

    /// Typed lookup for tests and tooling.
    pub fn get(&self, partition: &PartitionRef) -> Option<Arc<MemoryPartition>> {
        let map = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        map.get(partition).cloned()
    }
}

impl PartitionResolver for MemoryResolver {
    fn resolve(&self, partition: &PartitionRef) -> Option<Arc<dyn PartitionBackend>> {
        self.get(partition).map(|p| p as Arc<dyn PartitionBackend>)
    }
}
