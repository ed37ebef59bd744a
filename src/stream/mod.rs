// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication stream engine.
//!
//! Each stream moves the filtered tables of one source partition into one
//! destination partition: a resumable bulk copy followed by an ordered tail
//! of the source mutation log. One long-lived tokio task drives each stream;
//! independent streams run in parallel.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            StreamEngine                              │
//! │                                                                      │
//! │  start() ──► StreamStore (Init) ──► spawn task ─┐                    │
//! │                                                 ▼                    │
//! │                 ┌─────────── stream task (one per stream) ─────────┐ │
//! │                 │ copy::prepare   head → position, copy_state rows │ │
//! │                 │ copy::run       truncate, snapshot, bulk_load    │ │
//! │                 │ tail::run       read → filter → apply → persist  │ │
//! │                 └──────────────────────────────────────────────────┘ │
//! │                                                                      │
//! │  stop()   ── flag + wake ── apply gate ── join ── persist Stopped    │
//! │  status() ── watch::Receiver borrow (never blocks on the task)       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Stop Guarantee
//!
//! Every destination mutation (truncate, bulk load, transaction apply) runs
//! while holding the stream's apply gate, and the stop flag is checked under
//! the gate first. `stop()` raises the flag, waits for the gate (so an
//! in-flight apply finishes), joins the task, then persists `Stopped`. Once it
//! returns nothing more reaches the destination.
//!
//! # Replay Safety
//!
//! The position is persisted after each applied batch, so a crash can replay
//! transactions that already landed. Changes carry full row images and are
//! applied as upserts and deletes by primary key, which makes replay a no-op.

pub mod copy;
pub mod tail;
pub mod types;

pub use types::{StreamId, StreamRecord, StreamState, StreamStatus};

use crate::config::StreamSettings;
use crate::error::{MigrationError, Result};
use crate::filter::{Filter, FilterSpec};
use crate::metrics;
use crate::partition::{PartitionBackend, PartitionError, PartitionRef, PartitionResolver, PartitionResult};
use crate::position::Position;
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::stream_store::StreamStore;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Shared dependencies handed to every stream task.
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub store: Arc<StreamStore>,
    pub resolver: Arc<dyn PartitionResolver>,
    pub settings: StreamSettings,
    pub retry: RetryConfig,
    pub copy_bulkhead: Arc<Bulkhead>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl StreamContext {
    fn backend(&self, partition: &PartitionRef) -> Result<Arc<dyn PartitionBackend>> {
        self.resolver.resolve(partition).ok_or_else(|| {
            MigrationError::partition(
                partition,
                PartitionError::Lost("no backend registered".to_string()),
            )
        })
    }

    /// Wait for throttle tokens covering `rows` rows.
    pub(crate) async fn throttle(&self, id: StreamId, rows: usize) {
        if let Some(limiter) = &self.rate_limiter {
            let started = Instant::now();
            limiter.acquire_many(u32::try_from(rows).unwrap_or(u32::MAX)).await;
            metrics::record_throttle_wait(id.0, started.elapsed());
        }
    }
}

/// In-process side of one stream: identity, stop signalling, live status.
pub(crate) struct StreamRuntime {
    pub id: StreamId,
    pub source: PartitionRef,
    pub destination: PartitionRef,
    pub filter: Filter,
    stop: AtomicBool,
    /// Held for the duration of every destination mutation.
    pub gate: Mutex<()>,
    wake: Notify,
    status: watch::Sender<StreamStatus>,
}

impl StreamRuntime {
    fn new(record: &StreamRecord, filter: Filter) -> Self {
        let (status, _) = watch::channel(StreamStatus {
            id: record.id,
            state: record.state,
            position: record.position,
            lag_ms: 0,
            message: record.message.clone(),
        });
        Self {
            id: record.id,
            source: record.source.clone(),
            destination: record.destination.clone(),
            filter,
            stop: AtomicBool::new(false),
            gate: Mutex::new(()),
            wake: Notify::new(),
            status,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn position(&self) -> Position {
        self.status.borrow().position
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut StreamStatus)) {
        self.status.send_modify(f);
    }

    /// Sleep for `duration` or until woken. Returns false when stopping.
    pub(crate) async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
        !self.is_stopping()
    }
}

/// Persist a state transition and publish it.
pub(crate) async fn transition(
    ctx: &StreamContext,
    rt: &StreamRuntime,
    state: StreamState,
    message: Option<&str>,
) -> Result<()> {
    ctx.store.set_state(rt.id, state, message).await?;
    rt.update_status(|s| {
        s.state = state;
        s.message = message.map(str::to_string);
    });
    metrics::record_stream_state(rt.id.0, &state.to_string());
    info!(state = %state, "Stream state changed");
    Ok(())
}

/// Run a partition operation with the stream's retry budget.
///
/// Transient faults are retried with exponential backoff; anything else, or
/// an exhausted budget, is returned as an error. With `gated` set, each
/// attempt holds the apply gate and is skipped once a stop is requested.
/// Returns `Ok(None)` when the stream was asked to stop.
pub(crate) async fn with_retry<T, F, Fut>(
    ctx: &StreamContext,
    rt: &StreamRuntime,
    operation: &'static str,
    partition: &PartitionRef,
    gated: bool,
    mut op: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PartitionResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let result = if gated {
            let _gate = rt.gate.lock().await;
            if rt.is_stopping() {
                return Ok(None);
            }
            op().await
        } else {
            if rt.is_stopping() {
                return Ok(None);
            }
            op().await
        };

        match result {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_transient() && ctx.retry.should_retry(attempt) => {
                let delay = ctx.retry.delay_for_attempt(attempt);
                warn!(
                    operation,
                    partition = %partition,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient partition fault, retrying"
                );
                metrics::record_stream_retry(rt.id.0, operation);
                if !rt.idle(delay).await {
                    return Ok(None);
                }
            }
            Err(e) if e.is_transient() => {
                return Err(MigrationError::StreamFailed {
                    stream_id: rt.id.0,
                    message: format!(
                        "{} on {} failed after {} attempts: {}",
                        operation, partition, attempt, e
                    ),
                });
            }
            Err(e) => return Err(MigrationError::partition(partition, e)),
        }
    }
}

/// Body of a stream task.
async fn run_stream(ctx: StreamContext, rt: Arc<StreamRuntime>, state: StreamState) {
    let span = info_span!(
        "stream",
        stream_id = %rt.id,
        source = %rt.source,
        destination = %rt.destination
    );

    async move {
        debug!(state = %state, filter = %rt.filter, "Stream task starting");
        match drive(&ctx, &rt, state).await {
            Ok(()) => debug!("Stream task exiting"),
            Err(e) if rt.is_stopping() => {
                debug!(error = %e, "Stream task exiting after stop request");
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, class = %e.class(), "Stream failed");
                if let Err(persist_err) = transition(&ctx, &rt, StreamState::Error, Some(&message)).await {
                    error!(error = %persist_err, "Failed to persist stream error state");
                    rt.update_status(|s| {
                        s.state = StreamState::Error;
                        s.message = Some(message);
                    });
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn drive(ctx: &StreamContext, rt: &StreamRuntime, state: StreamState) -> Result<()> {
    let source = ctx.backend(&rt.source)?;
    let destination = ctx.backend(&rt.destination)?;

    let mut state = state;
    if state == StreamState::Init {
        if !copy::prepare(ctx, rt, source.as_ref()).await? {
            return Ok(());
        }
        state = StreamState::Copying;
    }
    if state == StreamState::Copying && !copy::run(ctx, rt, source.as_ref(), destination.as_ref()).await? {
        return Ok(());
    }
    tail::run(ctx, rt, source.as_ref(), destination.as_ref(), state).await
}

struct StreamEntry {
    runtime: Arc<StreamRuntime>,
    task: Option<JoinHandle<()>>,
}

/// Owns every replication stream of one stream store.
pub struct StreamEngine {
    ctx: StreamContext,
    streams: RwLock<HashMap<StreamId, StreamEntry>>,
}

impl StreamEngine {
    pub fn new(
        store: Arc<StreamStore>,
        resolver: Arc<dyn PartitionResolver>,
        settings: StreamSettings,
    ) -> Self {
        let rate_limiter = settings
            .rate_limit_config()
            .map(|c| Arc::new(RateLimiter::new(c)));
        let ctx = StreamContext {
            store,
            resolver,
            retry: settings.retry_config(),
            copy_bulkhead: Arc::new(Bulkhead::new(settings.max_concurrent_copies.max(1))),
            rate_limiter,
            settings,
        };
        Self {
            ctx,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<StreamStore> {
        &self.ctx.store
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.ctx.settings
    }

    /// Reload persisted streams after a restart.
    ///
    /// Init, Copying and Running streams are respawned; Stopped and Error
    /// streams are registered for status only. Returns the number respawned.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.ctx.store.list().await?;
        let mut streams = self.streams.write().await;
        let mut respawned = 0;

        for record in records {
            if streams.contains_key(&record.id) {
                continue;
            }
            let filter = match Filter::compile(&record.filter) {
                Ok(f) => f,
                Err(e) => {
                    warn!(stream_id = %record.id, error = %e, "Skipping stream with invalid filter");
                    continue;
                }
            };
            let runtime = Arc::new(StreamRuntime::new(&record, filter));
            let task = if record.state.is_active() {
                respawned += 1;
                Some(self.spawn(&runtime, record.state))
            } else {
                None
            };
            streams.insert(record.id, StreamEntry { runtime, task });
        }

        info!(respawned, total = streams.len(), "Stream engine recovered");
        metrics::set_active_streams(active_task_count(&streams));
        Ok(respawned)
    }

    /// Create a stream and start consuming in the background.
    ///
    /// Without `start_position` the filtered tables are bulk copied first;
    /// with it the copy is skipped and tailing starts after that position.
    pub async fn start(
        &self,
        source: PartitionRef,
        destination: PartitionRef,
        filter: FilterSpec,
        start_position: Option<Position>,
    ) -> Result<StreamId> {
        let filter = Filter::compile(&filter)?;
        if source == destination {
            return Err(MigrationError::precondition(format!(
                "stream source and destination are both {}",
                source
            )));
        }
        for partition in [&source, &destination] {
            if self.ctx.resolver.resolve(partition).is_none() {
                return Err(MigrationError::precondition(format!(
                    "no backend for partition {}",
                    partition
                )));
            }
        }

        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.values().find(|e| {
            e.runtime.destination == destination
                && e.runtime.filter == filter
                && e.runtime.status().state.is_active()
        }) {
            return Err(MigrationError::precondition(format!(
                "stream {} already replicates [{}] into {}",
                existing.runtime.id, filter, destination
            )));
        }

        let (state, position) = match start_position {
            Some(p) => (StreamState::Copying, p),
            None => (StreamState::Init, Position::START),
        };
        let id = self
            .ctx
            .store
            .create(&source, &destination, filter.spec(), position, state)
            .await?;
        if start_position.is_some() {
            // Nothing to copy: register every table as already copied.
            self.ctx.store.init_copy(id, filter.tables()).await?;
            for table in filter.tables() {
                self.ctx.store.mark_copied(id, table).await?;
            }
        }

        let record = StreamRecord {
            id,
            source,
            destination,
            filter: filter.spec().clone(),
            position,
            state,
            message: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let runtime = Arc::new(StreamRuntime::new(&record, filter));
        let task = self.spawn(&runtime, state);
        streams.insert(id, StreamEntry { runtime, task: Some(task) });

        info!(
            stream_id = %id,
            source = %record.source,
            destination = %record.destination,
            position = %position,
            copy = start_position.is_none(),
            "Stream started"
        );
        metrics::record_stream_state(id.0, &state.to_string());
        metrics::set_active_streams(active_task_count(&streams));
        Ok(id)
    }

    fn spawn(&self, runtime: &Arc<StreamRuntime>, state: StreamState) -> JoinHandle<()> {
        tokio::spawn(run_stream(self.ctx.clone(), Arc::clone(runtime), state))
    }

    /// Signal the task, wait for any in-flight apply and join it.
    async fn halt(&self, id: StreamId) -> Result<Arc<StreamRuntime>> {
        let (runtime, task) = {
            let mut streams = self.streams.write().await;
            let entry = streams
                .get_mut(&id)
                .ok_or_else(|| MigrationError::NotFound(format!("stream {}", id)))?;
            (Arc::clone(&entry.runtime), entry.task.take())
        };

        runtime.request_stop();
        drop(runtime.gate.lock().await);
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(stream_id = %id, error = %e, "Stream task ended abnormally");
            }
        }
        Ok(runtime)
    }

    /// Stop a stream. No destination mutation happens after this returns.
    ///
    /// Stopping a stream that is already Stopped or in Error is a no-op.
    pub async fn stop(&self, id: StreamId) -> Result<()> {
        let state = self.status(id).await?.state;
        if !state.is_active() {
            debug!(stream_id = %id, state = %state, "Stop on inactive stream ignored");
            return Ok(());
        }

        let runtime = self.halt(id).await?;
        // The task may have failed on its own while being stopped.
        if runtime.status().state == StreamState::Error {
            return Ok(());
        }
        transition(&self.ctx, &runtime, StreamState::Stopped, None).await?;
        info!(stream_id = %id, position = %runtime.position(), "Stream stopped");
        metrics::set_active_streams(active_task_count(&*self.streams.read().await));
        Ok(())
    }

    /// Resume a Stopped stream, or retry one that is in Error.
    ///
    /// Resuming an active stream is a no-op.
    pub async fn resume(&self, id: StreamId) -> Result<()> {
        let state = self.status(id).await?.state;
        if state.is_active() {
            return Ok(());
        }

        let next = if self.ctx.store.has_copy_state(id).await? {
            StreamState::Copying
        } else {
            StreamState::Init
        };

        let mut streams = self.streams.write().await;
        let entry = streams
            .get_mut(&id)
            .ok_or_else(|| MigrationError::NotFound(format!("stream {}", id)))?;
        if let Some(task) = entry.task.take() {
            // A failed stream's task has already returned.
            if let Err(e) = task.await {
                warn!(stream_id = %id, error = %e, "Previous stream task ended abnormally");
            }
        }

        let runtime = Arc::clone(&entry.runtime);
        runtime.stop.store(false, Ordering::SeqCst);
        transition(&self.ctx, &runtime, next, None).await?;
        entry.task = Some(self.spawn(&runtime, next));

        info!(stream_id = %id, from = %state, to = %next, "Stream resumed");
        metrics::set_active_streams(active_task_count(&streams));
        Ok(())
    }

    /// Current status. Never waits on the stream task.
    pub async fn status(&self, id: StreamId) -> Result<StreamStatus> {
        self.streams
            .read()
            .await
            .get(&id)
            .map(|e| e.runtime.status())
            .ok_or_else(|| MigrationError::NotFound(format!("stream {}", id)))
    }

    /// Watch a stream's status.
    pub async fn subscribe(&self, id: StreamId) -> Result<watch::Receiver<StreamStatus>> {
        self.streams
            .read()
            .await
            .get(&id)
            .map(|e| e.runtime.status.subscribe())
            .ok_or_else(|| MigrationError::NotFound(format!("stream {}", id)))
    }

    /// Status of every registered stream, ordered by id.
    pub async fn list(&self) -> Vec<StreamStatus> {
        let mut all: Vec<StreamStatus> = self
            .streams
            .read()
            .await
            .values()
            .map(|e| e.runtime.status())
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Persisted record of a stream.
    pub async fn record(&self, id: StreamId) -> Result<StreamRecord> {
        self.ctx
            .store
            .get(id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("stream {}", id)))
    }

    /// Stop a stream if needed and delete its record and copy checkpoints.
    pub async fn remove(&self, id: StreamId) -> Result<()> {
        let registered = self.streams.read().await.contains_key(&id);
        if registered {
            self.halt(id).await?;
            self.streams.write().await.remove(&id);
        } else if self.ctx.store.get(id).await?.is_none() {
            return Err(MigrationError::NotFound(format!("stream {}", id)));
        }
        self.ctx.store.delete(id).await?;
        info!(stream_id = %id, "Stream removed");
        metrics::set_active_streams(active_task_count(&*self.streams.read().await));
        Ok(())
    }

    /// Wait until every stream is Running with lag at most `max_lag`.
    ///
    /// A stream in Error aborts the wait immediately.
    pub async fn wait_for_running(
        &self,
        ids: &[StreamId],
        max_lag: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let poll = self.ctx.settings.poll_interval_duration();
        loop {
            let mut ready = true;
            for id in ids {
                let status = self.status(*id).await?;
                match status.state {
                    StreamState::Error => return Err(stream_failed(&status)),
                    StreamState::Running if Duration::from_millis(status.lag_ms) <= max_lag => {}
                    _ => ready = false,
                }
            }
            if ready {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(MigrationError::Timeout {
                    what: format!("streams {} to reach Running", join_ids(ids)),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Wait until a stream has applied everything up to `position`.
    pub async fn wait_for_position(
        &self,
        id: StreamId,
        position: Position,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let poll = self.ctx.settings.poll_interval_duration();
        loop {
            let status = self.status(id).await?;
            if status.state == StreamState::Error {
                return Err(stream_failed(&status));
            }
            if status.position >= position {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(MigrationError::Timeout {
                    what: format!("stream {} to reach position {}", id, position),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop every task without changing persisted states.
    ///
    /// Active streams pick up where they left off on the next `recover()`.
    pub async fn shutdown(&self) {
        let entries: Vec<(Arc<StreamRuntime>, Option<JoinHandle<()>>)> = {
            let mut streams = self.streams.write().await;
            streams
                .values_mut()
                .map(|e| (Arc::clone(&e.runtime), e.task.take()))
                .collect()
        };

        info!(streams = entries.len(), "Shutting down stream engine");
        for (runtime, _) in &entries {
            runtime.request_stop();
        }
        let joins = entries.into_iter().filter_map(|(runtime, task)| {
            task.map(|task| async move {
                if let Err(e) = task.await {
                    warn!(stream_id = %runtime.id, error = %e, "Stream task ended abnormally");
                }
            })
        });
        join_all(joins).await;
        metrics::set_active_streams(0);
    }
}

fn active_task_count(streams: &HashMap<StreamId, StreamEntry>) -> usize {
    streams
        .values()
        .filter(|e| e.task.as_ref().is_some_and(|t| !t.is_finished()))
        .count()
}

fn stream_failed(status: &StreamStatus) -> MigrationError {
    MigrationError::StreamFailed {
        stream_id: status.id.0,
        message: status
            .message
            .clone()
            .unwrap_or_else(|| "stream in Error".to_string()),
    }
}

fn join_ids(ids: &[StreamId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Row;
    use crate::filter::KeyRange;
    use crate::memory::{MemoryPartition, MemoryResolver};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: Arc<MemoryPartition>,
        destination: Arc<MemoryPartition>,
        engine: StreamEngine,
        store: Arc<StreamStore>,
        resolver: Arc<MemoryResolver>,
    }

    fn src() -> PartitionRef {
        PartitionRef::new("source_keyspace", "0")
    }

    fn dst() -> PartitionRef {
        PartitionRef::new("destination_keyspace", "0")
    }

    fn spec() -> FilterSpec {
        FilterSpec::new("source_keyspace", ["moving1"])
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            StreamStore::new(dir.path().join("streams.db"), true)
                .await
                .unwrap(),
        );
        let resolver = Arc::new(MemoryResolver::new());
        let source = resolver.register(src(), Arc::new(MemoryPartition::new()));
        let destination = resolver.register(dst(), Arc::new(MemoryPartition::new()));
        source.create_table("moving1").await;
        source.create_table("staying1").await;
        destination.create_table("moving1").await;

        let engine = StreamEngine::new(
            Arc::clone(&store),
            resolver.clone(),
            StreamSettings::for_testing(),
        );
        Fixture {
            _dir: dir,
            source,
            destination,
            engine,
            store,
            resolver,
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    async fn catch_up(f: &Fixture, id: StreamId) {
        let head = f.source.head().await.unwrap();
        f.engine.wait_for_position(id, head, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_then_tail() {
        let f = fixture().await;
        for i in 1..=40 {
            f.source.insert("moving1", Row::new(i).with("msg", format!("row {}", i))).await.unwrap();
        }

        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        f.engine.wait_for_running(&[id], Duration::from_secs(60), WAIT).await.unwrap();
        assert_eq!(f.destination.row_count("moving1").await, 40);

        for i in 41..=50 {
            f.source.insert("moving1", Row::new(i)).await.unwrap();
        }
        f.source.insert("staying1", Row::new(1)).await.unwrap();
        catch_up(&f, id).await;

        assert_eq!(f.destination.rows("moving1").await, f.source.rows("moving1").await);
        assert!(!f.destination.has_table("staying1").await);
        assert_eq!(f.store.pending_copies(id).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_duplicate_active_stream_rejected() {
        let f = fixture().await;
        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        let err = f.engine.start(src(), dst(), spec(), None).await.unwrap_err();
        assert!(matches!(err, MigrationError::Precondition(_)));

        // Once stopped, the same filter may be started again.
        f.engine.stop(id).await.unwrap();
        assert!(f.engine.start(src(), dst(), spec(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_partition() {
        let f = fixture().await;
        let err = f
            .engine
            .start(src(), PartitionRef::new("nowhere", "0"), spec(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Precondition(_)));
        assert!(f.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_position_skips_copy() {
        let f = fixture().await;
        f.source.insert("moving1", Row::new(1)).await.unwrap();
        let head = f.source.head().await.unwrap();

        let id = f.engine.start(src(), dst(), spec(), Some(head)).await.unwrap();
        f.source.insert("moving1", Row::new(2)).await.unwrap();
        catch_up(&f, id).await;

        let ids: Vec<i64> = f.destination.rows("moving1").await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_stop_blocks_further_applies_and_resume_catches_up() {
        let f = fixture().await;
        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        f.engine.wait_for_running(&[id], Duration::from_secs(60), WAIT).await.unwrap();

        f.engine.stop(id).await.unwrap();
        let calls = f.destination.apply_calls();
        for i in 1..=5 {
            f.source.insert("moving1", Row::new(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.destination.apply_calls(), calls);
        assert_eq!(f.destination.row_count("moving1").await, 0);
        assert_eq!(f.engine.record(id).await.unwrap().state, StreamState::Stopped);

        f.engine.resume(id).await.unwrap();
        catch_up(&f, id).await;
        assert_eq!(f.destination.row_count("moving1").await, 5);
    }

    #[tokio::test]
    async fn test_row_predicate_limits_copied_and_tailed_rows() {
        let f = fixture().await;
        let spec = spec().with_predicate("id", KeyRange::new(0, Some(10)));
        for i in [1, 5, 20] {
            f.source.insert("moving1", Row::new(i)).await.unwrap();
        }

        let id = f.engine.start(src(), dst(), spec, None).await.unwrap();
        f.engine.wait_for_running(&[id], Duration::from_secs(60), WAIT).await.unwrap();
        f.source.insert("moving1", Row::new(7)).await.unwrap();
        f.source.insert("moving1", Row::new(30)).await.unwrap();
        catch_up(&f, id).await;

        let ids: Vec<i64> = f.destination.rows("moving1").await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 5, 7]);
    }

    #[tokio::test]
    async fn test_data_error_moves_stream_to_error() {
        let f = fixture().await;
        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        f.engine.wait_for_running(&[id], Duration::from_secs(60), WAIT).await.unwrap();

        f.destination
            .inject_apply_faults(vec![PartitionError::Data("duplicate key".into())]);
        f.source.insert("moving1", Row::new(1)).await.unwrap();

        let head = f.source.head().await.unwrap();
        let err = f.engine.wait_for_position(id, head, WAIT).await.unwrap_err();
        assert!(matches!(err, MigrationError::StreamFailed { .. }));

        let status = f.engine.status(id).await.unwrap();
        assert_eq!(status.state, StreamState::Error);
        assert!(status.message.unwrap().contains("duplicate key"));
        assert_eq!(f.engine.record(id).await.unwrap().state, StreamState::Error);
    }

    #[tokio::test]
    async fn test_remove_deletes_record() {
        let f = fixture().await;
        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        f.engine.remove(id).await.unwrap();

        assert!(f.engine.status(id).await.is_err());
        assert!(f.store.get(id).await.unwrap().is_none());
        assert!(matches!(
            f.engine.remove(id).await.unwrap_err(),
            MigrationError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_recover_respawns_active_streams_only() {
        let f = fixture().await;
        f.destination.create_table("staying1").await;
        let running = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        let stopped = f
            .engine
            .start(src(), dst(), FilterSpec::new("source_keyspace", ["staying1"]), None)
            .await
            .unwrap();
        f.engine.wait_for_running(&[running], Duration::from_secs(60), WAIT).await.unwrap();
        f.engine.stop(stopped).await.unwrap();
        f.engine.shutdown().await;

        let engine = StreamEngine::new(
            Arc::clone(&f.store),
            f.resolver.clone(),
            StreamSettings::for_testing(),
        );
        assert_eq!(engine.recover().await.unwrap(), 1);
        assert_eq!(engine.status(stopped).await.unwrap().state, StreamState::Stopped);

        f.source.insert("moving1", Row::new(9)).await.unwrap();
        let head = f.source.head().await.unwrap();
        engine.wait_for_position(running, head, WAIT).await.unwrap();
        assert_eq!(f.destination.row_count("moving1").await, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_running_times_out_on_stopped_stream() {
        let f = fixture().await;
        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        f.engine.stop(id).await.unwrap();

        let err = f
            .engine
            .wait_for_running(&[id], Duration::from_secs(60), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_sees_running() {
        let f = fixture().await;
        let id = f.engine.start(src(), dst(), spec(), None).await.unwrap();
        let mut rx = f.engine.subscribe(id).await.unwrap();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == StreamState::Running))
            .await
            .unwrap()
            .unwrap();
    }
}
