// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk copy phase of a replication stream.
//!
//! `prepare` pins the stream position at the source head and registers one
//! copy checkpoint per filtered table. `run` then copies every table whose
//! checkpoint is not complete: the destination table is truncated (it may
//! hold a partial earlier attempt), a consistent snapshot is read from the
//! source, filtered, and bulk loaded in chunks.
//!
//! Each snapshot is taken at or after the pinned position, so the tail that
//! follows may re-apply changes already present in the copy. Those replays
//! are idempotent row-image upserts and deletes.

use super::{transition, with_retry, StreamContext, StreamRuntime, StreamState};
use crate::error::{MigrationError, Result};
use crate::metrics;
use crate::partition::PartitionBackend;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info};

/// Init → Copying. Returns false if the stream was stopped meanwhile.
pub(crate) async fn prepare(
    ctx: &StreamContext,
    rt: &StreamRuntime,
    source: &dyn PartitionBackend,
) -> Result<bool> {
    let Some(head) = with_retry(ctx, rt, "head", &rt.source, false, || source.head()).await? else {
        return Ok(false);
    };

    ctx.store.save_position(rt.id, head).await?;
    ctx.store.init_copy(rt.id, rt.filter.tables()).await?;
    rt.update_status(|s| s.position = head);

    if rt.is_stopping() {
        return Ok(false);
    }
    transition(ctx, rt, StreamState::Copying, None).await?;
    info!(position = %head, tables = rt.filter.tables().len(), "Copy position pinned");
    Ok(true)
}

/// Copy every table without a completed checkpoint.
///
/// Returns false if the stream was stopped before finishing.
pub(crate) async fn run(
    ctx: &StreamContext,
    rt: &StreamRuntime,
    source: &dyn PartitionBackend,
    destination: &dyn PartitionBackend,
) -> Result<bool> {
    let pending = ctx.store.pending_copies(rt.id).await?;
    if pending.is_empty() {
        return Ok(true);
    }
    info!(tables = ?pending, "Resuming bulk copy");

    for table in pending {
        let Some(_permit) = copy_slot(ctx, rt).await? else {
            return Ok(false);
        };
        if !copy_table(ctx, rt, source, destination, &table).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Wait for a free copy slot, giving up when the stream is stopped.
async fn copy_slot(ctx: &StreamContext, rt: &StreamRuntime) -> Result<Option<OwnedSemaphorePermit>> {
    loop {
        if rt.is_stopping() {
            return Ok(None);
        }
        tokio::select! {
            permit = ctx.copy_bulkhead.acquire() => {
                return permit
                    .map(Some)
                    .map_err(|e| MigrationError::Internal(e.to_string()));
            }
            _ = rt.idle(ctx.settings.poll_interval_duration()) => {}
        }
    }
}

async fn copy_table(
    ctx: &StreamContext,
    rt: &StreamRuntime,
    source: &dyn PartitionBackend,
    destination: &dyn PartitionBackend,
    table: &str,
) -> Result<bool> {
    let started = Instant::now();

    if with_retry(ctx, rt, "truncate", &rt.destination, true, || destination.truncate(table))
        .await?
        .is_none()
    {
        return Ok(false);
    }

    let Some(snapshot) = with_retry(ctx, rt, "snapshot", &rt.source, false, || source.snapshot(table)).await?
    else {
        return Ok(false);
    };
    let rows = rt.filter.filter_rows(snapshot.rows);
    let total = rows.len();
    debug!(table, rows = total, snapshot_position = %snapshot.position, "Snapshot read");

    for chunk in rows.chunks(ctx.settings.copy_chunk_rows.max(1)) {
        ctx.throttle(rt.id, chunk.len()).await;
        let loaded = with_retry(ctx, rt, "bulk_load", &rt.destination, true, || {
            destination.bulk_load(table, chunk.to_vec())
        })
        .await?;
        if loaded.is_none() {
            return Ok(false);
        }
        metrics::record_rows_copied(rt.id.0, table, chunk.len());
    }

    ctx.store.mark_copied(rt.id, table).await?;
    metrics::record_table_copied(rt.id.0, table, started.elapsed());
    info!(table, rows = total, elapsed_ms = started.elapsed().as_millis() as u64, "Table copied");
    Ok(true)
}
