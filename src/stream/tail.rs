// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Continuous tail of the source mutation log.
//!
//! Each iteration:
//! 1. Reads up to `batch_size` events after the current position
//! 2. Filters every event down to the stream's tables and rows
//! 3. Applies each non-empty event as one destination transaction, in order
//! 4. Persists the position of the last event in the batch
//!
//! Events that filter to nothing still advance the position. The first
//! iteration that completes moves a Copying stream to Running.
//!
//! # Lag
//!
//! A read that returns fewer than `batch_size` events reached the source
//! head, so lag is reported as zero. Otherwise lag is the age of the last
//! applied event's source commit.

use super::{transition, with_retry, StreamContext, StreamRuntime, StreamState};
use crate::error::Result;
use crate::metrics;
use crate::partition::PartitionBackend;
use crate::position::{lag_ms, Position};
use std::time::Instant;
use tracing::{debug, info};

/// Tail until the stream is stopped or fails.
pub(crate) async fn run(
    ctx: &StreamContext,
    rt: &StreamRuntime,
    source: &dyn PartitionBackend,
    destination: &dyn PartitionBackend,
    mut state: StreamState,
) -> Result<()> {
    let batch_size = ctx.settings.batch_size.max(1);
    let poll_interval = ctx.settings.poll_interval_duration();
    let mut position = rt.position();
    info!(position = %position, "Tailing source");

    loop {
        let Some(events) = with_retry(ctx, rt, "read_events", &rt.source, false, || {
            source.read_events(position, batch_size)
        })
        .await?
        else {
            return Ok(());
        };

        let caught_up = events.len() < batch_size;
        let mut last_timestamp = None;
        let mut applied = 0usize;

        if !events.is_empty() {
            metrics::record_events_read(rt.id.0, events.len());
        }

        for event in &events {
            let changes = rt.filter.apply(event);
            if !changes.is_empty() {
                let rows = changes.len();
                ctx.throttle(rt.id, rows).await;

                let started = Instant::now();
                let done = with_retry(ctx, rt, "apply", &rt.destination, true, || {
                    destination.apply(changes.clone())
                })
                .await?;
                if done.is_none() {
                    // Stopped mid-batch: keep what already landed.
                    checkpoint(ctx, rt, position).await?;
                    return Ok(());
                }

                metrics::record_apply_latency(rt.id.0, started.elapsed());
                metrics::record_rows_applied(rt.id.0, rows);
                applied += 1;
            }
            position = event.position;
            last_timestamp = Some(event.timestamp_ms);
        }

        if !events.is_empty() {
            checkpoint(ctx, rt, position).await?;
            metrics::record_transactions_applied(rt.id.0, applied);
            debug!(
                events = events.len(),
                transactions = applied,
                position = %position,
                "Batch applied"
            );
        }

        let lag = match last_timestamp {
            Some(ts) if !caught_up => lag_ms(ts, chrono::Utc::now().timestamp_millis()),
            _ => 0,
        };
        rt.update_status(|s| s.lag_ms = lag);
        metrics::set_stream_lag_ms(rt.id.0, lag);
        if !caught_up {
            if let Ok(head) = source.head().await {
                metrics::set_stream_lag_events(rt.id.0, position.events_behind(head));
            }
        } else {
            metrics::set_stream_lag_events(rt.id.0, 0);
        }

        if state == StreamState::Copying {
            if rt.is_stopping() {
                return Ok(());
            }
            transition(ctx, rt, StreamState::Running, None).await?;
            state = StreamState::Running;
        }

        if caught_up && !rt.idle(poll_interval).await {
            return Ok(());
        }
    }
}

/// Persist and publish the position.
async fn checkpoint(ctx: &StreamContext, rt: &StreamRuntime, position: Position) -> Result<()> {
    if position == rt.position() {
        return Ok(());
    }
    ctx.store.save_position(rt.id, position).await?;
    rt.update_status(|s| s.position = position);
    Ok(())
}
