// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable stream state.
//!
//! Stores one record per replication stream (source, destination, filter,
//! position, state, last error) plus per-table copy checkpoints in SQLite,
//! next to the destination partition.
//!
//! # Write-Through Progress
//!
//! The position is persisted after every applied batch, before the next
//! batch is read. A crash between apply and persist replays at most that one
//! batch, which is safe because apply is row-image based:
//!
//! ```text
//! read events 41..=48 → apply to destination → persist position 48
//!                       (crash here = re-apply 41..=48, idempotent)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement goes through [`execute_with_retry`]:
//! - Exponential backoff starting at 10ms, capped at 500ms
//! - At most 5 attempts, then the error is surfaced

use crate::error::{MigrationError, Result};
use crate::filter::FilterSpec;
use crate::partition::PartitionRef;
use crate::position::Position;
use crate::stream::types::{StreamId, StreamRecord, StreamState};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Open a SQLite pool, creating the file if needed.
pub(crate) async fn connect_sqlite(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    let journal = if wal_mode {
        sqlx::sqlite::SqliteJournalMode::Wal
    } else {
        sqlx::sqlite::SqliteJournalMode::Delete
    };
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| MigrationError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(journal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?)
}

type StreamRow = (i64, String, String, String, String, String, Option<String>, i64);

fn decode_row(row: StreamRow) -> Result<StreamRecord> {
    let (id, source, destination, filter, position, state, message, updated_at) = row;
    Ok(StreamRecord {
        id: StreamId(id),
        source: source
            .parse()
            .map_err(|e: String| MigrationError::Internal(format!("stream {}: {}", id, e)))?,
        destination: destination
            .parse()
            .map_err(|e: String| MigrationError::Internal(format!("stream {}: {}", id, e)))?,
        filter: serde_json::from_str(&filter)?,
        position: position
            .parse()
            .map_err(|e| MigrationError::Internal(format!("stream {}: {}", id, e)))?,
        state: state
            .parse()
            .map_err(|e: String| MigrationError::Internal(format!("stream {}: {}", id, e)))?,
        message,
        updated_at,
    })
}

/// Persistent stream store backed by SQLite.
pub struct StreamStore {
    pool: SqlitePool,
    path: String,
}

impl StreamStore {
    /// Create a new stream store at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing stream store");

        let pool = connect_sqlite(&path_str, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS streams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                filter TEXT NOT NULL,
                position TEXT NOT NULL,
                state TEXT NOT NULL,
                message TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_state (
                stream_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                complete INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (stream_id, table_name)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Persist a new stream record and return its id.
    pub async fn create(
        &self,
        source: &PartitionRef,
        destination: &PartitionRef,
        filter: &FilterSpec,
        position: Position,
        state: StreamState,
    ) -> Result<StreamId> {
        let pool = &self.pool;
        let source = source.to_string();
        let destination = destination.to_string();
        let filter = serde_json::to_string(filter)?;
        let position = position.to_string();
        let state = state.to_string();
        let now = chrono::Utc::now().timestamp_millis();

        let result = execute_with_retry("stream_create", || async {
            sqlx::query(
                r#"
                INSERT INTO streams (source, destination, filter, position, state, message, updated_at)
                VALUES (?, ?, ?, ?, ?, NULL, ?)
                "#,
            )
            .bind(&source)
            .bind(&destination)
            .bind(&filter)
            .bind(&position)
            .bind(&state)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let id = StreamId(result.last_insert_rowid());
        debug!(stream_id = %id, "Stream record created");
        Ok(id)
    }

    /// Persist the position after an applied batch.
    pub async fn save_position(&self, id: StreamId, position: Position) -> Result<()> {
        let pool = &self.pool;
        let position = position.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let result = execute_with_retry("stream_save_position", || async {
            sqlx::query("UPDATE streams SET position = ?, updated_at = ? WHERE id = ?")
                .bind(&position)
                .bind(now)
                .bind(id.0)
                .execute(pool)
                .await
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(MigrationError::NotFound(format!("stream {}", id)));
        }
        Ok(())
    }

    /// Persist a state transition. `message` replaces the stored message.
    pub async fn set_state(&self, id: StreamId, state: StreamState, message: Option<&str>) -> Result<()> {
        let pool = &self.pool;
        let state_str = state.to_string();
        let message = message.map(str::to_string);
        let now = chrono::Utc::now().timestamp_millis();
        let result = execute_with_retry("stream_set_state", || async {
            sqlx::query("UPDATE streams SET state = ?, message = ?, updated_at = ? WHERE id = ?")
                .bind(&state_str)
                .bind(&message)
                .bind(now)
                .bind(id.0)
                .execute(pool)
                .await
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(MigrationError::NotFound(format!("stream {}", id)));
        }
        debug!(stream_id = %id, state = %state, "Stream state persisted");
        Ok(())
    }

    pub async fn get(&self, id: StreamId) -> Result<Option<StreamRecord>> {
        let pool = &self.pool;
        let row: Option<StreamRow> = execute_with_retry("stream_get", || async {
            sqlx::query_as(
                "SELECT id, source, destination, filter, position, state, message, updated_at FROM streams WHERE id = ?",
            )
            .bind(id.0)
            .fetch_optional(pool)
            .await
        })
        .await?;
        row.map(decode_row).transpose()
    }

    /// All stream records, ordered by id.
    pub async fn list(&self) -> Result<Vec<StreamRecord>> {
        let pool = &self.pool;
        let rows: Vec<StreamRow> = execute_with_retry("stream_list", || async {
            sqlx::query_as(
                "SELECT id, source, destination, filter, position, state, message, updated_at FROM streams ORDER BY id",
            )
            .fetch_all(pool)
            .await
        })
        .await?;
        rows.into_iter().map(decode_row).collect()
    }

    /// Delete a stream record and its copy checkpoints.
    pub async fn delete(&self, id: StreamId) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("stream_delete", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM copy_state WHERE stream_id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM streams WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await?;
        info!(stream_id = %id, "Deleted stream record");
        Ok(())
    }

    // =========================================================================
    // Copy checkpoints
    // =========================================================================

    /// Register tables to copy. Existing checkpoints are left untouched.
    pub async fn init_copy(&self, id: StreamId, tables: &[String]) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("copy_init", || async {
            let mut tx = pool.begin().await?;
            for (ordinal, table) in tables.iter().enumerate() {
                sqlx::query(
                    "INSERT OR IGNORE INTO copy_state (stream_id, ordinal, table_name, complete) VALUES (?, ?, ?, 0)",
                )
                .bind(id.0)
                .bind(ordinal as i64)
                .bind(table)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Checkpoint a fully copied table.
    pub async fn mark_copied(&self, id: StreamId, table: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("copy_mark", || async {
            sqlx::query("UPDATE copy_state SET complete = 1 WHERE stream_id = ? AND table_name = ?")
                .bind(id.0)
                .bind(table)
                .execute(pool)
                .await
        })
        .await?;
        debug!(stream_id = %id, table, "Table copy checkpointed");
        Ok(())
    }

    /// Tables registered but not yet copied, in registration order.
    pub async fn pending_copies(&self, id: StreamId) -> Result<Vec<String>> {
        let pool = &self.pool;
        let rows: Vec<(String,)> = execute_with_retry("copy_pending", || async {
            sqlx::query_as(
                "SELECT table_name FROM copy_state WHERE stream_id = ? AND complete = 0 ORDER BY ordinal",
            )
            .bind(id.0)
            .fetch_all(pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Whether copy checkpoints were ever registered for the stream.
    pub async fn has_copy_state(&self, id: StreamId) -> Result<bool> {
        let pool = &self.pool;
        let (count,): (i64,) = execute_with_retry("copy_exists", || async {
            sqlx::query_as("SELECT COUNT(*) FROM copy_state WHERE stream_id = ?")
                .bind(id.0)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count > 0)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Stream store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn refs() -> (PartitionRef, PartitionRef, FilterSpec) {
        (
            PartitionRef::new("source_keyspace", "0"),
            PartitionRef::new("destination_keyspace", "0"),
            FilterSpec::new("source_keyspace", ["moving1", "moving2"]),
        )
    }

    #[tokio::test]
    async fn test_stream_store_create_and_get() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.db"), true).await.unwrap();
        let (src, dst, filter) = refs();

        let id = store
            .create(&src, &dst, &filter, Position(5), StreamState::Init)
            .await
            .unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.source, src);
        assert_eq!(record.destination, dst);
        assert_eq!(record.filter, filter);
        assert_eq!(record.position, Position(5));
        assert_eq!(record.state, StreamState::Init);
        assert_eq!(record.message, None);

        assert!(store.get(StreamId(999)).await.unwrap().is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_stream_store_ids_are_distinct() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.db"), true).await.unwrap();
        let (src, dst, filter) = refs();
        let a = store.create(&src, &dst, &filter, Position::START, StreamState::Init).await.unwrap();
        let b = store.create(&src, &dst, &filter, Position::START, StreamState::Init).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list().await.unwrap().len(), 2);
        store.close().await;
    }

    #[tokio::test]
    async fn test_stream_store_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let (src, dst, filter) = refs();

        let id = {
            let store = StreamStore::new(&path, true).await.unwrap();
            let id = store.create(&src, &dst, &filter, Position::START, StreamState::Init).await.unwrap();
            store.save_position(id, Position(42)).await.unwrap();
            store.set_state(id, StreamState::Stopped, None).await.unwrap();
            store.close().await;
            id
        };

        let store = StreamStore::new(&path, true).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.position, Position(42));
        assert_eq!(record.state, StreamState::Stopped);
        store.close().await;
    }

    #[tokio::test]
    async fn test_stream_store_error_message() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.db"), false).await.unwrap();
        let (src, dst, filter) = refs();
        let id = store.create(&src, &dst, &filter, Position::START, StreamState::Init).await.unwrap();

        store
            .set_state(id, StreamState::Error, Some("duplicate key"))
            .await
            .unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.message.as_deref(), Some("duplicate key"));

        // Clearing on resume
        store.set_state(id, StreamState::Running, None).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().message, None);
        store.close().await;
    }

    #[tokio::test]
    async fn test_stream_store_updates_missing_stream() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.db"), true).await.unwrap();
        assert!(matches!(
            store.save_position(StreamId(1), Position(1)).await,
            Err(MigrationError::NotFound(_))
        ));
        assert!(matches!(
            store.set_state(StreamId(1), StreamState::Running, None).await,
            Err(MigrationError::NotFound(_))
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_copy_checkpoints() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.db"), true).await.unwrap();
        let (src, dst, filter) = refs();
        let id = store.create(&src, &dst, &filter, Position::START, StreamState::Init).await.unwrap();

        assert!(!store.has_copy_state(id).await.unwrap());
        store.init_copy(id, &filter.tables).await.unwrap();
        assert!(store.has_copy_state(id).await.unwrap());
        assert_eq!(store.pending_copies(id).await.unwrap(), filter.tables);

        store.mark_copied(id, "moving1").await.unwrap();
        assert_eq!(store.pending_copies(id).await.unwrap(), vec!["moving2".to_string()]);

        // Re-registering keeps completed checkpoints
        store.init_copy(id, &filter.tables).await.unwrap();
        assert_eq!(store.pending_copies(id).await.unwrap(), vec!["moving2".to_string()]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_delete_removes_checkpoints() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path().join("streams.db"), true).await.unwrap();
        let (src, dst, filter) = refs();
        let id = store.create(&src, &dst, &filter, Position::START, StreamState::Init).await.unwrap();
        store.init_copy(id, &filter.tables).await.unwrap();

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(!store.has_copy_state(id).await.unwrap());

        // Deleting again is fine
        store.delete(id).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_non_database() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
