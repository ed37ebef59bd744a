// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable topology store backed by SQLite.
//!
//! A single `kv` table holds every record with its version. Compare-and-swap
//! is a conditional `UPDATE ... WHERE version = ?`; zero affected rows means
//! someone else won the race (or the key is gone).
//!
//! Busy/locked errors are retried with the same bounded backoff the stream
//! store uses.

use super::{TopoFuture, TopoStore, Versioned};
use crate::error::{MigrationError, Result};
use crate::stream_store::{connect_sqlite, execute_with_retry};
use sqlx::sqlite::SqlitePool;
use std::path::Path;
use tracing::info;

/// Topology store persisted to a SQLite file.
pub struct SqliteTopo {
    pool: SqlitePool,
    path: String,
}

impl SqliteTopo {
    /// Open (creating if needed) the topology database at `path`.
    pub async fn new(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing topology store");

        let pool = connect_sqlite(&path_str, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL
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

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Topology store closed");
    }

    async fn current_version(&self, key: &str) -> Result<Option<u64>> {
        let pool = &self.pool;
        let row: Option<(i64,)> = execute_with_retry("topo_version", || async {
            sqlx::query_as("SELECT version FROM kv WHERE key = ?")
                .bind(key)
                .fetch_optional(pool)
                .await
        })
        .await?;
        Ok(row.map(|(v,)| v as u64))
    }
}

impl TopoStore for SqliteTopo {
    fn get(&self, key: &str) -> TopoFuture<'_, Option<Versioned>> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let row: Option<(Vec<u8>, i64)> = execute_with_retry("topo_get", || async {
                sqlx::query_as("SELECT value, version FROM kv WHERE key = ?")
                    .bind(&key)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
            Ok(row.map(|(value, version)| Versioned {
                value,
                version: version as u64,
            }))
        })
    }

    fn create(&self, key: &str, value: Vec<u8>) -> TopoFuture<'_, u64> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("topo_create", || async {
                sqlx::query("INSERT OR IGNORE INTO kv (key, value, version) VALUES (?, ?, 1)")
                    .bind(&key)
                    .bind(&value)
                    .execute(pool)
                    .await
            })
            .await?;
            if result.rows_affected() == 0 {
                return Err(MigrationError::AlreadyExists(key));
            }
            Ok(1)
        })
    }

    fn update(&self, key: &str, value: Vec<u8>, expected_version: u64) -> TopoFuture<'_, u64> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("topo_update", || async {
                sqlx::query("UPDATE kv SET value = ?, version = version + 1 WHERE key = ? AND version = ?")
                    .bind(&value)
                    .bind(&key)
                    .bind(expected_version as i64)
                    .execute(pool)
                    .await
            })
            .await?;
            if result.rows_affected() == 0 {
                return match self.current_version(&key).await? {
                    None => Err(MigrationError::NotFound(key)),
                    Some(_) => Err(MigrationError::Conflict {
                        key,
                        expected: expected_version,
                    }),
                };
            }
            Ok(expected_version + 1)
        })
    }

    fn delete(&self, key: &str, expected_version: u64) -> TopoFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("topo_delete", || async {
                sqlx::query("DELETE FROM kv WHERE key = ? AND version = ?")
                    .bind(&key)
                    .bind(expected_version as i64)
                    .execute(pool)
                    .await
            })
            .await?;
            if result.rows_affected() == 0 {
                return match self.current_version(&key).await? {
                    None => Err(MigrationError::NotFound(key)),
                    Some(_) => Err(MigrationError::Conflict {
                        key,
                        expected: expected_version,
                    }),
                };
            }
            Ok(())
        })
    }

    fn list(&self, prefix: &str) -> TopoFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let rows: Vec<(String,)> = execute_with_retry("topo_list", || async {
                sqlx::query_as("SELECT key FROM kv WHERE substr(key, 1, length(?)) = ? ORDER BY key")
                    .bind(&prefix)
                    .bind(&prefix)
                    .fetch_all(pool)
                    .await
            })
            .await?;
            Ok(rows.into_iter().map(|(k,)| k).collect())
        })
    }
}
