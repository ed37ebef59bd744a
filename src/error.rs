// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the migration control plane.
//!
//! Errors are grouped into the classes the orchestrator and stream engine
//! act on. The class decides whether a fault is retried locally, parks a
//! stream in `Error`, or is surfaced to the operator unchanged.
//!
//! # Error Classes
//!
//! | Class | Retryable | Examples |
//! |-------|-----------|----------|
//! | `Transient` | Yes | Connection loss, lock timeout, SQLite busy |
//! | `Data` | No | Constraint violation, missing table on destination |
//! | `Conflict` | No | Version mismatch on a compare-and-swap write |
//! | `Precondition` | No | Illegal phase order, duplicate migration, lag too high |
//! | `Fatal` | No | Partition lost, engine shutting down, internal bug |
//!
//! # Retry Behavior
//!
//! Only the stream engine retries, and only `Transient` faults, within its
//! bounded budget. Conflicts are never retried silently: the caller must
//! re-read and decide again, otherwise a concurrent operator action could be
//! masked.

use crate::partition::PartitionError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Coarse error class used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Data,
    Conflict,
    Precondition,
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Data => write!(f, "data"),
            Self::Conflict => write!(f, "conflict"),
            Self::Precondition => write!(f, "precondition"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors that can occur in the migration control plane.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A storage partition rejected or failed an operation.
    ///
    /// The class follows the wrapped [`PartitionError`].
    #[error("Partition error ({partition}): {source}")]
    Partition {
        partition: String,
        #[source]
        source: PartitionError,
    },

    /// SQLite error in the stream store or topology store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Record (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic concurrency failure. Re-read and retry.
    #[error("Version conflict on {key}: expected version {expected}, re-read and retry")]
    Conflict { key: String, expected: u64 },

    /// Attempt to create a record that already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Referenced record or stream does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation rejected before any mutation.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Malformed table identifier or filter.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Write to a blacklisted table.
    #[error("disallowed: blacklisted table {table} on {partition} ({class})")]
    Blacklisted {
        table: String,
        partition: String,
        class: String,
    },

    /// A replication stream entered `Error` while being waited on.
    #[error("Stream {stream_id} failed: {message}")]
    StreamFailed { stream_id: i64, message: String },

    /// Bounded wait expired.
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Engine is shutting down.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// Wrap a partition error with the partition it came from.
    pub fn partition(partition: impl std::fmt::Display, source: PartitionError) -> Self {
        Self::Partition {
            partition: partition.to_string(),
            source,
        }
    }

    /// Build a precondition failure from a reason string.
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition(reason.into())
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Partition { source, .. } => match source {
                PartitionError::Transient(_) => ErrorClass::Transient,
                PartitionError::Data(_) => ErrorClass::Data,
                PartitionError::Lost(_) => ErrorClass::Fatal,
            },
            Self::Store(e) if crate::stream_store::is_sqlite_busy_error(e) => ErrorClass::Transient,
            Self::Store(_) => ErrorClass::Fatal,
            Self::Serialization(_) => ErrorClass::Data,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::AlreadyExists(_) => ErrorClass::Precondition,
            Self::NotFound(_) => ErrorClass::Precondition,
            Self::Precondition(_) => ErrorClass::Precondition,
            Self::InvalidFilter(_) => ErrorClass::Precondition,
            Self::Blacklisted { .. } => ErrorClass::Precondition,
            Self::StreamFailed { .. } => ErrorClass::Data,
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::Config(_) => ErrorClass::Precondition,
            Self::InvalidState { .. } => ErrorClass::Precondition,
            Self::Shutdown => ErrorClass::Fatal,
            Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable with backoff.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_transient_is_retryable() {
        let err = MigrationError::partition(
            "source/0",
            PartitionError::Transient("connection reset".to_string()),
        );
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("source/0"));
    }

    #[test]
    fn test_partition_data_not_retryable() {
        let err = MigrationError::partition(
            "dest/0",
            PartitionError::Data("duplicate key".to_string()),
        );
        assert!(!err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Data);
    }

    #[test]
    fn test_partition_lost_is_fatal() {
        let err = MigrationError::partition("dest/0", PartitionError::Lost("gone".to_string()));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_conflict_not_retryable() {
        let err = MigrationError::Conflict {
            key: "routing_rules".to_string(),
            expected: 3,
        };
        assert!(!err.is_retryable());
        assert!(err.is_conflict());
        assert!(err.to_string().contains("re-read and retry"));
    }

    #[test]
    fn test_blacklisted_message_is_distinguishable() {
        let err = MigrationError::Blacklisted {
            table: "moving1".to_string(),
            partition: "source/0".to_string(),
            class: "primary".to_string(),
        };
        assert!(err.to_string().starts_with("disallowed: blacklisted"));
        assert_eq!(err.class(), ErrorClass::Precondition);
    }

    #[test]
    fn test_precondition_reason_preserved() {
        let err = MigrationError::precondition("cannot reverse rdonly: replica applied after it");
        assert!(err.to_string().contains("replica applied after it"));
        assert_eq!(err.class(), ErrorClass::Precondition);
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = MigrationError::Timeout {
            what: "stream 1 to reach Running".to_string(),
            elapsed: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("stream 1"));
    }

    #[test]
    fn test_store_row_not_found_is_fatal() {
        let err = MigrationError::Store(sqlx::Error::RowNotFound);
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = MigrationError::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Stopped"));
        assert!(msg.contains("Running"));
    }
}
