// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication stream types.
//!
//! Defines the persisted state machine for a replication stream.
//!
//! # State Transitions
//!
//! ```text
//!            start()            snapshot taken           first clean iteration
//!   ─────────────────→ Init ─────────────────→ Copying ─────────────────────→ Running
//!                        │                        │                            │  ↑
//!                        │                        │                     stop() │  │ resume()
//!                        │                        │                            ↓  │
//!                        │                        │                          Stopped
//!                        └────────────┬───────────┴────────────┬──────────────┘
//!                                     │ (data error, partition │
//!                                     │  loss, retry budget)   │
//!                                     ↓                        │
//!                                   Error ─── resume() ────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Init**: Record persisted, task not yet past setup.
//! - **Copying**: Bulk copy of filtered tables in progress (or tail catching up after it).
//! - **Running**: Tailing the source continuously.
//! - **Stopped**: Paused by an operator. Not resumed by a restarted engine.
//! - **Error**: Unrecoverable failure. Terminal until `resume()`.

use crate::filter::FilterSpec;
use crate::partition::PartitionRef;
use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stream identifier, assigned by the stream store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub i64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a replication stream.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Init,
    Copying,
    Running,
    Stopped,
    Error,
}

impl StreamState {
    /// Whether a task should be driving this stream.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Init | Self::Copying | Self::Running)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Init => write!(f, "Init"),
            StreamState::Copying => write!(f, "Copying"),
            StreamState::Running => write!(f, "Running"),
            StreamState::Stopped => write!(f, "Stopped"),
            StreamState::Error => write!(f, "Error"),
        }
    }
}

impl FromStr for StreamState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Init" => Ok(Self::Init),
            "Copying" => Ok(Self::Copying),
            "Running" => Ok(Self::Running),
            "Stopped" => Ok(Self::Stopped),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown stream state {:?}", other)),
        }
    }
}

/// Non-blocking status snapshot of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub id: StreamId,
    pub state: StreamState,
    pub position: Position,
    /// Source commit time of the last applied event minus now, 0 when caught up.
    pub lag_ms: u64,
    /// Last error message, if any.
    pub message: Option<String>,
}

/// Persisted stream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub source: PartitionRef,
    pub destination: PartitionRef,
    pub filter: FilterSpec,
    pub position: Position,
    pub state: StreamState,
    pub message: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}
