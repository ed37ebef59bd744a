// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication positions.
//!
//! A [`Position`] addresses an entry in a partition's mutation log. Logs are
//! gap-free: the event after position `p` is always `p + 1`, and
//! [`Position::START`] is the position before the first event.
//!
//! Positions are persisted as decimal strings so a stream record stays
//! readable in the SQLite store.
//!
//! ```text
//! log:     [1] [2] [3] [4] [5]
//! stream:           ^ position = 3 (last applied)
//! next read: events after 3 → [4] [5]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position in a partition's mutation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    /// Position before the first event.
    pub const START: Position = Position(0);

    /// The raw sequence number.
    pub fn sequence(self) -> u64 {
        self.0
    }

    /// The position immediately after this one.
    pub fn next(self) -> Position {
        Position(self.0.saturating_add(1))
    }

    /// Number of events between `self` and a later `head`.
    ///
    /// Returns 0 when `self` is at or past `head`.
    pub fn events_behind(self, head: Position) -> u64 {
        head.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error parsing a position string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePositionError(pub String);

impl fmt::Display for ParsePositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid position: {:?}", self.0)
    }
}

impl std::error::Error for ParsePositionError {}

impl FromStr for Position {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParsePositionError(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(Position)
            .map_err(|_| ParsePositionError(s.to_string()))
    }
}

/// Estimated replication lag in milliseconds.
///
/// `event_ts_ms` is the source commit timestamp of the last applied event.
/// Clock skew can put the event in the future; that clamps to 0.
pub fn lag_ms(event_ts_ms: i64, now_ms: i64) -> u64 {
    if now_ms <= event_ts_ms {
        0
    } else {
        now_ms.abs_diff(event_ts_ms)
    }
}
