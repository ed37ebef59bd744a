// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for position parsing and lag calculation.
//!
//! This tests that neither ever panics on arbitrary input.

#![no_main]

use keyspace_migrator::position::{lag_ms, Position};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, i64, i64)| {
    let (a, b, event_ts, now) = data;

    let a = a.parse::<Position>().ok();
    let b = b.parse::<Position>().ok();
    if let (Some(a), Some(b)) = (a, b) {
        // Ordering agrees with the distance to head
        assert_eq!(a.events_behind(b) == 0, a >= b);
    }

    let _ = lag_ms(event_ts, now);
});
