// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for shard key range parsing.

#![no_main]

use keyspace_migrator::KeyRange;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u64)| {
    let (text, id) = data;

    // Should never panic
    if let Ok(range) = KeyRange::parse(text) {
        if let Some(end) = range.end {
            assert!(end > range.start);
        }
        let _ = range.contains(id);
        let _ = range.to_string();
    }
});
