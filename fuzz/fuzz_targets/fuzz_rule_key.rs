// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for routing rule key parsing.
//!
//! Parsing never panics, and anything that parses prints back to a key
//! that parses to the same value.

#![no_main]

use keyspace_migrator::RuleKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(key) = data.parse::<RuleKey>() {
        let reparsed: RuleKey = key
            .to_string()
            .parse()
            .expect("displayed rule key must parse");
        assert_eq!(key, reparsed);
    }
});
