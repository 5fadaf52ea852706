// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for identity and address validation.
//!
//! Canonicalization must be idempotent and agree with validation.

#![no_main]

use alt_replication::validation::{canonical_address, is_valid_address, is_valid_identity, parse_identity};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: &str| {
    assert_eq!(is_valid_identity(input), parse_identity(input).is_some());

    match canonical_address(input) {
        Some(canonical) => {
            assert!(is_valid_address(input));
            assert_eq!(canonical_address(&canonical).as_deref(), Some(canonical.as_str()));
        }
        None => assert!(!is_valid_address(input)),
    }
});
