// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for inbound wire decoding.
//!
//! Tests that neither stream's decoder panics on arbitrary input and that
//! anything accepted is a valid record.

#![no_main]

use alt_replication::validation::{is_valid_address, is_valid_identity};
use alt_replication::wire::{decode_delete, InfoMessage};
use alt_replication::DeleteKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    if let Ok(message) = InfoMessage::decode(data) {
        let _ = message.origin();
        if let Ok(record) = message.into_record() {
            assert!(is_valid_identity(&record.uuid.hyphenated().to_string()));
            assert!(is_valid_address(&record.ip));
            assert!(record.count >= 1);
            assert!(record.updated >= record.created);
        }
    }

    match decode_delete(data) {
        Ok(DeleteKey::Address(ip)) => assert!(is_valid_address(&ip)),
        Ok(DeleteKey::Identity(_)) | Err(_) => {}
    }
});
