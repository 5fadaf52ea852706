// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Boundary validation for identity tokens and IP literals.
//!
//! Every record crossing a boundary (caller write, inbound transport
//! message, store row) passes through here before it is cached,
//! persisted or broadcast.

use std::net::IpAddr;
use uuid::Uuid;

/// Length of a hyphenated UUID (`8-4-4-4-12`).
const HYPHENATED_LEN: usize = 36;

/// True iff `token` is a 128-bit identifier in hyphenated hex form.
///
/// Simple (no hyphens), braced and URN forms are rejected even though
/// `Uuid` itself would parse them.
pub fn is_valid_identity(token: &str) -> bool {
    if token.len() != HYPHENATED_LEN {
        return false;
    }
    let bytes = token.as_bytes();
    if bytes[8] != b'-' || bytes[13] != b'-' || bytes[18] != b'-' || bytes[23] != b'-' {
        return false;
    }
    Uuid::try_parse(token).is_ok()
}

/// True iff `text` is an IPv4 or IPv6 literal. Hostnames, ports,
/// zone ids and CIDR suffixes are rejected.
pub fn is_valid_address(text: &str) -> bool {
    text.parse::<IpAddr>().is_ok()
}

/// Parse an identity token, returning `None` unless it is valid.
pub fn parse_identity(token: &str) -> Option<Uuid> {
    if is_valid_identity(token) {
        Uuid::try_parse(token).ok()
    } else {
        None
    }
}

/// Canonical textual form of an IP literal (lowercase, compressed IPv6).
///
/// Two spellings of the same address map to the same cache key.
pub fn canonical_address(text: &str) -> Option<String> {
    text.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
