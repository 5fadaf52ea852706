// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record model: one row per (identity, address) sighting.
//!
//! # Merge Rule
//!
//! `count`, `server` and `updated` are last-write-wins: the record with the
//! greater `updated` wins, ties go to the higher `count`. `created` always
//! merges to the earlier of the two values. The merge is commutative and
//! idempotent, so deltas may arrive out of order or more than once.

use crate::error::{AltError, Result};
use crate::validation::{canonical_address, parse_identity};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One observed (identity, address) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerData {
    /// Player identity.
    pub uuid: Uuid,
    /// Canonical IP literal.
    pub ip: String,
    /// Number of times this pair has been seen (>= 1).
    pub count: u64,
    /// Label of the server that last updated the row.
    pub server: String,
    /// First observation, epoch millis.
    pub created: i64,
    /// Most recent observation, epoch millis.
    pub updated: i64,
}

impl PlayerData {
    /// Build a validated record.
    ///
    /// The address is canonicalized, `count` is clamped to at least 1 and
    /// `updated` to at least `created`.
    pub fn new(
        uuid: Uuid,
        ip: &str,
        count: u64,
        server: impl Into<String>,
        created: i64,
        updated: i64,
    ) -> Result<Self> {
        let ip = canonical_address(ip)
            .ok_or_else(|| AltError::Validation(format!("invalid IP address: {:?}", ip)))?;
        Ok(Self {
            uuid,
            ip,
            count: count.max(1),
            server: server.into(),
            created,
            updated: updated.max(created),
        })
    }

    /// Build a record from an untrusted identity token (wire or SQL row).
    pub fn from_parts(
        uuid: &str,
        ip: &str,
        count: u64,
        server: impl Into<String>,
        created: i64,
        updated: i64,
    ) -> Result<Self> {
        let uuid = parse_identity(uuid)
            .ok_or_else(|| AltError::Validation(format!("invalid UUID: {:?}", uuid)))?;
        Self::new(uuid, ip, count, server, created, updated)
    }

    /// A brand new sighting of this pair.
    pub fn first_sighting(uuid: Uuid, ip: &str, server: impl Into<String>, now: i64) -> Result<Self> {
        Self::new(uuid, ip, 1, server, now, now)
    }

    /// The record that results from seeing this pair again at `now`.
    pub fn next_sighting(&self, server: impl Into<String>, now: i64) -> Self {
        Self {
            uuid: self.uuid,
            ip: self.ip.clone(),
            count: self.count.saturating_add(1),
            server: server.into(),
            created: self.created,
            // Clock skew between nodes must not move `updated` backwards
            updated: now.max(self.updated),
        }
    }

    /// Natural key of the row.
    pub fn key(&self) -> (Uuid, &str) {
        (self.uuid, self.ip.as_str())
    }

    /// Check whether this record wins over `other` under last-write-wins.
    pub fn supersedes(&self, other: &PlayerData) -> bool {
        self.updated > other.updated || (self.updated == other.updated && self.count > other.count)
    }

    /// Merge `incoming` into `self`. Returns true if anything changed.
    pub fn merge(&mut self, incoming: &PlayerData) -> bool {
        let mut changed = false;
        if incoming.supersedes(self) {
            self.count = incoming.count;
            self.server = incoming.server.clone();
            self.updated = incoming.updated;
            changed = true;
        }
        if incoming.created < self.created {
            self.created = incoming.created;
            changed = true;
        }
        changed
    }
}

/// A batch of rows changed since a checkpoint.
///
/// Created by the store on each dirty fetch and consumed once by the sync
/// loop. Delivery is at-least-once: a batch that was not handed off is
/// fetched again on the next tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Rows in ascending checkpoint order.
    pub rows: Vec<PlayerData>,
    /// Checkpoint after this batch (unchanged if the batch is empty).
    pub checkpoint: i64,
}

impl FetchResult {
    /// An empty batch at `checkpoint`.
    pub fn empty(checkpoint: i64) -> Self {
        Self {
            rows: Vec::new(),
            checkpoint,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Key of a delete request: every row for an identity, or every row for an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeleteKey {
    Identity(Uuid),
    Address(String),
}

impl DeleteKey {
    /// Parse a bare delete payload: identity token first, then IP literal.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(uuid) = parse_identity(raw) {
            return Ok(DeleteKey::Identity(uuid));
        }
        if let Some(ip) = canonical_address(raw) {
            return Ok(DeleteKey::Address(ip));
        }
        Err(AltError::Validation(format!(
            "delete key is neither a UUID nor an IP: {:?}",
            raw
        )))
    }

    /// Bare string form used on the delete stream.
    pub fn as_payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeleteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteKey::Identity(uuid) => write!(f, "{}", uuid.hyphenated()),
            DeleteKey::Address(ip) => write!(f, "{}", ip),
        }
    }
}

impl From<Uuid> for DeleteKey {
    fn from(uuid: Uuid) -> Self {
        DeleteKey::Identity(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn record(count: u64, created: i64, updated: i64) -> PlayerData {
        PlayerData::new(uuid(1), "203.0.113.5", count, "lobby-1", created, updated).unwrap()
    }

    #[test]
    fn test_new_canonicalizes_address() {
        let r = PlayerData::new(uuid(1), "2001:DB8::0:1", 1, "s", 10, 10).unwrap();
        assert_eq!(r.ip, "2001:db8::1");
    }

    #[test]
    fn test_new_rejects_bad_address() {
        let err = PlayerData::new(uuid(1), "999.999.999.999", 1, "s", 10, 10).unwrap_err();
        assert!(matches!(err, AltError::Validation(_)));
    }

    #[test]
    fn test_new_clamps_count_and_updated() {
        let r = PlayerData::new(uuid(1), "10.0.0.1", 0, "s", 100, 50).unwrap();
        assert_eq!(r.count, 1);
        assert_eq!(r.updated, 100);
    }

    #[test]
    fn test_from_parts_rejects_bad_uuid() {
        let err = PlayerData::from_parts("not-a-uuid", "10.0.0.1", 1, "s", 1, 1).unwrap_err();
        assert!(matches!(err, AltError::Validation(_)));
    }

    #[test]
    fn test_next_sighting() {
        let r = record(3, 10, 20);
        let next = r.next_sighting("lobby-2", 30);
        assert_eq!(next.count, 4);
        assert_eq!(next.created, 10);
        assert_eq!(next.updated, 30);
        assert_eq!(next.server, "lobby-2");

        // A lagging clock never moves updated backwards
        let skewed = r.next_sighting("lobby-2", 5);
        assert_eq!(skewed.updated, 20);
    }

    #[test]
    fn test_supersedes() {
        assert!(record(1, 0, 20).supersedes(&record(5, 0, 10)));
        assert!(!record(5, 0, 10).supersedes(&record(1, 0, 20)));
        // Tie on updated goes to higher count
        assert!(record(6, 0, 10).supersedes(&record(5, 0, 10)));
        assert!(!record(5, 0, 10).supersedes(&record(5, 0, 10)));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let older = record(2, 5, 10);
        let newer = record(3, 1, 20);

        let mut a = older.clone();
        a.merge(&newer);
        let mut b = newer.clone();
        b.merge(&older);

        assert_eq!(a, b);
        assert_eq!(a.count, 3);
        assert_eq!(a.updated, 20);
        assert_eq!(a.created, 1);
    }

    #[test]
    fn test_merge_idempotent() {
        let mut r = record(2, 5, 10);
        let same = r.clone();
        assert!(!r.merge(&same));
        assert_eq!(r, same);
    }

    #[test]
    fn test_delete_key_parse() {
        let id = "a1b2c3d4-0000-4000-8000-000000000001";
        assert_eq!(
            DeleteKey::parse(id).unwrap(),
            DeleteKey::Identity(Uuid::try_parse(id).unwrap())
        );
        assert_eq!(
            DeleteKey::parse("203.0.113.5").unwrap(),
            DeleteKey::Address("203.0.113.5".to_string())
        );
        assert!(DeleteKey::parse("bogus").is_err());
    }

    #[test]
    fn test_delete_key_payload() {
        let key = DeleteKey::Identity(uuid(0xab));
        assert_eq!(key.as_payload(), "00000000-0000-0000-0000-0000000000ab");
        assert_eq!(DeleteKey::parse(&key.as_payload()).unwrap(), key);
    }

    #[test]
    fn test_fetch_result_empty() {
        let batch = FetchResult::empty(42);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.checkpoint, 42);
    }
}
