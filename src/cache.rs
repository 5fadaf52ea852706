// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local cache: the in-process working set callers read from.
//!
//! Two structures live under one lock:
//!
//! ```text
//! rows:        identity → (address → PlayerData)
//! by_address:  address  → {identity, ...}        (the alt index)
//! ```
//!
//! Every mutation (caller writes, both transport listeners, startup seed)
//! takes the same write lock, so last-write-wins merges for a key never
//! race each other. Reads share the lock.

use crate::error::{AltError, Result};
use crate::metrics;
use crate::record::{DeleteKey, PlayerData};
use crate::validation::canonical_address;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// What an [`PlayerCache::add`] did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New (identity, address) pair.
    Inserted,
    /// Existing row merged and changed.
    Updated,
    /// Existing row was equal or newer.
    Unchanged,
}

impl AddOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOutcome::Inserted => "inserted",
            AddOutcome::Updated => "updated",
            AddOutcome::Unchanged => "unchanged",
        }
    }

    /// True if the cache changed.
    pub fn changed(&self) -> bool {
        !matches!(self, AddOutcome::Unchanged)
    }
}

#[derive(Default)]
struct CacheInner {
    rows: HashMap<Uuid, HashMap<String, PlayerData>>,
    by_address: HashMap<String, HashSet<Uuid>>,
    len: usize,
}

impl CacheInner {
    fn apply(&mut self, record: &PlayerData) -> AddOutcome {
        let by_ip = self.rows.entry(record.uuid).or_default();
        match by_ip.get_mut(&record.ip) {
            Some(existing) => {
                if existing.merge(record) {
                    AddOutcome::Updated
                } else {
                    AddOutcome::Unchanged
                }
            }
            None => {
                by_ip.insert(record.ip.clone(), record.clone());
                self.by_address
                    .entry(record.ip.clone())
                    .or_default()
                    .insert(record.uuid);
                self.len += 1;
                AddOutcome::Inserted
            }
        }
    }

    fn remove_identity(&mut self, uuid: &Uuid) -> usize {
        let Some(by_ip) = self.rows.remove(uuid) else {
            return 0;
        };
        for ip in by_ip.keys() {
            self.unindex(ip, uuid);
        }
        self.len -= by_ip.len();
        by_ip.len()
    }

    fn remove_address(&mut self, ip: &str) -> usize {
        let Some(identities) = self.by_address.remove(ip) else {
            return 0;
        };
        let mut removed = 0;
        for uuid in &identities {
            if let Some(by_ip) = self.rows.get_mut(uuid) {
                if by_ip.remove(ip).is_some() {
                    removed += 1;
                }
                if by_ip.is_empty() {
                    self.rows.remove(uuid);
                }
            }
        }
        self.len -= removed;
        removed
    }

    fn unindex(&mut self, ip: &str, uuid: &Uuid) {
        if let Some(set) = self.by_address.get_mut(ip) {
            set.remove(uuid);
            if set.is_empty() {
                self.by_address.remove(ip);
            }
        }
    }
}

/// Thread-safe identity/address cache with an alt index.
#[derive(Default)]
pub struct PlayerCache {
    inner: RwLock<CacheInner>,
}

impl PlayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a record. Records that fail validation are rejected and never
    /// reach either index.
    pub async fn add(&self, record: PlayerData) -> Result<AddOutcome> {
        let record = revalidate(record)?;
        let mut inner = self.inner.write().await;
        let outcome = inner.apply(&record);
        metrics::set_cache_rows(inner.len);
        Ok(outcome)
    }

    /// Merge many records under one lock acquisition. Invalid records are
    /// skipped. Returns how many changed the cache.
    pub async fn seed(&self, records: impl IntoIterator<Item = PlayerData>) -> usize {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for record in records {
            if let Ok(record) = revalidate(record) {
                if inner.apply(&record).changed() {
                    changed += 1;
                }
            }
        }
        metrics::set_cache_rows(inner.len);
        changed
    }

    /// Record a sighting of `(uuid, ip)` at `now` seen by `server`.
    ///
    /// The next record is computed and applied under the write lock, so two
    /// concurrent sightings of the same pair both count.
    pub async fn record_sighting(
        &self,
        uuid: Uuid,
        ip: &str,
        server: &str,
        now: i64,
    ) -> Result<PlayerData> {
        let ip = canonical_address(ip)
            .ok_or_else(|| AltError::Validation(format!("invalid IP address: {:?}", ip)))?;
        let mut inner = self.inner.write().await;
        let next = match inner.rows.get(&uuid).and_then(|by_ip| by_ip.get(&ip)) {
            Some(existing) => existing.next_sighting(server, now),
            None => PlayerData::first_sighting(uuid, &ip, server, now)?,
        };
        inner.apply(&next);
        metrics::set_cache_rows(inner.len);
        Ok(next)
    }

    /// All rows for an identity.
    pub async fn get(&self, uuid: &Uuid) -> Vec<PlayerData> {
        let inner = self.inner.read().await;
        inner
            .rows
            .get(uuid)
            .map(|by_ip| by_ip.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every other identity that shares at least one address with `uuid`.
    pub async fn find_alts_of(&self, uuid: &Uuid) -> HashSet<Uuid> {
        let inner = self.inner.read().await;
        let mut alts = HashSet::new();
        if let Some(by_ip) = inner.rows.get(uuid) {
            for ip in by_ip.keys() {
                if let Some(identities) = inner.by_address.get(ip) {
                    alts.extend(identities.iter().copied());
                }
            }
        }
        alts.remove(uuid);
        alts
    }

    /// Identities seen at `ip`. Unparseable addresses have no identities.
    pub async fn identities_at(&self, ip: &str) -> HashSet<Uuid> {
        let Some(ip) = canonical_address(ip) else {
            return HashSet::new();
        };
        let inner = self.inner.read().await;
        inner.by_address.get(&ip).cloned().unwrap_or_default()
    }

    /// Remove every row matching `key` from both indexes. Returns rows removed.
    pub async fn delete(&self, key: &DeleteKey) -> usize {
        let mut inner = self.inner.write().await;
        let removed = match key {
            DeleteKey::Identity(uuid) => inner.remove_identity(uuid),
            DeleteKey::Address(ip) => inner.remove_address(ip),
        };
        metrics::set_cache_rows(inner.len);
        removed
    }

    /// Number of (identity, address) rows held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Re-run boundary validation on a record built outside this crate's
/// constructors (public fields can be set directly).
fn revalidate(mut record: PlayerData) -> Result<PlayerData> {
    record.ip = canonical_address(&record.ip)
        .ok_or_else(|| AltError::Validation(format!("invalid IP address: {:?}", record.ip)))?;
    record.count = record.count.max(1);
    record.updated = record.updated.max(record.created);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn record(uuid: Uuid, ip: &str, count: u64, updated: i64) -> PlayerData {
        PlayerData::new(uuid, ip, count, "lobby-1", 0, updated).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let cache = PlayerCache::new();
        let outcome = cache.add(record(id(1), "203.0.113.5", 1, 10)).await.unwrap();
        assert_eq!(outcome, AddOutcome::Inserted);

        let rows = cache.get(&id(1)).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, "203.0.113.5");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_address() {
        let cache = PlayerCache::new();
        let mut bad = record(id(1), "203.0.113.5", 1, 10);
        bad.ip = "999.999.999.999".to_string();

        let err = cache.add(bad).await.unwrap_err();
        assert!(matches!(err, AltError::Validation(_)));
        assert!(cache.get(&id(1)).await.is_empty());
        assert!(cache.identities_at("999.999.999.999").await.is_empty());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let cache = PlayerCache::new();
        let r = record(id(1), "203.0.113.5", 3, 10);
        cache.add(r.clone()).await.unwrap();
        assert_eq!(cache.add(r).await.unwrap(), AddOutcome::Unchanged);
        assert_eq!(cache.get(&id(1)).await[0].count, 3);
    }

    #[tokio::test]
    async fn test_older_record_never_regresses() {
        let cache = PlayerCache::new();
        cache.add(record(id(1), "203.0.113.5", 5, 20)).await.unwrap();
        cache.add(record(id(1), "203.0.113.5", 9, 10)).await.unwrap();

        let row = &cache.get(&id(1)).await[0];
        assert_eq!(row.count, 5);
        assert_eq!(row.updated, 20);
    }

    #[tokio::test]
    async fn test_last_write_wins_either_order() {
        let t1 = record(id(1), "203.0.113.5", 2, 10);
        let t2 = record(id(1), "203.0.113.5", 3, 20);

        let forward = PlayerCache::new();
        forward.add(t1.clone()).await.unwrap();
        forward.add(t2.clone()).await.unwrap();

        let reverse = PlayerCache::new();
        reverse.add(t2.clone()).await.unwrap();
        reverse.add(t1).await.unwrap();

        assert_eq!(forward.get(&id(1)).await, vec![t2.clone()]);
        assert_eq!(reverse.get(&id(1)).await, vec![t2]);
    }

    #[tokio::test]
    async fn test_find_alts_of() {
        let cache = PlayerCache::new();
        cache.add(record(id(1), "203.0.113.5", 1, 10)).await.unwrap();
        cache.add(record(id(1), "198.51.100.7", 1, 10)).await.unwrap();
        cache.add(record(id(2), "203.0.113.5", 1, 10)).await.unwrap();
        cache.add(record(id(3), "198.51.100.7", 1, 10)).await.unwrap();
        cache.add(record(id(4), "192.0.2.1", 1, 10)).await.unwrap();

        let alts = cache.find_alts_of(&id(1)).await;
        assert_eq!(alts, HashSet::from([id(2), id(3)]));
        assert_eq!(cache.find_alts_of(&id(2)).await, HashSet::from([id(1)]));
        assert!(cache.find_alts_of(&id(4)).await.is_empty());
        assert!(cache.find_alts_of(&id(99)).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_identity_clears_alt_index() {
        let cache = PlayerCache::new();
        cache.add(record(id(1), "203.0.113.5", 1, 10)).await.unwrap();
        cache.add(record(id(2), "203.0.113.5", 1, 10)).await.unwrap();
        cache.add(record(id(2), "198.51.100.7", 1, 10)).await.unwrap();

        assert_eq!(cache.delete(&DeleteKey::Identity(id(2))).await, 2);
        assert!(cache.find_alts_of(&id(1)).await.is_empty());
        assert!(cache.identities_at("198.51.100.7").await.is_empty());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_address() {
        let cache = PlayerCache::new();
        cache.add(record(id(1), "203.0.113.5", 1, 10)).await.unwrap();
        cache.add(record(id(2), "203.0.113.5", 1, 10)).await.unwrap();
        cache.add(record(id(2), "198.51.100.7", 1, 10)).await.unwrap();

        let removed = cache
            .delete(&DeleteKey::Address("203.0.113.5".to_string()))
            .await;
        assert_eq!(removed, 2);
        assert!(cache.get(&id(1)).await.is_empty());
        assert_eq!(cache.get(&id(2)).await.len(), 1);
        assert!(cache.find_alts_of(&id(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let cache = PlayerCache::new();
        assert_eq!(cache.delete(&DeleteKey::Identity(id(1))).await, 0);
        assert_eq!(
            cache.delete(&DeleteKey::Address("10.0.0.1".to_string())).await,
            0
        );
    }

    #[tokio::test]
    async fn test_identities_at_canonicalizes() {
        let cache = PlayerCache::new();
        cache.add(record(id(1), "2001:db8::1", 1, 10)).await.unwrap();
        assert_eq!(
            cache.identities_at("2001:DB8:0:0:0:0:0:1").await,
            HashSet::from([id(1)])
        );
        assert!(cache.identities_at("not-an-ip").await.is_empty());
    }

    #[tokio::test]
    async fn test_record_sighting_counts() {
        let cache = PlayerCache::new();
        let first = cache
            .record_sighting(id(1), "203.0.113.5", "lobby-1", 100)
            .await
            .unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.created, 100);

        let second = cache
            .record_sighting(id(1), "203.0.113.5", "lobby-2", 200)
            .await
            .unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.created, 100);
        assert_eq!(second.server, "lobby-2");
        assert_eq!(cache.get(&id(1)).await, vec![second]);
    }

    #[tokio::test]
    async fn test_record_sighting_rejects_bad_address() {
        let cache = PlayerCache::new();
        let err = cache
            .record_sighting(id(1), "example.com", "lobby-1", 100)
            .await
            .unwrap_err();
        assert!(matches!(err, AltError::Validation(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_sightings_all_count() {
        let cache = Arc::new(PlayerCache::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .record_sighting(id(1), "203.0.113.5", "lobby-1", 100)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.get(&id(1)).await[0].count, 20);
    }

    #[tokio::test]
    async fn test_seed_skips_invalid() {
        let cache = PlayerCache::new();
        let mut bad = record(id(2), "10.0.0.1", 1, 10);
        bad.ip = "nope".to_string();
        let changed = cache
            .seed(vec![record(id(1), "10.0.0.1", 1, 10), bad])
            .await;
        assert_eq!(changed, 1);
        assert_eq!(cache.len().await, 1);
    }
}
