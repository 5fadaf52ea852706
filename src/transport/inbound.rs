// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound delta handling shared by both transport listeners.
//!
//! Nothing a remote node sends can crash a listener: malformed payloads,
//! invalid identities and our own echoes are logged, counted and dropped.

use super::TransportKind;
use crate::cache::{AddOutcome, PlayerCache};
use crate::metrics;
use crate::store::PlayerStore;
use crate::wire::{decode_delete, InfoMessage};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Upsert merged into the cache.
    Applied(AddOutcome),
    /// Delete applied; number of cached rows removed.
    Deleted(usize),
    /// Published by this node; discarded.
    SelfOrigin,
    /// Undecodable or invalid; discarded.
    Rejected,
}

/// Applies remote deltas to the local cache (and, for deletes, the store).
pub struct InboundApplier {
    cache: Arc<PlayerCache>,
    store: Option<Arc<PlayerStore>>,
    server_id: Uuid,
}

impl InboundApplier {
    pub fn new(cache: Arc<PlayerCache>, store: Option<Arc<PlayerStore>>, server_id: Uuid) -> Self {
        Self {
            cache,
            store,
            server_id,
        }
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// Handle a payload from an info (upsert) stream.
    pub async fn handle_info(&self, transport: TransportKind, payload: &[u8]) -> InboundOutcome {
        let message = match InfoMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(transport = %transport, error = %e, "Discarding undecodable info message");
                metrics::record_inbound_reject(transport.as_str(), "decode");
                return InboundOutcome::Rejected;
            }
        };

        match message.origin() {
            Ok(origin) if origin == self.server_id => {
                debug!(transport = %transport, uuid = %message.uuid, "Suppressing self-origin message");
                metrics::record_self_origin_suppressed(transport.as_str());
                return InboundOutcome::SelfOrigin;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(transport = %transport, error = %e, "Discarding info message with invalid origin");
                metrics::record_inbound_reject(transport.as_str(), "origin");
                return InboundOutcome::Rejected;
            }
        }

        let record = match message.into_record() {
            Ok(r) => r,
            Err(e) => {
                warn!(transport = %transport, error = %e, "Discarding invalid info message");
                metrics::record_inbound_reject(transport.as_str(), "validation");
                return InboundOutcome::Rejected;
            }
        };

        match self.cache.add(record).await {
            Ok(outcome) => {
                metrics::record_cache_apply(transport.as_str(), outcome.as_str());
                InboundOutcome::Applied(outcome)
            }
            Err(e) => {
                warn!(transport = %transport, error = %e, "Cache rejected inbound record");
                metrics::record_inbound_reject(transport.as_str(), "validation");
                InboundOutcome::Rejected
            }
        }
    }

    /// Handle a payload from a delete stream.
    ///
    /// Erasure requests can originate on any node, so the local store is
    /// purged too. A store failure is logged; the cache delete still holds.
    pub async fn handle_delete(&self, transport: TransportKind, payload: &[u8]) -> InboundOutcome {
        let key = match decode_delete(payload) {
            Ok(k) => k,
            Err(e) => {
                warn!(transport = %transport, error = %e, "Discarding invalid delete message");
                metrics::record_inbound_reject(transport.as_str(), "decode");
                return InboundOutcome::Rejected;
            }
        };

        let removed = self.cache.delete(&key).await;
        metrics::record_cache_delete(transport.as_str(), removed);

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&key).await {
                warn!(transport = %transport, key = %key, error = %e, "Failed to apply inbound delete to store");
            }
        }

        debug!(transport = %transport, key = %key, removed, "Applied inbound delete");
        InboundOutcome::Deleted(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PlayerData;
    use crate::wire::encode_info;

    const PLAYER: &str = "a1b2c3d4-0000-4000-8000-000000000001";

    fn applier(server_id: Uuid) -> (InboundApplier, Arc<PlayerCache>) {
        let cache = Arc::new(PlayerCache::new());
        (InboundApplier::new(cache.clone(), None, server_id), cache)
    }

    fn record() -> PlayerData {
        PlayerData::from_parts(PLAYER, "203.0.113.5", 2, "hub", 10, 20).unwrap()
    }

    #[tokio::test]
    async fn test_applies_remote_upsert() {
        let local = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let (applier, cache) = applier(local);

        let payload = encode_info(remote, &record()).unwrap();
        let outcome = applier.handle_info(TransportKind::CachePubSub, &payload).await;

        assert_eq!(outcome, InboundOutcome::Applied(AddOutcome::Inserted));
        assert_eq!(cache.get(&record().uuid).await, vec![record()]);
    }

    #[tokio::test]
    async fn test_suppresses_self_origin() {
        let local = Uuid::new_v4();
        let (applier, cache) = applier(local);

        let payload = encode_info(local, &record()).unwrap();
        let outcome = applier.handle_info(TransportKind::BrokerFanout, &payload).await;

        assert_eq!(outcome, InboundOutcome::SelfOrigin);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejects_malformed_payloads() {
        let (applier, cache) = applier(Uuid::new_v4());

        for payload in [&b"garbage"[..], b"", b"{}", b"[1,2,3]"] {
            let outcome = applier.handle_info(TransportKind::CachePubSub, payload).await;
            assert_eq!(outcome, InboundOutcome::Rejected);
        }
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejects_invalid_fields() {
        let (applier, cache) = applier(Uuid::new_v4());
        let payload = format!(
            r#"{{"id":"{}","uuid":"{}","ip":"999.999.999.999","count":1,"server":"s","created":1,"updated":1}}"#,
            Uuid::new_v4(),
            PLAYER
        );
        let outcome = applier
            .handle_info(TransportKind::CachePubSub, payload.as_bytes())
            .await;
        assert_eq!(outcome, InboundOutcome::Rejected);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_removes_rows() {
        let (applier, cache) = applier(Uuid::new_v4());
        cache.add(record()).await.unwrap();

        let outcome = applier
            .handle_delete(TransportKind::CachePubSub, PLAYER.as_bytes())
            .await;
        assert_eq!(outcome, InboundOutcome::Deleted(1));
        assert!(cache.is_empty().await);

        let outcome = applier
            .handle_delete(TransportKind::CachePubSub, b"not a key")
            .await;
        assert_eq!(outcome, InboundOutcome::Rejected);
    }
}
