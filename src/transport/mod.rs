// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication transports.
//!
//! Each configured transport is a [`DeltaSink`] for outbound deltas and runs
//! a listener task that feeds inbound deltas to an [`InboundApplier`]:
//!
//! | Kind | Module | Carrier | Fed by |
//! |------|--------|---------|--------|
//! | [`TransportKind::CachePubSub`] | [`pubsub`] | Pub/sub channels | Write path + sync loop |
//! | [`TransportKind::BrokerFanout`] | [`broker`] | AMQP fanout exchanges | Write path only |
//!
//! Transports hold no replicated state. A missing or failed transport only
//! means deltas take the slower reconciliation path.
//!
//! # Example
//!
//! ```rust,no_run
//! use alt_replication::transport::{BoxFuture, DeltaSink, TransportKind};
//! use alt_replication::{DeleteKey, PlayerData};
//!
//! struct LogSink;
//!
//! impl DeltaSink for LogSink {
//!     fn kind(&self) -> TransportKind {
//!         TransportKind::CachePubSub
//!     }
//!
//!     fn publish_upsert<'a>(&'a self, record: &'a PlayerData) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             println!("upsert {} {}", record.uuid, record.ip);
//!             Ok(())
//!         })
//!     }
//!
//!     fn publish_delete<'a>(&'a self, key: &'a DeleteKey) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             println!("delete {}", key);
//!             Ok(())
//!         })
//!     }
//!
//!     fn close(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

pub mod broker;
pub mod inbound;
pub mod pubsub;

pub use broker::BrokerTransport;
pub use inbound::{InboundApplier, InboundOutcome};
pub use pubsub::RedisTransport;

use crate::error::Result;
use crate::metrics;
use crate::record::{DeleteKey, PlayerData};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Which replication path a sink belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Pub/sub cache replication.
    CachePubSub,
    /// Fanout exchange broker.
    BrokerFanout,
}

impl TransportKind {
    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::CachePubSub => "redis",
            TransportKind::BrokerFanout => "broker",
        }
    }

    /// Whether the reconciliation loop relays queued rows through this kind.
    /// The broker is fed by writers only.
    pub fn relays_reconciliation(&self) -> bool {
        matches!(self, TransportKind::CachePubSub)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound half of a transport.
///
/// Publishing is fire-and-forget: `Ok` means the message was handed to the
/// carrier, not that any node received it.
pub trait DeltaSink: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Broadcast an upsert on the info stream.
    fn publish_upsert<'a>(&'a self, record: &'a PlayerData) -> BoxFuture<'a, ()>;

    /// Broadcast a delete on the delete stream.
    fn publish_delete<'a>(&'a self, key: &'a DeleteKey) -> BoxFuture<'a, ()>;

    /// Whether the carrier connection is currently usable.
    fn is_connected(&self) -> bool {
        true
    }

    /// Release the carrier connection. Must tolerate being called twice.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Publish an upsert to every sink accepted by `filter`.
///
/// Failures are logged and counted; one failing sink never stops the
/// others. Returns the number of sinks that accepted the message.
pub async fn publish_upsert_to(
    sinks: &[Arc<dyn DeltaSink>],
    record: &PlayerData,
    filter: impl Fn(TransportKind) -> bool,
) -> usize {
    let mut delivered = 0;
    for sink in sinks.iter().filter(|s| filter(s.kind())) {
        match sink.publish_upsert(record).await {
            Ok(()) => {
                delivered += 1;
                metrics::record_publish(sink.kind().as_str(), "info", true);
            }
            Err(e) => {
                metrics::record_publish(sink.kind().as_str(), "info", false);
                warn!(
                    transport = %sink.kind(),
                    uuid = %record.uuid,
                    ip = %record.ip,
                    error = %e,
                    "Failed to publish upsert"
                );
            }
        }
    }
    delivered
}

/// Publish a delete to every sink. Returns the number that accepted it.
pub async fn publish_delete_to(sinks: &[Arc<dyn DeltaSink>], key: &DeleteKey) -> usize {
    let mut delivered = 0;
    for sink in sinks {
        match sink.publish_delete(key).await {
            Ok(()) => {
                delivered += 1;
                metrics::record_publish(sink.kind().as_str(), "delete", true);
            }
            Err(e) => {
                metrics::record_publish(sink.kind().as_str(), "delete", false);
                warn!(transport = %sink.kind(), key = %key, error = %e, "Failed to publish delete");
            }
        }
    }
    delivered
}

/// Resolves once the owning transport flips `close_rx` to true. A sender
/// dropped without closing never resolves it; shutdown still applies.
pub(crate) async fn wait_for_close(mut close_rx: watch::Receiver<bool>) {
    while !*close_rx.borrow_and_update() {
        if close_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AltError;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Recording {
        kind: TransportKind,
        fail: bool,
        upserts: Mutex<Vec<PlayerData>>,
        deletes: Mutex<Vec<DeleteKey>>,
    }

    impl Recording {
        fn new(kind: TransportKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail,
                upserts: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeltaSink for Recording {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn publish_upsert<'a>(&'a self, record: &'a PlayerData) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if self.fail {
                    return Err(AltError::redis_msg("PUBLISH", "down"));
                }
                self.upserts.lock().unwrap().push(record.clone());
                Ok(())
            })
        }

        fn publish_delete<'a>(&'a self, key: &'a DeleteKey) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if self.fail {
                    return Err(AltError::broker_msg("basic_publish", "down"));
                }
                self.deletes.lock().unwrap().push(key.clone());
                Ok(())
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn record() -> PlayerData {
        PlayerData::new(Uuid::from_u128(1), "203.0.113.5", 1, "lobby", 1, 1).unwrap()
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(TransportKind::CachePubSub.as_str(), "redis");
        assert_eq!(TransportKind::BrokerFanout.to_string(), "broker");
        assert!(TransportKind::CachePubSub.relays_reconciliation());
        assert!(!TransportKind::BrokerFanout.relays_reconciliation());
    }

    #[tokio::test]
    async fn test_publish_upsert_filtered() {
        let redis = Recording::new(TransportKind::CachePubSub, false);
        let broker = Recording::new(TransportKind::BrokerFanout, false);
        let sinks: Vec<Arc<dyn DeltaSink>> = vec![redis.clone(), broker.clone()];

        let delivered = publish_upsert_to(&sinks, &record(), |k| k.relays_reconciliation()).await;
        assert_eq!(delivered, 1);
        assert_eq!(redis.upserts.lock().unwrap().len(), 1);
        assert!(broker.upserts.lock().unwrap().is_empty());

        let delivered = publish_upsert_to(&sinks, &record(), |_| true).await;
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let failing = Recording::new(TransportKind::CachePubSub, true);
        let healthy = Recording::new(TransportKind::BrokerFanout, false);
        let sinks: Vec<Arc<dyn DeltaSink>> = vec![failing, healthy.clone()];

        assert_eq!(publish_upsert_to(&sinks, &record(), |_| true).await, 1);

        let key = DeleteKey::Address("203.0.113.5".to_string());
        assert_eq!(publish_delete_to(&sinks, &key).await, 1);
        assert_eq!(healthy.deletes.lock().unwrap().as_slice(), &[key]);
    }

    #[tokio::test]
    async fn test_wait_for_close() {
        let (close_tx, close_rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_close(close_rx));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        close_tx.send_replace(true);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already closed before anyone waits
        wait_for_close(close_tx.subscribe()).await;
    }
}
