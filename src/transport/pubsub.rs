// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pub/sub cache-replication transport (Redis).
//!
//! Publishing goes through a `ConnectionManager`, which reconnects on its
//! own. Subscribing needs a dedicated connection, so the listener task owns
//! one and rebuilds it with backoff whenever the message stream ends.
//!
//! # Channels
//!
//! ```text
//! altfndr-info    JSON InfoMessage (upsert)
//! altfndr-delete  bare identity token or IP literal
//! ```
//!
//! Delivery is at-most-once: Redis drops messages for disconnected
//! subscribers. The reconciliation loop covers the gap.

use super::{wait_for_close, BoxFuture, DeltaSink, InboundApplier, TransportKind};
use crate::config::RedisConfig;
use crate::error::{AltError, Result};
use crate::record::{DeleteKey, PlayerData};
use crate::resilience::{connect_with_retry, resubscribe_until_shutdown, RetryConfig, SessionEnd};
use crate::wire::{encode_delete, encode_info};
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

/// Redis pub/sub transport.
pub struct RedisTransport {
    config: RedisConfig,
    client: Client,
    /// Publishing connection; taken (and dropped) by `close`.
    conn: Mutex<Option<ConnectionManager>>,
    server_id: Uuid,
    closed: AtomicBool,
    /// Flipped by `close` to cancel the subscription.
    close_tx: watch::Sender<bool>,
    listening: Arc<AtomicBool>,
}

impl RedisTransport {
    /// Connect the publishing side, retrying per `retry`.
    pub async fn connect(config: &RedisConfig, server_id: Uuid, retry: &RetryConfig) -> Result<Self> {
        info!(url = %config.url, info = %config.info_channel, delete = %config.delete_channel, "Connecting Redis transport");

        let client = Client::open(config.url.as_str())
            .map_err(|e| AltError::Config(format!("Invalid Redis URL: {}", e)))?;

        let conn = connect_with_retry("redis", retry, || {
            let client = client.clone();
            async move {
                client
                    .get_connection_manager()
                    .await
                    .map_err(|e| AltError::redis("connect", e))
            }
        })
        .await?;

        Ok(Self {
            config: config.clone(),
            client,
            conn: Mutex::new(Some(conn)),
            server_id,
            closed: AtomicBool::new(false),
            close_tx: watch::channel(false).0,
            listening: Arc::new(AtomicBool::new(false)),
        })
    }

    /// True while the listener holds a live subscription.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Spawn the subscriber task. It runs until `shutdown` flips to true or
    /// the transport is closed, resubscribing with backoff when the
    /// subscription drops.
    pub fn spawn_listener(
        &self,
        applier: Arc<InboundApplier>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let info_channel = self.config.info_channel.clone();
        let delete_channel = self.config.delete_channel.clone();
        let listening = self.listening.clone();
        let close_rx = self.close_tx.subscribe();
        let span = tracing::info_span!("redis_listener", info = %info_channel, delete = %delete_channel);

        tokio::spawn(
            async move {
                info!("Starting Redis listener");

                let retry_config = RetryConfig::daemon();

                let resubscribe = resubscribe_until_shutdown(
                    "redis",
                    &retry_config,
                    shutdown_rx,
                    &listening,
                    || {
                        let client = client.clone();
                        let info_channel = info_channel.clone();
                        let delete_channel = delete_channel.clone();
                        async move { subscribe(&client, &info_channel, &delete_channel).await }
                    },
                    |pubsub, shutdown_rx| {
                        listen(
                            pubsub,
                            applier.clone(),
                            info_channel.clone(),
                            delete_channel.clone(),
                            shutdown_rx,
                        )
                    },
                );

                tokio::select! {
                    _ = resubscribe => {}
                    _ = wait_for_close(close_rx) => {
                        info!("Redis transport closed, cancelling subscription");
                    }
                }

                listening.store(false, Ordering::Release);
                info!("Redis listener stopped");
            }
            .instrument(span),
        )
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let conn = match self.conn.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(mut conn) = conn.filter(|_| !self.closed.load(Ordering::Acquire)) else {
            return Err(AltError::redis_msg("PUBLISH", "transport closed"));
        };
        let _receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| AltError::redis("PUBLISH", e))?;
        Ok(())
    }
}

async fn subscribe(client: &Client, info_channel: &str, delete_channel: &str) -> Result<PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| AltError::redis("SUBSCRIBE", e))?;
    pubsub
        .subscribe(info_channel)
        .await
        .map_err(|e| AltError::redis("SUBSCRIBE", e))?;
    pubsub
        .subscribe(delete_channel)
        .await
        .map_err(|e| AltError::redis("SUBSCRIBE", e))?;
    info!("Subscribed to Redis channels");
    Ok(pubsub)
}

/// Apply messages from one subscription until it drops or shutdown.
async fn listen(
    mut pubsub: PubSub,
    applier: Arc<InboundApplier>,
    info_channel: String,
    delete_channel: String,
    mut shutdown_rx: watch::Receiver<bool>,
) -> SessionEnd {
    let messages = pubsub.on_message();
    tokio::pin!(messages);

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping Redis listener");
                    return SessionEnd::Shutdown;
                }
            }

            msg = messages.next() => {
                let Some(msg) = msg else {
                    return SessionEnd::Dropped;
                };
                let channel = msg.get_channel_name();
                let payload = msg.get_payload_bytes();
                if channel == info_channel {
                    applier.handle_info(TransportKind::CachePubSub, payload).await;
                } else if channel == delete_channel {
                    applier.handle_delete(TransportKind::CachePubSub, payload).await;
                } else {
                    debug!(channel, "Ignoring message on unexpected channel");
                }
            }
        }
    }
}

impl DeltaSink for RedisTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CachePubSub
    }

    fn publish_upsert<'a>(&'a self, record: &'a PlayerData) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = encode_info(self.server_id, record)?;
            self.publish(&self.config.info_channel, payload).await
        })
    }

    fn publish_delete<'a>(&'a self, key: &'a DeleteKey) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.publish(&self.config.delete_channel, encode_delete(key))
                .await
        })
    }

    /// Publishing reconnects on its own, so this tracks the subscription.
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.is_listening()
    }

    /// Drop the publishing connection and cancel the subscription.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let conn = match self.conn.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            drop(conn);
            self.close_tx.send_replace(true);
            info!("Redis transport closed");
            Ok(())
        })
    }
}
