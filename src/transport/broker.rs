// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fanout broker transport (AMQP).
//!
//! # Topology
//!
//! ```text
//! exchange altfndr-info   (fanout) ──► exclusive auto-delete queue ──► this node
//! exchange altfndr-delete (fanout) ──► exclusive auto-delete queue ──► this node
//! ```
//!
//! Every node declares both exchanges and binds its own server-named
//! queues, so each message reaches every node, including the publisher.
//! Info messages carry the publisher's server id and a node drops its own.
//!
//! Consumers use auto-ack. A crash loses whatever was in flight; the
//! durable store and reconciliation loop are the durability guarantee,
//! this path only lowers latency.

use super::{wait_for_close, BoxFuture, DeltaSink, InboundApplier, TransportKind};
use crate::config::RabbitConfig;
use crate::error::{AltError, Result};
use crate::record::{DeleteKey, PlayerData};
use crate::resilience::{connect_with_retry, resubscribe_until_shutdown, RetryConfig, SessionEnd};
use crate::wire::{encode_delete, encode_info};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Reply code sent with a normal channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// Which logical stream a consumer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Info,
    Delete,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Stream::Info => "info",
            Stream::Delete => "delete",
        }
    }
}

/// The connection and the single channel publishing and consuming share.
/// Replaced wholesale when the listener has to reopen.
struct Link {
    connection: Arc<Connection>,
    channel: Channel,
}

/// One consumer per stream, bound on the same channel.
struct Consumers {
    info: Consumer,
    delete: Consumer,
}

/// Everything the listener needs to rebind after a failure.
#[derive(Clone)]
struct Rebind {
    config: RabbitConfig,
    server_id: Uuid,
    link: Arc<Mutex<Link>>,
    pending: Arc<Mutex<Option<Consumers>>>,
    closed: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// AMQP fanout transport.
pub struct BrokerTransport {
    config: RabbitConfig,
    server_id: Uuid,
    link: Arc<Mutex<Link>>,
    /// Consumers bound at connect time, taken by the first listener session.
    pending: Arc<Mutex<Option<Consumers>>>,
    closed: Arc<AtomicBool>,
    /// Flipped by `close` to stop the listener.
    close_tx: watch::Sender<bool>,
    listening: Arc<AtomicBool>,
}

impl BrokerTransport {
    /// Connect, declare both exchanges and start consuming.
    ///
    /// Deliveries buffer in the consumers until
    /// [`spawn_listener`](Self::spawn_listener) is called.
    pub async fn connect(config: &RabbitConfig, server_id: Uuid, retry: &RetryConfig) -> Result<Self> {
        info!(
            info = %config.info_exchange,
            delete = %config.delete_exchange,
            "Connecting broker transport"
        );

        let url = config.url.clone();
        let connection = connect_with_retry("broker", retry, || {
            let url = url.clone();
            async move {
                Connection::connect(&url, ConnectionProperties::default())
                    .await
                    .map_err(|e| AltError::broker("connect", e))
            }
        })
        .await?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AltError::broker("create_channel", e))?;
        let consumers = bind_consumers(&channel, config, server_id).await?;

        Ok(Self {
            config: config.clone(),
            server_id,
            link: Arc::new(Mutex::new(Link {
                connection: Arc::new(connection),
                channel,
            })),
            pending: Arc::new(Mutex::new(Some(consumers))),
            closed: Arc::new(AtomicBool::new(false)),
            close_tx: watch::channel(false).0,
            listening: Arc::new(AtomicBool::new(false)),
        })
    }

    /// True while the listener is consuming both streams.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Spawn the consumer task. It runs until `shutdown` flips to true or
    /// the transport is closed. When a consumer fails (channel closed by
    /// the broker, connection lost) it reopens the channel, reconnecting if
    /// needed, and binds fresh queues with backoff.
    pub fn spawn_listener(
        &self,
        applier: Arc<InboundApplier>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let rebind = Rebind {
            config: self.config.clone(),
            server_id: self.server_id,
            link: self.link.clone(),
            pending: self.pending.clone(),
            closed: self.closed.clone(),
        };
        let listening = self.listening.clone();
        let close_rx = self.close_tx.subscribe();
        let span = tracing::info_span!(
            "broker_listener",
            info = %self.config.info_exchange,
            delete = %self.config.delete_exchange
        );

        tokio::spawn(
            async move {
                info!("Starting broker consumer");

                let retry_config = RetryConfig::daemon();

                let resubscribe = resubscribe_until_shutdown(
                    "broker",
                    &retry_config,
                    shutdown_rx,
                    &listening,
                    || {
                        let rebind = rebind.clone();
                        async move { open_session(&rebind).await }
                    },
                    |consumers, shutdown_rx| consume(consumers, applier.clone(), shutdown_rx),
                );

                tokio::select! {
                    _ = resubscribe => {}
                    _ = wait_for_close(close_rx) => {
                        info!("Broker transport closed, stopping consumer");
                    }
                }

                listening.store(false, Ordering::Release);
                info!("Broker consumer stopped");
            }
            .instrument(span),
        )
    }

    async fn publish(&self, exchange: &str, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AltError::broker_msg("basic_publish", "transport closed"));
        }
        let channel = lock(&self.link).channel.clone();
        channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| AltError::broker("basic_publish", e))?;
        Ok(())
    }
}

/// Declare `exchange` as fanout, bind a fresh exclusive queue to it and
/// start an auto-ack consumer on that queue.
async fn bind_consumer(
    channel: &Channel,
    exchange: &str,
    server_id: Uuid,
    stream: Stream,
) -> Result<Consumer> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| AltError::broker("exchange_declare", e))?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| AltError::broker("queue_declare", e))?;

    channel
        .queue_bind(
            queue.name().as_str(),
            exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| AltError::broker("queue_bind", e))?;

    let consumer = channel
        .basic_consume(
            queue.name().as_str(),
            &format!("{}-{}", server_id, stream.as_str()),
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| AltError::broker("basic_consume", e))?;

    info!(exchange, queue = %queue.name(), "Bound broker queue");
    Ok(consumer)
}

async fn bind_consumers(channel: &Channel, config: &RabbitConfig, server_id: Uuid) -> Result<Consumers> {
    Ok(Consumers {
        info: bind_consumer(channel, &config.info_exchange, server_id, Stream::Info).await?,
        delete: bind_consumer(channel, &config.delete_exchange, server_id, Stream::Delete).await?,
    })
}

/// Hand out the consumers bound at connect, or rebind on a fresh channel.
async fn open_session(rebind: &Rebind) -> Result<Consumers> {
    let bound = lock(&rebind.pending).take();
    if let Some(consumers) = bound {
        return Ok(consumers);
    }
    let channel = reopen_channel(rebind).await?;
    bind_consumers(&channel, &rebind.config, rebind.server_id).await
}

/// Replace the shared channel, reconnecting first if the connection is gone.
/// A still-open old channel is closed so its consumers stop.
async fn reopen_channel(rebind: &Rebind) -> Result<Channel> {
    let (connection, stale) = {
        let link = lock(&rebind.link);
        (link.connection.clone(), link.channel.clone())
    };

    if stale.status().connected() {
        if let Err(e) = stale.close(REPLY_SUCCESS, "rebind").await {
            if !is_already_closed(&e) {
                debug!(error = %e, "Failed to close stale broker channel");
            }
        }
    }

    let connection = if connection.status().connected() {
        connection
    } else {
        info!("Broker connection lost, reconnecting");
        Arc::new(
            Connection::connect(&rebind.config.url, ConnectionProperties::default())
                .await
                .map_err(|e| AltError::broker("connect", e))?,
        )
    };

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| AltError::broker("create_channel", e))?;

    *lock(&rebind.link) = Link {
        connection: connection.clone(),
        channel: channel.clone(),
    };

    // close() may have run while we were reconnecting
    if rebind.closed.load(Ordering::Acquire) {
        let _ = connection.close(REPLY_SUCCESS, "shutdown").await;
        return Err(AltError::broker_msg("reopen", "transport closed"));
    }

    Ok(channel)
}

/// Apply deliveries from both consumers until one ends or shutdown.
async fn consume(
    mut consumers: Consumers,
    applier: Arc<InboundApplier>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping broker consumer");
                    return SessionEnd::Shutdown;
                }
            }

            delivery = consumers.info.next() => match delivery {
                Some(Ok(delivery)) => {
                    applier.handle_info(TransportKind::BrokerFanout, &delivery.data).await;
                }
                ended => return consumer_ended(Stream::Info, ended),
            },

            delivery = consumers.delete.next() => match delivery {
                Some(Ok(delivery)) => {
                    applier.handle_delete(TransportKind::BrokerFanout, &delivery.data).await;
                }
                ended => return consumer_ended(Stream::Delete, ended),
            },
        }
    }
}

fn consumer_ended(stream: Stream, ended: Option<lapin::Result<Delivery>>) -> SessionEnd {
    match ended {
        Some(Err(e)) => warn!(stream = stream.as_str(), error = %e, "Broker consumer failed"),
        _ => warn!(stream = stream.as_str(), "Broker consumer cancelled"),
    }
    SessionEnd::Dropped
}

/// Channel or connection already closed (by us, the peer, or a failure).
fn is_already_closed(e: &lapin::Error) -> bool {
    matches!(
        e,
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
    )
}

impl DeltaSink for BrokerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::BrokerFanout
    }

    fn publish_upsert<'a>(&'a self, record: &'a PlayerData) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = encode_info(self.server_id, record)?;
            self.publish(&self.config.info_exchange, &payload).await
        })
    }

    fn publish_delete<'a>(&'a self, key: &'a DeleteKey) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.publish(&self.config.delete_exchange, &encode_delete(key))
                .await
        })
    }

    /// Connected only while the consumer is live, not merely the socket.
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.is_listening()
            && lock(&self.link).connection.status().connected()
    }

    /// Stop the listener, then close the channel, then the connection.
    /// Every step always runs and "already closed" is not an error.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.close_tx.send_replace(true);

            let (connection, channel) = {
                let link = lock(&self.link);
                (link.connection.clone(), link.channel.clone())
            };
            let mut first_error = None;

            if let Err(e) = channel.close(REPLY_SUCCESS, "shutdown").await {
                if !is_already_closed(&e) {
                    warn!(error = %e, "Failed to close broker channel");
                    first_error = Some(AltError::broker("channel_close", e));
                }
            }

            if let Err(e) = connection.close(REPLY_SUCCESS, "shutdown").await {
                if !is_already_closed(&e) {
                    warn!(error = %e, "Failed to close broker connection");
                    first_error.get_or_insert(AltError::broker("connection_close", e));
                }
            }

            info!("Broker transport closed");
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}
