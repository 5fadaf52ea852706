// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! The owner of every component, constructed once and handed its
//! dependencies explicitly:
//! - Durable store via [`crate::store::PlayerStore`]
//! - Local cache via [`crate::cache::PlayerCache`]
//! - Transports via [`crate::transport::DeltaSink`] and their listeners
//! - Reconciliation via [`sync_loop::run_sync_loop`]
//!
//! # Write Path
//!
//! ```text
//! record_sighting(uuid, ip)
//!   ├─ cache.record_sighting      (validated, merged under the cache lock)
//!   ├─ store.upsert               (merged row + queue entry, one transaction)
//!   ├─ cache.add(merged)          (store may know a higher count)
//!   └─ publish to every sink      (pub/sub and broker)
//! ```
//!
//! Store and transport failures never undo the cache write. Store errors
//! are returned to the caller after the broadcast; transport errors are
//! only logged.

mod sync_loop;
mod types;

pub use sync_loop::{run_sync_loop, run_sync_pass, SyncStats};
pub use types::{EngineState, HealthCheck};

use crate::cache::PlayerCache;
use crate::config::AltConfig;
use crate::error::{AltError, Result};
use crate::metrics;
use crate::record::{now_millis, DeleteKey, PlayerData};
use crate::resilience::RetryConfig;
use crate::store::PlayerStore;
use crate::transport::{
    publish_delete_to, publish_upsert_to, BrokerTransport, DeltaSink, InboundApplier,
    RedisTransport,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The alt-detection replication engine.
///
/// Owns the local cache, the durable store and the configured transports
/// for one server.
pub struct AltEngine {
    config: AltConfig,

    /// Retry policy for connecting transports at start
    retry: RetryConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    cache: Arc<PlayerCache>,

    /// Set by `start()`
    store: Option<Arc<PlayerStore>>,

    /// Connected transports plus any injected with `with_sink`
    sinks: Vec<Arc<dyn DeltaSink>>,

    /// Sinks added before start (not from config)
    injected: usize,

    /// Last queue id relayed by the sync loop
    checkpoint: Arc<AtomicI64>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Sync loop and listener tasks
    handles: Vec<JoinHandle<()>>,
}

impl AltEngine {
    /// Create an engine in the `Created` state. Nothing connects until
    /// [`start()`](Self::start).
    pub fn new(config: AltConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            retry: RetryConfig::startup(),
            state_tx,
            state_rx,
            cache: Arc::new(PlayerCache::new()),
            store: None,
            sinks: Vec::new(),
            injected: 0,
            checkpoint: Arc::new(AtomicI64::new(0)),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Override the transport connect retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Add an extra outbound sink alongside the configured transports.
    pub fn with_sink(mut self, sink: Arc<dyn DeltaSink>) -> Self {
        self.sinks.push(sink);
        self.injected += 1;
        self
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// This node's identifier, embedded in every outbound info message.
    pub fn server_id(&self) -> Uuid {
        self.config.server_id
    }

    pub fn config(&self) -> &AltConfig {
        &self.config
    }

    /// The local cache. Reads are always served from here.
    pub fn cache(&self) -> &Arc<PlayerCache> {
        &self.cache
    }

    /// The durable store, once started.
    pub fn store(&self) -> Option<&Arc<PlayerStore>> {
        self.store.as_ref()
    }

    /// Last queue id relayed by the sync loop.
    pub fn checkpoint(&self) -> i64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Start the engine.
    ///
    /// 1. Opens the store and creates tables (fatal on failure)
    /// 2. Seeds the cache from the store
    /// 3. Sets the checkpoint to the queue head
    /// 4. Connects configured transports (a failed transport is skipped)
    /// 5. Spawns listeners and the sync loop
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(AltError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            server_id = %self.config.server_id,
            server_name = %self.config.server_name,
            dialect = self.config.storage.dialect.name(),
            redis = self.config.redis.is_some(),
            rabbitmq = self.config.rabbitmq.is_some(),
            "Starting alt engine"
        );
        self.set_state(EngineState::Starting);

        let store = match self.open_store().await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to initialize store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let rows = match store.load_all().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to load stored rows");
                store.close().await;
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        let seeded = self.cache.seed(rows).await;

        // Everything up to here is already in the cache; relay only newer rows
        let head = match store.latest_checkpoint().await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "Failed to read queue head, relaying from start");
                0
            }
        };
        self.checkpoint.store(head, Ordering::Release);
        metrics::set_sync_checkpoint(head);

        info!(seeded, checkpoint = head, "Cache seeded from store");

        let applier = Arc::new(InboundApplier::new(
            self.cache.clone(),
            Some(store.clone()),
            self.config.server_id,
        ));
        self.connect_transports(&applier).await;

        let handle = tokio::spawn(run_sync_loop(
            store.clone(),
            self.cache.clone(),
            self.sinks.clone(),
            self.config.sync.clone(),
            self.config.storage.fetch_batch_size as usize,
            self.checkpoint.clone(),
            self.shutdown_rx.clone(),
        ));
        self.handles.push(handle);
        info!("Spawned sync loop");

        self.store = Some(store);
        self.set_state(EngineState::Running);
        info!(
            transports = self.sinks.len(),
            configured = self.transports_configured(),
            "Alt engine running"
        );

        Ok(())
    }

    async fn open_store(&self) -> Result<PlayerStore> {
        let store = PlayerStore::connect(&self.config.storage).await?;
        if let Err(e) = store.initialize_schema().await {
            store.close().await;
            return Err(e);
        }
        info!(dialect = store.dialect(), "Store initialized");
        Ok(store)
    }

    /// Connect every configured transport and spawn its listener. A
    /// transport that fails to connect is left out; the engine runs
    /// degraded on the store and whatever else connected.
    async fn connect_transports(&mut self, applier: &Arc<InboundApplier>) {
        let server_id = self.config.server_id;

        if let Some(redis) = &self.config.redis {
            match RedisTransport::connect(redis, server_id, &self.retry).await {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    self.handles
                        .push(transport.spawn_listener(applier.clone(), self.shutdown_rx.clone()));
                    self.sinks.push(transport);
                    info!("Spawned Redis listener");
                }
                Err(e) => {
                    warn!(error = %e, "Redis transport unavailable, continuing without it");
                }
            }
        }

        if let Some(rabbit) = &self.config.rabbitmq {
            match BrokerTransport::connect(rabbit, server_id, &self.retry).await {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    self.handles
                        .push(transport.spawn_listener(applier.clone(), self.shutdown_rx.clone()));
                    self.sinks.push(transport);
                    info!("Spawned broker listener");
                }
                Err(e) => {
                    warn!(error = %e, "Broker transport unavailable, continuing without it");
                }
            }
        }

        metrics::set_connected_transports(self.sinks.len());
    }

    fn transports_configured(&self) -> usize {
        usize::from(self.config.redis.is_some())
            + usize::from(self.config.rabbitmq.is_some())
            + self.injected
    }

    fn ensure_running(&self) -> Result<&Arc<PlayerStore>> {
        match (self.state(), &self.store) {
            (EngineState::Running, Some(store)) => Ok(store),
            (EngineState::ShuttingDown | EngineState::Stopped, _) => Err(AltError::Shutdown),
            (state, _) => Err(AltError::InvalidState {
                expected: "Running".to_string(),
                actual: state.to_string(),
            }),
        }
    }

    /// Record that `uuid` was seen at `ip` on this server.
    ///
    /// The cache is updated before anything else, so reads reflect the
    /// sighting even if the store then fails. Returns the row as merged by
    /// the store.
    pub async fn record_sighting(&self, uuid: Uuid, ip: &str) -> Result<PlayerData> {
        let store = self.ensure_running()?;

        let local = match self
            .cache
            .record_sighting(uuid, ip, &self.config.server_name, now_millis())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(uuid = %uuid, ip, error = %e, "Rejected sighting");
                metrics::record_sighting("rejected");
                return Err(e);
            }
        };

        match store.upsert(&local).await {
            Ok(merged) => {
                if merged != local {
                    // Another node already persisted a higher count
                    if let Err(e) = self.cache.add(merged.clone()).await {
                        warn!(uuid = %uuid, error = %e, "Failed to apply merged row to cache");
                    }
                }
                publish_upsert_to(&self.sinks, &merged, |_| true).await;
                metrics::record_sighting("recorded");
                debug!(uuid = %uuid, ip = %merged.ip, count = merged.count, "Recorded sighting");
                Ok(merged)
            }
            Err(e) => {
                warn!(uuid = %uuid, ip = %local.ip, error = %e, "Failed to persist sighting");
                publish_upsert_to(&self.sinks, &local, |_| true).await;
                metrics::record_sighting("store_error");
                Err(e)
            }
        }
    }

    /// Every identity sharing an address with `uuid`, excluding `uuid`.
    pub async fn alts_of(&self, uuid: &Uuid) -> HashSet<Uuid> {
        self.cache.find_alts_of(uuid).await
    }

    /// Every identity seen at `ip`.
    pub async fn alts_at(&self, ip: &str) -> HashSet<Uuid> {
        self.cache.identities_at(ip).await
    }

    /// All cached rows for `uuid`.
    pub async fn get(&self, uuid: &Uuid) -> Vec<PlayerData> {
        self.cache.get(uuid).await
    }

    /// Erase every row matching `key` on this node and broadcast the delete.
    ///
    /// Returns the number of cached rows removed. A store failure is
    /// returned after the cache delete and broadcast have happened.
    pub async fn delete(&self, key: &DeleteKey) -> Result<usize> {
        let store = self.ensure_running()?;

        let removed = self.cache.delete(key).await;
        metrics::record_cache_delete("local", removed);

        let stored = store.delete(key).await;
        publish_delete_to(&self.sinks, key).await;

        match stored {
            Ok(rows) => {
                info!(key = %key, cached = removed, stored = rows, "Deleted rows");
                Ok(removed)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete rows from store");
                Err(e)
            }
        }
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Performs no network I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let store_open = self.store.as_ref().is_some_and(|s| !s.is_closed());

        HealthCheck {
            state,
            ready: state == EngineState::Running && store_open,
            store_dialect: self.store.as_ref().map(|s| s.dialect()),
            transports_configured: self.transports_configured(),
            transports_connected: self.sinks.iter().filter(|s| s.is_connected()).count(),
            cache_rows: self.cache.len().await,
            last_checkpoint: self.checkpoint(),
        }
    }

    /// Shut the engine down.
    ///
    /// Every step runs even if an earlier one fails:
    /// 1. Signal the sync loop and listeners to stop
    /// 2. Wait up to `shutdown_grace` for them, then abort stragglers
    /// 3. Close the store
    /// 4. Close transports (broker channel, then connection)
    ///
    /// Tasks finish before the store closes, so an in-flight sync pass or
    /// inbound delete never runs against a closed pool.
    pub async fn shutdown(&mut self) {
        match self.state() {
            EngineState::Stopped => return,
            EngineState::Created => {
                self.set_state(EngineState::Stopped);
                return;
            }
            _ => {}
        }

        info!("Shutting down alt engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        let deadline = tokio::time::Instant::now() + self.config.sync.shutdown_grace_duration();
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(store) = &self.store {
            store.close().await;
        }

        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                warn!(transport = %sink.kind(), error = %e, "Failed to close transport");
            }
        }
        metrics::set_connected_transports(0);

        self.set_state(EngineState::Stopped);
        info!("Alt engine stopped");
    }
}
