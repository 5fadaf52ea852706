// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Alt Replication
//!
//! Alt-account detection core for a network of game servers. Each server
//! records which player identities connect from which IP addresses; two
//! identities that share an address are alts of each other. Sightings are
//! replicated between servers so every node answers alt queries locally.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                               AltEngine                                │
//! │                                                                        │
//! │  record_sighting ──► PlayerCache ──► PlayerStore ──► DeltaSinks        │
//! │                      (RwLock +      (SQLite or      (Redis pub/sub,    │
//! │                       alt index)     MySQL, queue)   RabbitMQ fanout)  │
//! │                          ▲                │                 │          │
//! │                          │                ▼                 ▼          │
//! │                  InboundApplier ◄─── sync loop      other servers      │
//! │                  (listeners)        (queue relay)                      │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Three Replication Paths
//!
//! 1. **Pub/sub** (`transport::pubsub`): low-latency broadcast of upserts and deletes
//! 2. **Broker** (`transport::broker`): AMQP fanout, self-origin messages dropped
//! 3. **Reconciliation** (`coordinator::run_sync_loop`): polls the shared SQL queue
//!    and republishes over pub/sub, covering missed messages and offline nodes
//!
//! The SQL store is the source of truth. Transports are optional and a node
//! with none configured still converges through the store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use alt_replication::{AltConfig, AltEngine};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AltConfig::default();
//!     let mut engine = AltEngine::new(config);
//!     engine.start().await.expect("Failed to start");
//!
//!     let player = Uuid::new_v4();
//!     engine.record_sighting(player, "203.0.113.5").await.ok();
//!     let alts = engine.alts_of(&player).await;
//!     println!("{} alts", alts.len());
//!
//!     engine.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod store;
pub mod transport;
pub mod validation;
pub mod wire;

// Re-exports for convenience
pub use cache::{AddOutcome, PlayerCache};
pub use config::{AltConfig, RabbitConfig, RedisConfig, SqlDialect, StorageConfig, SyncConfig};
pub use coordinator::{AltEngine, EngineState, HealthCheck};
pub use error::{AltError, Result};
pub use record::{DeleteKey, FetchResult, PlayerData};
pub use store::PlayerStore;
pub use transport::{DeltaSink, TransportKind};
