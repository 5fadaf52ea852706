// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the state machine for the engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (schema ready, cache seeded)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────────── ShuttingDown
//!
//! Starting ──(store unreachable / schema failure)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `AltEngine::new()`. Nothing connected.
//! - **Starting**: `start()` called. Store opening, cache seeding, transports connecting.
//! - **Running**: Sync loop and transport listeners active.
//! - **ShuttingDown**: `shutdown()` called. Tasks draining within the grace period.
//! - **Stopped**: Teardown complete. Safe to drop.
//! - **Failed**: Startup failed fatally. Check logs; the engine cannot be restarted.

/// State of the engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::AltEngine::start) to begin replicating.
    Created,

    /// Opening the store, seeding the cache and connecting transports.
    Starting,

    /// Running and replicating.
    ///
    /// Local sightings are persisted and broadcast; the sync loop polls
    /// the store queue every interval.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Startup failed fatally (schema creation, store unreachable).
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health snapshot. Collected without network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,

    /// Running with the store open. Transports are optional, so a node with
    /// every transport down is still ready (it replicates via the store).
    pub ready: bool,

    /// Store dialect in use, `None` before start.
    pub store_dialect: Option<&'static str>,

    /// Transports present in config.
    pub transports_configured: usize,

    /// Transports that connected and have not been closed.
    pub transports_connected: usize,

    /// `(identity, address)` rows in the local cache.
    pub cache_rows: usize,

    /// Last queue id the sync loop published up to.
    pub last_checkpoint: i64,
}

impl HealthCheck {
    /// Ready and every configured transport connected.
    pub fn fully_connected(&self) -> bool {
        self.ready && self.transports_connected == self.transports_configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }

    #[test]
    fn test_fully_connected() {
        let mut health = HealthCheck {
            state: EngineState::Running,
            ready: true,
            store_dialect: Some("sqlite"),
            transports_configured: 2,
            transports_connected: 1,
            cache_rows: 0,
            last_checkpoint: 0,
        };
        assert!(!health.fully_connected());

        health.transports_connected = 2;
        assert!(health.fully_connected());

        health.ready = false;
        assert!(!health.fully_connected());
    }
}
