// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the alt replication core.
//!
//! Errors are categorized by the component that produced them and carry
//! enough context to log them without the caller re-wrapping.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | SQL connectivity, timeouts, constraint violations |
//! | `Redis` | Yes | Pub/sub connection or publish failure |
//! | `Broker` | Yes | AMQP connection, channel or publish failure |
//! | `Validation` | No | Malformed identity or address (record is dropped) |
//! | `Decode` | No | Malformed inbound wire message (message is discarded) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The store never retries connectivity failures itself. The sync loop
//! treats any retryable error as "try again next tick"; write-path callers
//! receive the error and decide whether to surface it.

use thiserror::Error;

/// Result type alias for alt replication operations.
pub type Result<T> = std::result::Result<T, AltError>;

/// Errors that can occur in the replication core.
#[derive(Error, Debug)]
pub enum AltError {
    /// Identity token or IP literal failed validation.
    ///
    /// Always recoverable locally: the record is dropped and never
    /// reaches the store or the transports.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Durable store failure (SQLite or MySQL).
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Redis pub/sub transport error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// AMQP broker transport error.
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<lapin::Error>,
    },

    /// Inbound wire message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong engine state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AltError {
    /// Create a Redis error from a `redis::RedisError`.
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source.
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a broker error from a `lapin::Error`.
    pub fn broker(operation: impl Into<String>, source: lapin::Error) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source.
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) => true,
            Self::Redis { .. } => true,
            Self::Broker { .. } => true,
            Self::Validation(_) => false,
            Self::Decode(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error came from one of the replication transports.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Redis { .. } | Self::Broker { .. })
    }
}

impl From<redis::RedisError> for AltError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<lapin::Error> for AltError {
    fn from(e: lapin::Error) -> Self {
        Self::broker("unknown", e)
    }
}
