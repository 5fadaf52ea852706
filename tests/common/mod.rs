// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis, MySQL and RabbitMQ testcontainer setup
//! - A recording `DeltaSink` for asserting on outbound deltas
//! - Polling helpers for eventually-consistent assertions

#![allow(dead_code)]

pub mod containers;
pub mod mock_sink;

pub use containers::*;
pub use mock_sink::*;

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 50ms until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
