// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry with exponential backoff.
//!
//! Both replication transports connect through [`connect_with_retry`]: every
//! attempt is bounded by a timeout so an unreachable host cannot hang
//! startup, and failures back off exponentially up to `max_delay`.
//!
//! Once running, listeners keep their subscription alive with
//! [`resubscribe_until_shutdown`], which retries forever (at the capped
//! delay) until the shutdown signal arrives.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> alt_replication::Result<()> {
//! use alt_replication::resilience::{connect_with_retry, RetryConfig};
//!
//! let client = redis::Client::open("redis://localhost:6379")?;
//! let conn = connect_with_retry("redis", &RetryConfig::startup(), || {
//!     let client = client.clone();
//!     async move { Ok(client.get_connection_manager().await?) }
//! })
//! .await?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```

use crate::error::{AltError, Result};
use crate::metrics;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Bounded retry for connecting transports at engine start.
    ///
    /// A transport that still fails after this is left disabled and the
    /// engine runs degraded on the store and any other transport.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        500ms     500ms
    /// 2        750ms     1.25s
    /// 3        1.12s     2.37s
    /// 4        1.69s     4.06s
    /// 5        (give up)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Infinite retry for resubscribing a dropped listener.
    ///
    /// Retries forever with exponential backoff capped at 5 minutes; the
    /// listener task is cancelled by shutdown, not by giving up.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        // Long outages overflow the float (inf) well before the attempt counter
        Duration::try_from_secs_f64(delay_secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Run `connect` until it succeeds or `retry.max_attempts` is reached.
///
/// Each attempt is wrapped in `retry.connection_timeout`. The last error is
/// returned once attempts run out.
pub async fn connect_with_retry<T, F, Fut>(
    transport: &str,
    retry: &RetryConfig,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let last_error = match timeout(retry.connection_timeout, connect()).await {
            Ok(Ok(conn)) => {
                metrics::record_transport_connection(transport, true);
                if attempt > 1 {
                    info!(transport, attempt, "Connected after retry");
                } else {
                    info!(transport, "Connected");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => e,
            Err(_) => AltError::Internal(format!(
                "{} connection timed out after {}ms",
                transport,
                retry.connection_timeout.as_millis()
            )),
        };

        metrics::record_transport_connection(transport, false);

        if attempt >= retry.max_attempts {
            error!(
                transport,
                attempt,
                error = %last_error,
                "Failed to connect after max retries"
            );
            return Err(last_error);
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(
            transport,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "Connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// How a listener session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was signaled; do not resubscribe.
    Shutdown,
    /// The subscription dropped; resubscribe after backoff.
    Dropped,
}

/// Keep a subscription alive until shutdown.
///
/// `subscribe` opens a session (bounded by `retry.connection_timeout`) and
/// `run` consumes it until it ends. A failed subscribe or a dropped session
/// backs off per `retry` and tries again, indefinitely; the backoff resets
/// whenever a session opens. `listening` is true exactly while a session
/// is running.
pub async fn resubscribe_until_shutdown<T, S, SFut, R, RFut>(
    transport: &str,
    retry: &RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    listening: &AtomicBool,
    mut subscribe: S,
    mut run: R,
) where
    S: FnMut() -> SFut,
    SFut: Future<Output = Result<T>>,
    R: FnMut(T, watch::Receiver<bool>) -> RFut,
    RFut: Future<Output = SessionEnd>,
{
    // Mark initial shutdown value as seen so changed() only fires on actual changes
    let _ = shutdown_rx.borrow_and_update();
    let mut failures = 0usize;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let opened = match timeout(retry.connection_timeout, subscribe()).await {
            Ok(result) => result,
            Err(_) => Err(AltError::Internal(format!(
                "{} subscribe timed out after {}ms",
                transport,
                retry.connection_timeout.as_millis()
            ))),
        };

        match opened {
            Ok(session) => {
                if failures > 0 {
                    info!(transport, failures, "Resubscribed after failures");
                }
                failures = 0;
                metrics::record_transport_connection(transport, true);
                listening.store(true, Ordering::Release);
                let end = run(session, shutdown_rx.clone()).await;
                listening.store(false, Ordering::Release);

                if end == SessionEnd::Shutdown {
                    break;
                }
                warn!(transport, "Subscription dropped, resubscribing");
            }
            Err(e) => {
                metrics::record_transport_connection(transport, false);
                warn!(transport, attempt = failures + 1, error = %e, "Failed to subscribe");
            }
        }

        failures = failures.saturating_add(1);
        let delay = retry.delay_for_attempt(failures);
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = tokio::time::sleep(delay) => {}
        }
    }

    listening.store(false, Ordering::Release);
}
