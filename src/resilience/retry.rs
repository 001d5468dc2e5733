// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff.
//!
//! Presets cover the three waits the engine performs:
//!
//! ```
//! use patient_id_engine::RetryConfig;
//!
//! // Connecting at startup: fail fast on bad config
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//!
//! // Durable transaction conflicts: a few quick attempts
//! assert_eq!(RetryConfig::query().max_retries, Some(5));
//!
//! // Fast-path lock: short spin, then fall back
//! assert_eq!(RetryConfig::lock_wait().max_retries, Some(4));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts. `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Initial backend connection: 5 attempts, ~3s worst case.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Serialization/deadlock retries around the durable transaction.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Fast-path lock acquisition. Kept well under the lock TTL: contention
    /// beyond this is resolved by the durable fallback instead.
    #[must_use]
    pub fn lock_wait() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    #[must_use]
    pub fn total_backoff(&self) -> Option<Duration> {
        let attempts = self.max_retries?;
        let mut delay = self.initial_delay;
        let mut total = Duration::ZERO;
        for _ in 1..attempts {
            total += delay;
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        Some(total)
    }
}

/// Retry `operation` on every error.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, operation, |_| true).await
}

/// Retry `operation` while `should_retry` accepts the error; any other
/// error is returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    debug!(operation = operation_name, error = %err, "Non-retryable error");
                    return Err(err);
                }

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_delay = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_delay = ?delay,
                        "Operation failed, retrying forever"
                    ),
                }

                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
