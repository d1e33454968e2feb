// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff schedules.
//!
//! One [`RetryConfig`] type serves two callers:
//! - the sync engine's backoff state machine, which only needs
//!   [`RetryConfig::delay_for`] to compute `backoff_until`;
//! - the HTTP remote's session restore loop, which drives [`retry`].
//!
//! # Example
//!
//! ```
//! use resource_sync::resilience::retry::RetryConfig;
//! use std::time::Duration;
//!
//! let config = RetryConfig {
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_millis(500),
//!     factor: 2.0,
//!     max_retries: Some(4),
//! };
//! assert_eq!(config.delay_for(0), Duration::from_millis(100));
//! assert_eq!(config.delay_for(2), Duration::from_millis(400));
//! assert_eq!(config.delay_for(3), Duration::from_millis(500)); // capped
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Exponential backoff parameters.
///
/// Presets:
/// - [`RetryConfig::query()`] - quick retry for individual requests
/// - [`RetryConfig::daemon()`] - never give up, capped at 5 minutes
/// - [`RetryConfig::session()`] - bounded session restore after a 401
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts before giving up (`None` = forever)
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Retries forever with exponential backoff capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Session restore: `attempts` tries, doubling from `initial_delay`.
    #[must_use]
    pub fn session(attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_retries: Some(attempts.max(1)),
            initial_delay,
            max_delay: initial_delay.saturating_mul(8),
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

    /// Delay before retry number `attempt` (0-based):
    /// `min(max_delay, initial_delay * factor^attempt)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Whether `attempts` consecutive failures exhaust this schedule.
    #[must_use]
    pub fn is_exhausted(&self, attempts: usize) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

/// Run `operation` until it succeeds or the schedule is exhausted.
///
/// The last error is returned on exhaustion.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: usize = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if config.is_exhausted(attempts) {
                    return Err(err);
                }

                let delay = config.delay_for(u32::try_from(attempts - 1).unwrap_or(u32::MAX));
                match config.max_retries {
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max,
                        error = %err,
                        ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        ?delay,
                        "Operation failed, will retry forever"
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
