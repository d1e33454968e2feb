// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache, the offload engine and the sync engine.
//!
//! All durations are stored as milliseconds so the structs deserialize from
//! plain JSON/TOML; use the `Duration` accessors in code.
//!
//! # Example
//!
//! ```
//! use resource_sync::config::{EngineConfig, SyncConfig};
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.cache.max_size, 100);
//! assert_eq!(config.sync.base_poll_interval(), Duration::from_secs(30));
//!
//! // Tighter polling for a dashboard that shows ingest progress
//! let sync = SyncConfig {
//!     fast_poll_ms: 2_000,
//!     min_fetch_interval_ms: 500,
//!     ..Default::default()
//! };
//! assert_eq!(sync.fast_poll_interval(), Duration::from_secs(2));
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::retry::RetryConfig;

/// Aggregate configuration handed to [`crate::SyncContext`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Transform cache sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction (default: 100)
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Entry time-to-live in milliseconds (default: 5 minutes)
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_cache_max_size() -> usize { 100 }
fn default_cache_ttl_ms() -> u64 { 5 * 60 * 1000 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Compute offload settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    /// Dispatch work to the background worker (default: true).
    /// When false every task runs inline on the caller.
    #[serde(default = "default_offload_enabled")]
    pub enabled: bool,

    /// How long to wait for the worker before returning the input unchanged
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Datasets longer than this get sampling parameters merged into their config
    #[serde(default = "default_sample_threshold")]
    pub sample_threshold: usize,

    /// Number of points a sampled dataset is reduced to
    #[serde(default = "default_sample_target_points")]
    pub sample_target_points: usize,

    /// Bound on queued tasks waiting for the worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_offload_enabled() -> bool { true }
fn default_task_timeout_ms() -> u64 { 10_000 }
fn default_sample_threshold() -> usize { 10_000 }
fn default_sample_target_points() -> usize { 2_000 }
fn default_queue_depth() -> usize { 64 }

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_offload_enabled(),
            task_timeout_ms: default_task_timeout_ms(),
            sample_threshold: default_sample_threshold(),
            sample_target_points: default_sample_target_points(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl OffloadConfig {
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Resource sync engine settings.
///
/// Can be swapped at runtime through the `watch` channel passed to
/// [`crate::ResourceSyncEngine::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Poll interval while nothing is processing (default: 30s)
    #[serde(default = "default_base_poll_ms")]
    pub base_poll_ms: u64,

    /// Poll interval while at least one item is processing (default: 5s)
    #[serde(default = "default_fast_poll_ms")]
    pub fast_poll_ms: u64,

    /// Poll/push triggers closer than this to the last fetch are dropped
    #[serde(default = "default_min_fetch_interval_ms")]
    pub min_fetch_interval_ms: u64,

    /// First backoff delay after a retryable failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Consecutive retryable failures before the error flag is raised
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,

    /// Fields that participate in the content hash. Empty means all fields.
    #[serde(default)]
    pub hash_fields: Vec<String>,
}

fn default_base_poll_ms() -> u64 { 30_000 }
fn default_fast_poll_ms() -> u64 { 5_000 }
fn default_min_fetch_interval_ms() -> u64 { 1_000 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_max_fetch_retries() -> u32 { 5 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_poll_ms: default_base_poll_ms(),
            fast_poll_ms: default_fast_poll_ms(),
            min_fetch_interval_ms: default_min_fetch_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_fetch_retries: default_max_fetch_retries(),
            hash_fields: Vec::new(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn base_poll_interval(&self) -> Duration {
        Duration::from_millis(self.base_poll_ms)
    }

    #[must_use]
    pub fn fast_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fast_poll_ms)
    }

    #[must_use]
    pub fn min_fetch_interval(&self) -> Duration {
        Duration::from_millis(self.min_fetch_interval_ms)
    }

    /// Backoff schedule for failed fetches: `base * 2^n` capped at max.
    #[must_use]
    pub fn fetch_backoff(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            factor: 2.0,
            max_retries: Some(self.max_fetch_retries as usize),
        }
    }
}

/// HTTP remote settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the resources API (e.g., "https://api.example.com/v1")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Attempts made with a restored session after a 401 before giving up
    #[serde(default = "default_session_retries")]
    pub session_retries: usize,

    /// First delay between session restore attempts
    #[serde(default = "default_session_retry_delay_ms")]
    pub session_retry_delay_ms: u64,
}

fn default_base_url() -> String { "http://localhost:8000/api".to_string() }
fn default_request_timeout_ms() -> u64 { 15_000 }
fn default_session_retries() -> usize { 3 }
fn default_session_retry_delay_ms() -> u64 { 500 }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            session_retries: default_session_retries(),
            session_retry_delay_ms: default_session_retry_delay_ms(),
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Retry schedule for session restore after an authorization failure.
    #[must_use]
    pub fn session_retry(&self) -> RetryConfig {
        RetryConfig::session(
            self.session_retries,
            Duration::from_millis(self.session_retry_delay_ms),
        )
    }
}
