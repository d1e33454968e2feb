// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for resource-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `resource_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `cache`: `transform` (namespaces of the keyed cache)
//! - `task`: offload task name
//! - `trigger`: poll, caller, push
//! - `outcome`: hit, miss, updated, unchanged, error, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// KEYED CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup
pub fn record_cache_lookup(cache: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "resource_sync_cache_lookups_total",
        "cache" => cache.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record entries removed from the cache
pub fn record_cache_eviction(cache: &str, reason: &'static str, count: usize) {
    counter!(
        "resource_sync_cache_evictions_total",
        "cache" => cache.to_string(),
        "reason" => reason
    )
    .increment(count as u64);
}

/// Set current cache entry count
pub fn set_cache_entries(cache: &str, count: usize) {
    gauge!(
        "resource_sync_cache_entries",
        "cache" => cache.to_string()
    )
    .set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLOAD
// ═══════════════════════════════════════════════════════════════════════════

/// Record how an offload task finished (offloaded, inline, timeout, error, cached)
pub fn record_offload(task: &str, outcome: &'static str) {
    counter!(
        "resource_sync_offload_tasks_total",
        "task" => task.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record offload round-trip latency
pub fn record_offload_latency(task: &str, duration: Duration) {
    histogram!(
        "resource_sync_offload_seconds",
        "task" => task.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set whether the background worker is alive
pub fn set_worker_alive(alive: bool) {
    gauge!("resource_sync_offload_worker_alive").set(if alive { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a trigger admitted into (or dropped by) the sync state machine
pub fn record_trigger(trigger: &str, admitted: &'static str) {
    counter!(
        "resource_sync_triggers_total",
        "trigger" => trigger.to_string(),
        "result" => admitted
    )
    .increment(1);
}

/// Record a completed fetch
pub fn record_fetch(outcome: &'static str, duration: Duration) {
    counter!(
        "resource_sync_fetches_total",
        "outcome" => outcome
    )
    .increment(1);
    histogram!("resource_sync_fetch_seconds").record(duration.as_secs_f64());
}

/// Set the current backoff retry count
pub fn set_retry_count(count: u32) {
    gauge!("resource_sync_retry_count").set(f64::from(count));
}

/// Set mirrored item count
pub fn set_items(count: usize) {
    gauge!("resource_sync_items").set(count as f64);
}

/// Record a mutation call
pub fn record_mutation(operation: &'static str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        "resource_sync_mutations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record a snapshot fallback read
pub fn record_snapshot_fallback(found: bool) {
    let outcome = if found { "restored" } else { "empty" };
    counter!(
        "resource_sync_snapshot_fallbacks_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a bus publish and how many handlers saw it
pub fn record_publish(topic: &str, delivered: usize) {
    counter!(
        "resource_sync_bus_published_total",
        "topic" => topic.to_string()
    )
    .increment(1);
    histogram!(
        "resource_sync_bus_fanout",
        "topic" => topic.to_string()
    )
    .record(delivered as f64);
}

/// A timing guard that records offload latency on drop
pub struct LatencyTimer {
    task: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(task: &'static str) -> Self {
        Self {
            task,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_offload_latency(self.task, self.start.elapsed());
    }
}
