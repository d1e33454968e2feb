// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Keyed LRU + TTL cache for expensive transforms.
//!
//! Entries are keyed by a [`CacheKey`] derived from `(dataset, config)`.
//!
//! # Flow
//!
//! ```text
//! get(dataset, config)
//!       │
//!       ▼
//! ┌─────────────────────────────┐
//! │  key = derive(dataset, cfg) │
//! │  entry present?             │
//! │  now - created_at <= ttl ?  │
//! └─────────────────────────────┘
//!       │
//!       ├─→ fresh   → touch last_accessed, return value
//!       │
//!       └─→ missing / expired → evict, report miss
//!
//! set(dataset, config, value)
//!       │
//!       ├─→ sweep expired entries
//!       ├─→ insert (refreshes created_at)
//!       └─→ while len > max_size: evict oldest last_accessed
//! ```
//!
//! The cache never fails: a full cache evicts, it does not reject.
//! Timestamps come from `tokio::time::Instant`, so tests can drive expiry
//! with a paused clock.

mod key;

pub use key::{CacheKey, PREVIEW_ROWS};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CacheConfig;

/// A cached value with its bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub last_accessed: Instant,
    /// Monotonic access order; breaks ties when the clock hasn't moved
    access_seq: u64,
}

struct Inner<T> {
    entries: HashMap<CacheKey, CacheEntry<T>>,
    next_seq: u64,
}

impl<T> Inner<T> {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped by LRU because the cache was full
    pub evictions: u64,
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

/// Bounded LRU cache with per-entry TTL.
pub struct KeyedCache<T> {
    name: String,
    inner: Mutex<Inner<T>>,
    max_size: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone> KeyedCache<T> {
    pub fn new(name: impl Into<String>, max_size: usize, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            max_size,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::new(name, config.max_size, config.ttl())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `(dataset, config)`. A hit refreshes `last_accessed`.
    pub fn get(&self, dataset: &[Value], config: &Value) -> Option<T> {
        self.get_key(&CacheKey::derive(dataset, config))
    }

    /// Insert or refresh `(dataset, config) → value`.
    pub fn set(&self, dataset: &[Value], config: &Value, value: T) {
        self.set_key(CacheKey::derive(dataset, config), value);
    }

    /// Presence check with the same expiry rule as `get`; does not touch LRU order.
    pub fn has(&self, dataset: &[Value], config: &Value) -> bool {
        self.has_key(&CacheKey::derive(dataset, config))
    }

    /// Remove an entry. Returns whether a live entry was removed.
    pub fn delete(&self, dataset: &[Value], config: &Value) -> bool {
        self.delete_key(&CacheKey::derive(dataset, config))
    }

    pub fn get_key(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let fresh = inner.entries.get(key).map(|e| self.is_fresh(e, now));

        match fresh {
            Some(true) => {
                let seq = inner.bump();
                let value = inner.entries.get_mut(key).map(|entry| {
                    entry.last_accessed = now;
                    entry.access_seq = seq;
                    entry.value.clone()
                });
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(&self.name, true);
                value
            }
            Some(false) => {
                inner.entries.remove(key);
                let remaining = inner.entries.len();
                drop(inner);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_eviction(&self.name, "ttl", 1);
                crate::metrics::set_cache_entries(&self.name, remaining);
                self.record_miss();
                None
            }
            None => {
                drop(inner);
                self.record_miss();
                None
            }
        }
    }

    pub fn set_key(&self, key: CacheKey, value: T) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = self.sweep_locked(&mut inner, now);

        let seq = inner.bump();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                access_seq: seq,
            },
        );

        let mut evicted = 0;
        while inner.entries.len() > self.max_size {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.last_accessed, e.access_seq))
                .map(|(k, _)| *k);
            match victim {
                Some(k) => {
                    inner.entries.remove(&k);
                    evicted += 1;
                }
                None => break,
            }
        }
        let remaining = inner.entries.len();
        drop(inner);

        if expired > 0 {
            crate::metrics::record_cache_eviction(&self.name, "ttl", expired);
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_cache_eviction(&self.name, "lru", evicted);
        }
        crate::metrics::set_cache_entries(&self.name, remaining);
    }

    pub fn has_key(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(|e| self.is_fresh(e, now)) {
            Some(true) => true,
            Some(false) => {
                inner.entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    pub fn delete_key(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.remove(key) {
            Some(entry) => self.is_fresh(&entry, now),
            None => false,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.sweep_locked(&mut inner, now)
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        crate::metrics::set_cache_entries(&self.name, 0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn is_fresh(&self, entry: &CacheEntry<T>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) <= self.ttl
    }

    fn sweep_locked(&self, inner: &mut Inner<T>, now: Instant) -> usize {
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, e| now.saturating_duration_since(e.created_at) <= ttl);
        let removed = before - inner.entries.len();
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(&self.name, false);
    }
}

impl<T: Clone> Default for KeyedCache<T> {
    fn default() -> Self {
        Self::from_config("transform", &CacheConfig::default())
    }
}
