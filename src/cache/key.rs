// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key derivation.
//!
//! The default key is a *structural* fingerprint: the first and last
//! [`PREVIEW_ROWS`] rows, the row count and the serialized config. Two
//! datasets that agree on all of those map to the same key even if a row
//! in the middle differs. That trade is fine for memoizing chart
//! transforms (a collision costs one stale render); callers that need
//! exact keys can use [`CacheKey::content`], which hashes every row.

use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Rows taken from each end of the dataset for the structural key.
pub const PREVIEW_ROWS: usize = 3;

/// Opaque key into a [`super::KeyedCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Structural fingerprint of `(preview, tail, length, config)`.
    #[must_use]
    pub fn derive(dataset: &[Value], config: &Value) -> Self {
        let len = dataset.len();
        let head = &dataset[..len.min(PREVIEW_ROWS)];
        let tail = &dataset[len.saturating_sub(PREVIEW_ROWS)..];

        let mut hasher = DefaultHasher::new();
        hash_rows(head, &mut hasher);
        hash_rows(tail, &mut hasher);
        len.hash(&mut hasher);
        config.to_string().hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Full-content key: every row participates.
    #[must_use]
    pub fn content(dataset: &[Value], config: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        hash_rows(dataset, &mut hasher);
        dataset.len().hash(&mut hasher);
        config.to_string().hash(&mut hasher);
        Self(hasher.finish())
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CacheKey {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

fn hash_rows(rows: &[Value], hasher: &mut DefaultHasher) {
    for row in rows {
        // serde_json's Display is compact and stable for a given Value
        row.to_string().hash(hasher);
    }
}
