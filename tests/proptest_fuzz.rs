//! Property-based tests for the cache, the wire types and the transforms.
//!
//! Uses proptest to generate random inputs and verify invariants hold and
//! nothing panics.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

use resource_sync::offload::transform::{apply_transform, sample_rows, Aggregate};
use resource_sync::offload::TaskContext;
use resource_sync::sync::content_hash;
use resource_sync::{
    canonical_id, CacheKey, KeyedCache, Resource, ResourceStatus, SampleOptions, TransformConfig,
};

// =============================================================================
// Strategies
// =============================================================================

/// Arbitrary JSON values (including shapes no caller would send)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::hash_map("[a-c]{1,2}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Chart-like rows over a small set of field names
fn row_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of(-1_000i64..1_000),
        prop::option::of("[a-d]"),
        prop::option::of(any::<bool>()),
    )
        .prop_map(|(x, cat, flag)| {
            let mut row = serde_json::Map::new();
            if let Some(x) = x {
                row.insert("x".into(), json!(x));
            }
            if let Some(cat) = cat {
                row.insert("cat".into(), json!(cat));
            }
            if let Some(flag) = flag {
                row.insert("flag".into(), json!(flag));
            }
            Value::Object(row)
        })
}

fn status_strategy() -> impl Strategy<Value = ResourceStatus> {
    prop_oneof![
        Just(ResourceStatus::Idle),
        Just(ResourceStatus::Processing),
        Just(ResourceStatus::Ready),
        Just(ResourceStatus::Error),
    ]
}

fn resources_strategy() -> impl Strategy<Value = Vec<Resource>> {
    prop::collection::btree_map(0u32..500, (status_strategy(), "[a-z]{0,8}"), 0..20).prop_map(
        |m| {
            m.into_iter()
                .map(|(id, (status, name))| {
                    Resource::new(id.to_string(), status).with_field("name", json!(name))
                })
                .collect()
        },
    )
}

// =============================================================================
// Cache Properties
// =============================================================================

proptest! {
    /// The cache never holds more than max_size entries.
    #[test]
    fn cache_never_exceeds_max_size(
        max_size in 1usize..16,
        keys in prop::collection::vec(0u64..64, 0..200),
    ) {
        let cache = KeyedCache::new("prop", max_size, Duration::from_secs(60));
        for k in keys {
            cache.set_key(CacheKey::from(k), k);
            prop_assert!(cache.len() <= max_size);
        }
    }

    /// A value just set is returned until something evicts it.
    #[test]
    fn cache_set_then_get(
        dataset in prop::collection::vec(row_strategy(), 0..20),
        config in arbitrary_json_strategy(),
        value in any::<i32>(),
    ) {
        let cache = KeyedCache::new("prop", 4, Duration::from_secs(60));
        cache.set(&dataset, &config, value);
        prop_assert_eq!(cache.get(&dataset, &config), Some(value));
        prop_assert!(cache.has(&dataset, &config));
    }

    /// When full, the least recently accessed entry is the one evicted.
    #[test]
    fn cache_evicts_least_recently_accessed(
        max_size in 2usize..10,
        touched_seed in any::<usize>(),
    ) {
        let cache = KeyedCache::new("prop", max_size, Duration::from_secs(60));
        for k in 0..max_size as u64 {
            cache.set_key(CacheKey::from(k), k);
        }
        // Touch every key except one
        let spared = (touched_seed % max_size) as u64;
        for k in (0..max_size as u64).filter(|k| *k != spared) {
            prop_assert_eq!(cache.get_key(&CacheKey::from(k)), Some(k));
        }

        cache.set_key(CacheKey::from(1_000), 1_000);
        prop_assert!(!cache.has_key(&CacheKey::from(spared)));
        prop_assert_eq!(cache.len(), max_size);
        prop_assert_eq!(cache.stats().evictions, 1);
    }
}

// =============================================================================
// Wire Type Properties
// =============================================================================

proptest! {
    /// Resource deserialization never panics on arbitrary JSON.
    #[test]
    fn fuzz_resource_from_arbitrary_json(value in arbitrary_json_strategy()) {
        let _ = serde_json::from_value::<Resource>(value);
    }

    #[test]
    fn fuzz_resource_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let _ = serde_json::from_slice::<Vec<Resource>>(&bytes);
    }

    /// Canonicalization is idempotent and numeric ids ignore leading zeros.
    #[test]
    fn canonical_id_is_idempotent(raw in ".{0,20}", n in any::<u32>(), zeros in 0usize..4) {
        let once = canonical_id(&raw);
        prop_assert_eq!(canonical_id(&once), once.clone());

        let padded = format!("{}{}", "0".repeat(zeros), n);
        prop_assert_eq!(canonical_id(&padded), n.to_string());
    }

    /// The content hash does not depend on item order.
    #[test]
    fn content_hash_is_order_independent(items in resources_strategy(), seed in any::<u64>()) {
        let mut shuffled = items.clone();
        if !shuffled.is_empty() {
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
        }
        prop_assert_eq!(content_hash(&items, &[]), content_hash(&shuffled, &[]));
    }
}

// =============================================================================
// Transform Properties
// =============================================================================

proptest! {
    /// Transforms never panic and never grow the dataset unless grouping.
    #[test]
    fn transform_never_panics(
        rows in prop::collection::vec(row_strategy(), 0..60),
        sort_by in prop::option::of(prop_oneof![Just("x"), Just("cat"), Just("flag")]),
        descending in any::<bool>(),
        group in any::<bool>(),
        limit in prop::option::of(0usize..30),
    ) {
        let config = TransformConfig {
            sort_by: sort_by.map(str::to_string),
            descending,
            group_by: group.then(|| "cat".to_string()),
            value_field: group.then(|| "x".to_string()),
            aggregate: group.then_some(Aggregate::Sum),
            limit,
            ..Default::default()
        };
        let len = rows.len();
        let out = apply_transform(rows, &config, &TaskContext::default()).unwrap();
        prop_assert!(out.len() <= len);
        if let Some(limit) = limit {
            prop_assert!(out.len() <= limit);
        }
    }

    /// Sorting keeps missing values at the end in either direction.
    #[test]
    fn sort_keeps_missing_last(
        rows in prop::collection::vec(row_strategy(), 0..60),
        descending in any::<bool>(),
    ) {
        let config = TransformConfig {
            sort_by: Some("x".into()),
            descending,
            ..Default::default()
        };
        let out = apply_transform(rows, &config, &TaskContext::default()).unwrap();
        let first_missing = out.iter().position(|r| r.get("x").is_none());
        if let Some(i) = first_missing {
            prop_assert!(out[i..].iter().all(|r| r.get("x").is_none()));
        }
    }

    /// Systematic sampling returns min(size, len) rows, keeping first and last.
    #[test]
    fn sample_size_is_bounded(len in 0usize..300, size in 2usize..50) {
        let rows: Vec<Value> = (0..len).map(|i| json!({"i": i})).collect();
        let out = sample_rows(rows, &SampleOptions::systematic(size), &TaskContext::default()).unwrap();
        prop_assert_eq!(out.len(), len.min(size));
        if len > 0 {
            prop_assert_eq!(&out[0]["i"], &json!(0));
            prop_assert_eq!(&out[out.len() - 1]["i"], &json!(len - 1));
        }
    }
}
