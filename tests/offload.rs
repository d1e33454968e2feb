//! Offload engine behavior seen from the outside: timeouts degrade to the
//! input, cache hits skip the worker, failures never surface as errors.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use resource_sync::offload::{
    TaskContext, TaskError, TaskRegistry, SHUTDOWN_GRACE, TASK_TRANSFORM,
};
use resource_sync::{
    ComputeOffloadEngine, KeyedCache, OffloadConfig, SampleOptions, TransformConfig,
};

fn config(enabled: bool, timeout_ms: u64) -> OffloadConfig {
    OffloadConfig {
        enabled,
        task_timeout_ms: timeout_ms,
        ..Default::default()
    }
}

fn cache() -> Arc<KeyedCache<resource_sync::OffloadResult>> {
    Arc::new(KeyedCache::new("test", 16, Duration::from_secs(60)))
}

fn dataset(n: usize) -> Arc<Vec<Value>> {
    Arc::new((0..n).map(|i| json!({"x": i, "y": (i * 7) % 5})).collect())
}

fn sort_by_y() -> TransformConfig {
    TransformConfig {
        sort_by: Some("y".into()),
        ..Default::default()
    }
}

/// `transform` replaced by a handler that reverses rows and counts calls.
fn counting_registry(calls: Arc<AtomicUsize>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(
        TASK_TRANSFORM,
        move |payload: Value, _ctx: &TaskContext| -> Result<Value, TaskError> {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut rows = payload["data"]
                .as_array()
                .cloned()
                .ok_or_else(|| TaskError::InvalidPayload("missing data".into()))?;
            rows.reverse();
            Ok(Value::Array(rows))
        },
    );
    registry
}

#[tokio::test]
async fn timeout_returns_input_and_cancels_the_task() {
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();
    let mut registry = TaskRegistry::new();
    registry.register(
        TASK_TRANSFORM,
        move |_payload: Value, ctx: &TaskContext| -> Result<Value, TaskError> {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            flag.store(true, Ordering::SeqCst);
            Err(TaskError::Cancelled)
        },
    );
    let engine = ComputeOffloadEngine::with_registry(config(true, 50), cache(), registry);
    let input = dataset(20);

    let started = Instant::now();
    let output = engine.process(input.clone(), &sort_by_y()).await;
    let elapsed = started.elapsed();

    assert!(Arc::ptr_eq(&input, &output));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(1_000), "took {elapsed:?}");
    assert_eq!(engine.stats().timeouts, 1);
    assert!(engine.cache().is_empty());

    // The worker notices the cancel flag and moves on
    for _ in 0..100 {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn repeated_request_hits_the_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = ComputeOffloadEngine::with_registry(
        config(true, 5_000),
        cache(),
        counting_registry(calls.clone()),
    );
    let input = dataset(10);

    let first = engine.process(input.clone(), &sort_by_y()).await;
    let second = engine.process(input.clone(), &sort_by_y()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first[0]["x"], 9);

    let stats = engine.stats();
    assert_eq!(stats.offloaded, 1);
    assert_eq!(stats.cache_hits, 1);
    assert!(stats.worker_alive);

    // A different config is a different entry
    let other = TransformConfig {
        limit: Some(3),
        ..sort_by_y()
    };
    engine.process(input, &other).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_offload_runs_inline_without_caching() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = ComputeOffloadEngine::with_registry(
        config(false, 5_000),
        cache(),
        counting_registry(calls.clone()),
    );
    let input = dataset(4);

    let output = engine.process(input.clone(), &sort_by_y()).await;
    engine.process(input, &sort_by_y()).await;

    assert_eq!(output[0]["x"], 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let stats = engine.stats();
    assert_eq!(stats.inline, 2);
    assert_eq!(stats.offloaded, 0);
    assert!(!stats.worker_alive);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn failing_task_returns_input() {
    let mut registry = TaskRegistry::new();
    registry.register(
        TASK_TRANSFORM,
        |_payload: Value, _ctx: &TaskContext| -> Result<Value, TaskError> {
            Err(TaskError::Failed("bad column".into()))
        },
    );
    let engine = ComputeOffloadEngine::with_registry(config(true, 5_000), cache(), registry);
    let input = dataset(5);

    let output = engine.process(input.clone(), &sort_by_y()).await;
    assert!(Arc::ptr_eq(&input, &output));
    assert_eq!(engine.stats().errors, 1);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn panicking_task_does_not_kill_the_worker() {
    let mut registry = TaskRegistry::with_builtins();
    registry.register(
        TASK_TRANSFORM,
        |_payload: Value, _ctx: &TaskContext| -> Result<Value, TaskError> { panic!("boom") },
    );
    let engine = ComputeOffloadEngine::with_registry(config(true, 5_000), cache(), registry);
    let input = dataset(5);

    let output = engine.process(input.clone(), &sort_by_y()).await;
    assert!(Arc::ptr_eq(&input, &output));

    // Built-in sample still runs on the same worker
    let sampled = engine.sample(dataset(100), &SampleOptions::systematic(10)).await;
    assert_eq!(sampled.len(), 10);
    assert!(engine.stats().worker_alive);
}

#[tokio::test]
async fn builtin_transforms_end_to_end() {
    let engine = ComputeOffloadEngine::new(config(true, 5_000), cache());
    let rows: Arc<Vec<Value>> = Arc::new(vec![
        json!({"region": "eu", "sales": 10}),
        json!({"region": "us", "sales": 30}),
        json!({"region": "eu", "sales": 5}),
        json!({"region": "apac"}),
    ]);

    let config: TransformConfig = serde_json::from_value(json!({
        "group_by": "region",
        "value_field": "sales",
        "aggregate": "sum",
        "sort_by": "sales",
        "descending": true
    }))
    .unwrap();
    let grouped = engine.process(rows.clone(), &config).await;
    assert_eq!(grouped[0]["region"], "us");
    assert_eq!(grouped[1]["region"], "eu");
    assert_eq!(grouped[1]["sales"].as_f64(), Some(15.0));

    let stats = engine.compute_statistics(&rows, "sales").await.unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.missing, 1);
    assert_eq!(stats.min, Some(5.0));
    assert_eq!(stats.max, Some(30.0));
    assert_eq!(stats.mean, Some(15.0));

    let empty = engine.compute_statistics(&[], "sales").await.unwrap();
    assert_eq!(empty.count, 0);
    assert!(empty.mean.is_none());
}

#[tokio::test]
async fn shutdown_falls_back_to_inline() {
    let engine = ComputeOffloadEngine::new(config(true, 5_000), cache());
    engine.process(dataset(8), &sort_by_y()).await;
    assert!(engine.stats().worker_alive);

    engine.shutdown();
    assert!(!engine.stats().worker_alive);

    let output = engine.process(dataset(9), &sort_by_y()).await;
    assert_eq!(output.len(), 9);
    assert_eq!(engine.stats().inline, 1);
}

#[tokio::test]
async fn shutdown_does_not_wait_on_a_handler_that_ignores_cancel() {
    let mut registry = TaskRegistry::new();
    registry.register(
        TASK_TRANSFORM,
        |payload: Value, _ctx: &TaskContext| -> Result<Value, TaskError> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(payload)
        },
    );
    let engine = ComputeOffloadEngine::with_registry(config(true, 50), cache(), registry);
    let input = dataset(5);

    let output = engine.process(input.clone(), &sort_by_y()).await;
    assert!(Arc::ptr_eq(&input, &output));
    assert_eq!(engine.stats().timeouts, 1);

    let started = Instant::now();
    engine.shutdown();
    let elapsed = started.elapsed();

    assert!(elapsed >= SHUTDOWN_GRACE, "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(!engine.stats().worker_alive);
}
