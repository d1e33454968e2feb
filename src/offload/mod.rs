// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compute offload: run chart transforms on a background thread, cache the
//! results, and never let a slow or broken worker reach the caller.
//!
//! # Flow
//!
//! ```text
//! process(dataset, config)
//!       │
//!       ├─→ empty dataset        → return it, nothing dispatched
//!       ├─→ len > threshold      → merge sampling params into config
//!       ├─→ cache hit            → return cached rows
//!       ├─→ offload disabled /
//!       │   worker unavailable   → run inline, warn, no caching
//!       │
//!       └─→ dispatch, race against task_timeout
//!             ├─→ result   → cache + return
//!             ├─→ timeout  → cancel task, return input
//!             └─→ error    → warn, return input
//! ```
//!
//! The worker thread is started on first dispatch and joined on
//! [`ComputeOffloadEngine::shutdown`] or drop.

pub mod task;
pub mod transform;
mod worker;

pub use task::{CancelFlag, TaskContext, TaskError, TaskHandler, TaskRegistry, TaskRequest};
pub use transform::{
    Aggregate, SampleMethod, SampleOptions, SamplingParams, Statistics, TransformConfig,
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::cache::KeyedCache;
use crate::config::OffloadConfig;
use crate::metrics::LatencyTimer;
pub use worker::SHUTDOWN_GRACE;
use worker::{run_guarded, Worker};

pub const TASK_TRANSFORM: &str = "transform";
pub const TASK_SAMPLE: &str = "sample";
pub const TASK_STATISTICS: &str = "statistics";

/// What the offload cache stores.
#[derive(Debug, Clone, PartialEq)]
pub enum OffloadResult {
    Rows(Arc<Vec<Value>>),
    Statistics(Statistics),
}

enum WorkerSlot {
    NotStarted,
    Running(Worker),
    /// Spawn failed or the thread went away; everything runs inline
    Failed,
    Disposed,
}

/// How a dispatched task ended.
enum Execution {
    Offloaded(Result<Value, TaskError>),
    Inline(Result<Value, TaskError>),
    TimedOut,
}

/// Sets the cancel flag unless disarmed; covers both timeout and a dropped caller future.
struct CancelOnDrop(Option<CancelFlag>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0.take();
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.cancel();
        }
    }
}

/// Counters exposed by [`ComputeOffloadEngine::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub offloaded: u64,
    pub inline: u64,
    pub cache_hits: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub worker_alive: bool,
}

#[derive(Default)]
struct Counters {
    offloaded: AtomicU64,
    inline: AtomicU64,
    cache_hits: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

pub struct ComputeOffloadEngine {
    config: OffloadConfig,
    cache: Arc<KeyedCache<OffloadResult>>,
    registry: Arc<TaskRegistry>,
    worker: Mutex<WorkerSlot>,
    counters: Counters,
}

impl ComputeOffloadEngine {
    /// Engine with the built-in `transform`, `sample` and `statistics` tasks.
    pub fn new(config: OffloadConfig, cache: Arc<KeyedCache<OffloadResult>>) -> Self {
        Self::with_registry(config, cache, TaskRegistry::with_builtins())
    }

    /// Engine with a caller-supplied task registry.
    pub fn with_registry(
        config: OffloadConfig,
        cache: Arc<KeyedCache<OffloadResult>>,
        registry: TaskRegistry,
    ) -> Self {
        Self {
            config,
            cache,
            registry: Arc::new(registry),
            worker: Mutex::new(WorkerSlot::NotStarted),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<KeyedCache<OffloadResult>> {
        &self.cache
    }

    /// Apply a chart transform. On any failure the input comes back unchanged.
    #[tracing::instrument(skip_all, fields(rows = dataset.len()))]
    pub async fn process(&self, dataset: Arc<Vec<Value>>, config: &TransformConfig) -> Arc<Vec<Value>> {
        if dataset.is_empty() {
            return dataset;
        }

        let mut config = config.clone();
        if dataset.len() > self.config.sample_threshold {
            let params = SamplingParams::for_len(dataset.len(), self.config.sample_target_points);
            debug!(step = params.step, target = params.target_points, "Sampling large dataset");
            config.sampling = Some(params);
        }

        let key_config = serde_json::to_value(&config).unwrap_or(Value::Null);
        let payload = json!({ "data": dataset.as_slice(), "config": &config });
        self.rows_task(TASK_TRANSFORM, dataset, &key_config, payload).await
    }

    /// Reduce a dataset to at most `options.size` rows.
    #[tracing::instrument(skip_all, fields(rows = dataset.len(), size = options.size))]
    pub async fn sample(&self, dataset: Arc<Vec<Value>>, options: &SampleOptions) -> Arc<Vec<Value>> {
        if dataset.is_empty() {
            return dataset;
        }
        let key_config = json!({ "type": "sample", "options": options });
        let payload = json!({ "data": dataset.as_slice(), "options": options });
        self.rows_task(TASK_SAMPLE, dataset, &key_config, payload).await
    }

    /// Statistics for `field`, or `None` if the task timed out or failed.
    #[tracing::instrument(skip_all, fields(rows = dataset.len(), field = %field))]
    pub async fn compute_statistics(&self, dataset: &[Value], field: &str) -> Option<Statistics> {
        if dataset.is_empty() {
            return Some(Statistics {
                field: field.to_string(),
                ..Default::default()
            });
        }

        let key_config = json!({ "type": "statistics", "field": field });
        if let Some(OffloadResult::Statistics(stats)) = self.cache.get(dataset, &key_config) {
            self.record_hit(TASK_STATISTICS);
            return Some(stats);
        }

        let payload = json!({ "data": dataset, "field": field });
        let (value, cacheable) = match self.execute(TASK_STATISTICS, payload).await {
            Execution::Offloaded(Ok(value)) => (value, true),
            Execution::Inline(Ok(value)) => (value, false),
            Execution::Offloaded(Err(e)) | Execution::Inline(Err(e)) => {
                self.record_error(TASK_STATISTICS, &e);
                return None;
            }
            Execution::TimedOut => return None,
        };

        match serde_json::from_value::<Statistics>(value) {
            Ok(stats) => {
                if cacheable {
                    self.cache
                        .set(dataset, &key_config, OffloadResult::Statistics(stats.clone()));
                }
                Some(stats)
            }
            Err(e) => {
                self.record_error(TASK_STATISTICS, &TaskError::Failed(e.to_string()));
                None
            }
        }
    }

    /// Stop the worker. Later calls run inline.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.worker.lock(), WorkerSlot::Disposed);
        if let WorkerSlot::Running(mut worker) = previous {
            worker.shutdown();
        }
        crate::metrics::set_worker_alive(false);
    }

    pub fn stats(&self) -> OffloadStats {
        let worker_alive = matches!(&*self.worker.lock(), WorkerSlot::Running(w) if w.is_alive());
        OffloadStats {
            offloaded: self.counters.offloaded.load(Ordering::Relaxed),
            inline: self.counters.inline.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            worker_alive,
        }
    }

    async fn rows_task(
        &self,
        task: &'static str,
        dataset: Arc<Vec<Value>>,
        key_config: &Value,
        payload: Value,
    ) -> Arc<Vec<Value>> {
        if let Some(OffloadResult::Rows(rows)) = self.cache.get(&dataset, key_config) {
            self.record_hit(task);
            return rows;
        }

        match self.execute(task, payload).await {
            Execution::Offloaded(Ok(Value::Array(rows))) => {
                let rows = Arc::new(rows);
                self.cache
                    .set(&dataset, key_config, OffloadResult::Rows(rows.clone()));
                rows
            }
            Execution::Inline(Ok(Value::Array(rows))) => Arc::new(rows),
            Execution::Offloaded(Ok(other)) | Execution::Inline(Ok(other)) => {
                let e = TaskError::Failed(format!("expected an array, got {}", json_kind(&other)));
                self.record_error(task, &e);
                dataset
            }
            Execution::Offloaded(Err(e)) | Execution::Inline(Err(e)) => {
                self.record_error(task, &e);
                dataset
            }
            Execution::TimedOut => dataset,
        }
    }

    async fn execute(&self, task: &'static str, payload: Value) -> Execution {
        if !self.config.enabled {
            return self.run_inline(task, payload, "offload disabled");
        }

        let (request, reply) = TaskRequest::new(task, payload);
        let mut guard = CancelOnDrop(Some(request.cancel.clone()));

        if let Err(rejected) = self.submit(request) {
            guard.disarm();
            let reason = rejected.reason.to_string();
            return self.run_inline(task, rejected.request.payload, &reason);
        }

        let _timer = LatencyTimer::new(task);
        match tokio::time::timeout(self.config.task_timeout(), reply).await {
            Ok(Ok(result)) => {
                guard.disarm();
                self.counters.offloaded.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_offload(task, "offloaded");
                Execution::Offloaded(result)
            }
            // Worker dropped the reply without answering
            Ok(Err(_)) => Execution::Offloaded(Err(TaskError::WorkerGone)),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_offload(task, "timeout");
                warn!(
                    task,
                    timeout_ms = self.config.task_timeout_ms,
                    "Offload task timed out, returning input unchanged"
                );
                Execution::TimedOut
            }
        }
    }

    fn submit(&self, request: TaskRequest) -> Result<(), worker::Rejected> {
        let mut slot = self.worker.lock();

        if matches!(*slot, WorkerSlot::NotStarted) {
            match Worker::spawn(self.registry.clone(), self.config.queue_depth) {
                Ok(worker) => {
                    *slot = WorkerSlot::Running(worker);
                    crate::metrics::set_worker_alive(true);
                }
                Err(e) => {
                    error!(error = %e, "Failed to start offload worker, running inline");
                    *slot = WorkerSlot::Failed;
                    crate::metrics::set_worker_alive(false);
                }
            }
        }

        let result = match &*slot {
            WorkerSlot::Running(worker) => worker.submit(request),
            WorkerSlot::NotStarted | WorkerSlot::Failed | WorkerSlot::Disposed => {
                Err(worker::Rejected::new(TaskError::WorkerGone, request))
            }
        };

        if let Err(ref rejected) = result {
            if rejected.reason == TaskError::WorkerGone && matches!(*slot, WorkerSlot::Running(_)) {
                error!("Offload worker disconnected, switching to inline execution");
                *slot = WorkerSlot::Failed;
                crate::metrics::set_worker_alive(false);
            }
        }
        result
    }

    fn run_inline(&self, task: &'static str, payload: Value, reason: &str) -> Execution {
        warn!(task, reason, "Offload unavailable, running task inline");
        self.counters.inline.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_offload(task, "inline");
        Execution::Inline(run_guarded(&self.registry, task, payload, &TaskContext::detached()))
    }

    fn record_hit(&self, task: &'static str) {
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_offload(task, "cached");
    }

    fn record_error(&self, task: &'static str, error: &TaskError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_offload(task, "error");
        warn!(task, error = %error, "Offload task failed, returning input unchanged");
    }
}

impl Drop for ComputeOffloadEngine {
    fn drop(&mut self) {
        if let WorkerSlot::Running(mut worker) =
            std::mem::replace(self.worker.get_mut(), WorkerSlot::Disposed)
        {
            worker.shutdown();
            crate::metrics::set_worker_alive(false);
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
