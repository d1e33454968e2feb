// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task protocol between the offload engine and its worker.
//!
//! A request is `{ task_name, payload, cancel }`; the reply is
//! `Result<Value, TaskError>`. Nothing else crosses the channel.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("no handler registered for task '{0}'")]
    UnknownTask(String),
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Failed(String),
    #[error("offload worker queue is full")]
    QueueFull,
    #[error("offload worker is gone")]
    WorkerGone,
}

/// Cooperative cancellation flag shared between requester and worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a handler sees while running: its own cancel flag plus the
/// worker-wide stop flag raised on shutdown.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    cancel: CancelFlag,
    stop: CancelFlag,
}

impl TaskContext {
    pub(crate) fn new(cancel: CancelFlag, stop: CancelFlag) -> Self {
        Self { cancel, stop }
    }

    /// Context for inline execution: nothing can cancel it.
    pub(crate) fn detached() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested; call between chunks of work.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A unit of work the worker knows how to run.
///
/// Long loops should call [`TaskContext::checkpoint`] regularly. A handler
/// that never checks keeps the worker busy after a timeout, and engine
/// shutdown (or drop) blocks the calling thread for up to
/// [`SHUTDOWN_GRACE`](super::SHUTDOWN_GRACE) before detaching it.
pub trait TaskHandler: Send + Sync {
    fn run(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError>;
}

impl<F> TaskHandler for F
where
    F: Fn(Value, &TaskContext) -> Result<Value, TaskError> + Send + Sync,
{
    fn run(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        self(payload, ctx)
    }
}

/// Named task handlers available to the worker (and to the inline path).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `transform`, `sample` and `statistics`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::transform::register_builtins(&mut registry);
        registry
    }

    /// Add or replace the handler for `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run `name` on the current thread.
    pub fn run(&self, name: &str, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        match self.get(name) {
            Some(handler) => handler.run(payload, ctx),
            None => Err(TaskError::UnknownTask(name.to_string())),
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}

/// Message sent to the worker.
pub struct TaskRequest {
    pub task_name: String,
    pub payload: Value,
    pub cancel: CancelFlag,
    pub(crate) reply: oneshot::Sender<Result<Value, TaskError>>,
}

impl TaskRequest {
    pub(crate) fn new(
        task_name: impl Into<String>,
        payload: Value,
    ) -> (Self, oneshot::Receiver<Result<Value, TaskError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                task_name: task_name.into(),
                payload,
                cancel: CancelFlag::new(),
                reply,
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closure_handlers() {
        let mut registry = TaskRegistry::new();
        registry.register("double", |payload: Value, _ctx: &TaskContext| -> Result<Value, TaskError> {
            let n = payload.as_i64().ok_or_else(|| TaskError::InvalidPayload("not a number".into()))?;
            Ok(json!(n * 2))
        });

        let ctx = TaskContext::detached();
        assert_eq!(registry.run("double", json!(21), &ctx), Ok(json!(42)));
        assert!(matches!(
            registry.run("double", json!("x"), &ctx),
            Err(TaskError::InvalidPayload(_))
        ));
        assert_eq!(
            registry.run("missing", json!(null), &ctx),
            Err(TaskError::UnknownTask("missing".into()))
        );
    }

    #[test]
    fn test_context_cancellation() {
        let cancel = CancelFlag::new();
        let stop = CancelFlag::new();
        let ctx = TaskContext::new(cancel.clone(), stop.clone());
        assert!(ctx.checkpoint().is_ok());

        cancel.cancel();
        assert_eq!(ctx.checkpoint(), Err(TaskError::Cancelled));

        let ctx = TaskContext::new(CancelFlag::new(), stop.clone());
        stop.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TaskRegistry::with_builtins();
        assert!(registry.contains("transform"));
        assert!(registry.contains("sample"));
        assert!(registry.contains("statistics"));
    }
}
