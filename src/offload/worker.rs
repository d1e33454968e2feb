// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dedicated compute thread.
//!
//! The worker owns nothing but a [`TaskRegistry`] and the receiving end of a
//! bounded queue. Panics inside a handler are caught and reported as
//! [`TaskError::Failed`]; the thread keeps serving.

use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::task::{CancelFlag, TaskContext, TaskError, TaskRegistry, TaskRequest};

/// How long shutdown waits for the thread to notice cancellation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

pub(crate) struct Worker {
    sender: Option<SyncSender<TaskRequest>>,
    stop: CancelFlag,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread.
    pub(crate) fn spawn(registry: Arc<TaskRegistry>, queue_depth: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(queue_depth.max(1));
        let stop = CancelFlag::new();
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("resource-sync-offload".into())
            .spawn(move || run_loop(&registry, &receiver, &thread_stop))?;

        info!(queue_depth, "Offload worker started");
        Ok(Self {
            sender: Some(sender),
            stop,
            handle: Some(handle),
        })
    }

    /// Queue a request without blocking. A rejected request is handed back.
    pub(crate) fn submit(&self, request: TaskRequest) -> Result<(), Rejected> {
        let Some(ref sender) = self.sender else {
            return Err(Rejected::new(TaskError::WorkerGone, request));
        };
        sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(request) => Rejected::new(TaskError::QueueFull, request),
            TrySendError::Disconnected(request) => Rejected::new(TaskError::WorkerGone, request),
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.sender.is_some() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop accepting work, cancel whatever is running and join the thread.
    ///
    /// Waits at most [`SHUTDOWN_GRACE`]. A handler that ignores its
    /// cancel flag past that is left running on a detached thread.
    pub(crate) fn shutdown(&mut self) {
        self.stop.cancel();
        self.sender.take();
        let Some(handle) = self.handle.take() else {
            return;
        };

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(SHUTDOWN_POLL);
        }
        if !handle.is_finished() {
            warn!(
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                "Offload worker still busy after cancel, detaching"
            );
            return;
        }
        if handle.join().is_err() {
            error!("Offload worker thread panicked during shutdown");
        } else {
            info!("Offload worker stopped");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A request the worker could not accept.
pub(crate) struct Rejected {
    pub reason: TaskError,
    pub request: TaskRequest,
}

impl Rejected {
    pub(crate) fn new(reason: TaskError, request: TaskRequest) -> Self {
        Self { reason, request }
    }
}

/// Run a handler, turning a panic into [`TaskError::Failed`].
pub(crate) fn run_guarded(
    registry: &TaskRegistry,
    task_name: &str,
    payload: Value,
    ctx: &TaskContext,
) -> Result<Value, TaskError> {
    panic::catch_unwind(AssertUnwindSafe(|| registry.run(task_name, payload, ctx))).unwrap_or_else(
        |panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            warn!(task = %task_name, %message, "Offload handler panicked");
            Err(TaskError::Failed(message))
        },
    )
}

fn run_loop(registry: &TaskRegistry, receiver: &Receiver<TaskRequest>, stop: &CancelFlag) {
    // recv() fails once every sender is dropped
    while let Ok(request) = receiver.recv() {
        let TaskRequest {
            task_name,
            payload,
            cancel,
            reply,
        } = request;

        if stop.is_cancelled() || cancel.is_cancelled() || reply.is_closed() {
            debug!(task = %task_name, "Skipping abandoned offload request");
            continue;
        }

        let ctx = TaskContext::new(cancel, stop.clone());
        let result = run_guarded(registry, &task_name, payload, &ctx);

        // Requester may have timed out; a late reply is simply dropped.
        if reply.send(result).is_err() {
            debug!(task = %task_name, "Offload reply dropped, requester gone");
        }
    }
    debug!("Offload worker loop exiting");
}
