//! dos task management.
//!
//! Every long running component of the node runs as a task spawned through a [`TaskExecutor`].
//! All tasks share the root [`CancellationToken`] owned by the [`TaskManager`]: cancelling it
//! aborts every task at its next suspension point.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

use futures_util::{future::FutureExt, TryFutureExt};
use std::{
    any::Any,
    fmt::{Display, Formatter},
    future::Future,
    panic::AssertUnwindSafe,
};
use tokio::{
    runtime::Handle,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Monitors critical tasks for panics and owns the root cancellation token.
///
/// The main purpose of this type is to be able to monitor if a critical task panicked, for
/// diagnostic purposes, since tokio task essentially fail silently. See
/// [`TaskManager::wait`].
#[derive(Debug)]
#[must_use = "TaskManager must be awaited to monitor critical tasks"]
pub struct TaskManager {
    /// Handle to the tokio runtime this task manager is associated with.
    handle: Handle,
    /// Root token, cancelled on shutdown.
    cancel: CancellationToken,
    /// Sender half for sending task events to this type
    task_events_tx: UnboundedSender<TaskEvent>,
    /// Receiver for task events
    task_events_rx: UnboundedReceiver<TaskEvent>,
}

// === impl TaskManager ===

impl TaskManager {
    /// Returns a [`TaskManager`] over the currently running runtime.
    ///
    /// # Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Create a new instance connected to the given handle's tokio runtime.
    pub fn new(handle: Handle) -> Self {
        let (task_events_tx, task_events_rx) = unbounded_channel();
        Self { handle, cancel: CancellationToken::new(), task_events_tx, task_events_rx }
    }

    /// Returns a new [`TaskExecutor`] that can spawn new tasks onto the tokio runtime this type
    /// is connected to.
    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            handle: self.handle.clone(),
            cancel: self.cancel.clone(),
            task_events_tx: self.task_events_tx.clone(),
        }
    }

    /// The root cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels all tasks spawned through any of the manager's executors.
    pub fn graceful_shutdown(self) {
        debug!(target: "tasks", "shutting down");
        self.cancel.cancel();
    }

    /// Resolves once a critical task panicked or a shutdown has been requested.
    ///
    /// All tasks are cancelled before this returns.
    pub async fn wait(mut self) -> Result<(), PanickedTaskError> {
        let res = tokio::select! {
            event = self.task_events_rx.recv() => match event {
                Some(TaskEvent::Panic(err)) => Err(err),
                Some(TaskEvent::GracefulShutdown) | None => Ok(()),
            },
            _ = self.cancel.cancelled() => Ok(()),
        };
        self.cancel.cancel();
        res
    }
}

/// Error with the name of the task that panicked and an error downcasted to string, if possible.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub struct PanickedTaskError {
    task_name: &'static str,
    error: Option<String>,
}

impl Display for PanickedTaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let task_name = self.task_name;
        if let Some(error) = &self.error {
            write!(f, "Critical task `{task_name}` panicked: `{error}`")
        } else {
            write!(f, "Critical task `{task_name}` panicked")
        }
    }
}

impl PanickedTaskError {
    fn new(task_name: &'static str, error: Box<dyn Any + Send>) -> Self {
        let error = match error.downcast::<String>() {
            Ok(value) => Some(*value),
            Err(error) => match error.downcast::<&str>() {
                Ok(value) => Some(value.to_string()),
                Err(_) => None,
            },
        };

        Self { task_name, error }
    }

    /// The name of the task that panicked.
    pub fn task_name(&self) -> &'static str {
        self.task_name
    }
}

/// Represents the events that the `TaskManager` can receive.
#[derive(Debug)]
enum TaskEvent {
    /// Indicates that a critical task has panicked.
    Panic(PanickedTaskError),
    /// A signal requesting a graceful shutdown of the `TaskManager`.
    GracefulShutdown,
}

/// A type that can spawn new tokio tasks
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    /// Handle to the tokio runtime this task manager is associated with.
    handle: Handle,
    /// The root cancellation token of the manager.
    cancel: CancellationToken,
    /// Sender half for sending task events to [`TaskManager`]
    task_events_tx: UnboundedSender<TaskEvent>,
}

// === impl TaskExecutor ===

impl TaskExecutor {
    /// Returns a token that is cancelled together with the manager's root token.
    ///
    /// Components receive their own child token so they can be cancelled individually.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Spawns the task onto the runtime.
    ///
    /// The task is dropped at its next suspension point once the manager shuts down.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {}
            }
        })
    }

    /// Spawns a task that receives its own cancellation token and is expected to wind down
    /// itself once it fires.
    pub fn spawn_with_signal<F>(&self, f: impl FnOnce(CancellationToken) -> F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(f(self.cancellation_token()))
    }

    /// This spawns a critical task onto the runtime.
    ///
    /// If this task panics, the [`TaskManager`] is notified.
    pub fn spawn_critical<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let panicked_tasks_tx = self.task_events_tx.clone();

        // wrap the task in catch unwind
        let task = AssertUnwindSafe(fut)
            .catch_unwind()
            .map_err(move |error| {
                let task_error = PanickedTaskError::new(name, error);
                error!(target: "tasks", %task_error, "critical task panicked");
                let _ = panicked_tasks_tx.send(TaskEvent::Panic(task_error));
            })
            .map(|_| ());

        self.spawn(task)
    }

    /// Sends a request to the `TaskManager` to initiate a graceful shutdown.
    pub fn initiate_graceful_shutdown(&self) {
        let _ = self.task_events_tx.send(TaskEvent::GracefulShutdown);
        self.cancel.cancel();
    }
}
