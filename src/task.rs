//! Single-use wrapper around one long-running operation.
//!
//! A [`CancellableTask`] owns an internal [`StopSignal`] that only its own
//! `stop` triggers, plus any external signal passed to `start`. The wrapped
//! operation receives the internal signal and is expected to wind down
//! cooperatively once it fires.
//!
//! ```text
//! start(external) ──► link external → internal
//!                 ──► poll operation once
//!                       ├─ Ready   ─► outcome returned to the caller
//!                       └─ Pending ─► spawned; start returns Ok
//!
//! stop(deadline)  ──► trigger internal (listener failures collected)
//!                 ──► select { operation finished, deadline triggered }
//! ```
//!
//! When the deadline wins, `stop` returns without waiting. The operation is
//! not aborted: it keeps running detached and its outcome stays observable
//! through the [`ExecutionHandle`].

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::Poll;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::service::{Service, ServiceFuture};
use crate::stop::{Registration, StopSignal};

type OperationFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
type Operation = Box<dyn FnOnce(StopSignal) -> OperationFuture + Send + 'static>;

/// Final result of a task's operation.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The operation returned `Ok(())`
    Completed,
    /// The operation returned an error or panicked
    Failed(Error),
}

impl TaskOutcome {
    /// Check if the operation failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    fn from_result(result: std::thread::Result<Result<()>>, name: &str) -> Self {
        match result {
            Ok(Ok(())) => Self::Completed,
            Ok(Err(e)) => Self::Failed(e),
            Err(payload) => Self::Failed(Error::from_panic(
                &format!("task '{name}' operation"),
                payload.as_ref(),
            )),
        }
    }
}

/// Observer for a task's in-flight operation.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    name: Arc<str>,
    rx: watch::Receiver<Option<TaskOutcome>>,
}

impl ExecutionHandle {
    /// Name of the task this handle observes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the operation has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The outcome, if the operation has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the operation to finish.
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // The runtime dropped the operation before it finished.
                return rx.borrow().clone().unwrap_or_else(|| {
                    TaskOutcome::Failed(Error::runtime_with_source(
                        ErrorCode::RuntimeJoinFailed,
                        format!("task '{}' was dropped before completion", self.name),
                        std::io::Error::from(std::io::ErrorKind::Interrupted),
                    ))
                });
            }
        }
    }
}

/// A service that runs one long-running operation until told to stop.
pub struct CancellableTask {
    name: Arc<str>,
    operation: Mutex<Option<Operation>>,
    stopping: StopSignal,
    link: Mutex<Option<Registration>>,
    execution: OnceLock<ExecutionHandle>,
}

impl std::fmt::Debug for CancellableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableTask")
            .field("name", &self.name)
            .field("started", &self.execution.get().is_some())
            .field("stopping", &self.stopping.is_triggered())
            .finish()
    }
}

impl CancellableTask {
    /// Wrap `operation`. It is not run until [`start`](Self::start).
    pub fn new<S, F, Fut>(name: S, operation: F) -> Self
    where
        S: Into<String>,
        F: FnOnce(StopSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let operation: Operation = Box::new(move |stop| Box::pin(operation(stop)));
        Self {
            name: Arc::from(name.into()),
            operation: Mutex::new(Some(operation)),
            stopping: StopSignal::new(),
            link: Mutex::new(None),
            execution: OnceLock::new(),
        }
    }

    /// Get the name of this task.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The internal stop signal handed to the operation.
    #[must_use]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stopping
    }

    /// Handle onto the operation, once started.
    #[must_use]
    pub fn execution(&self) -> Option<ExecutionHandle> {
        self.execution.get().cloned()
    }

    /// Begin the operation.
    ///
    /// `external` triggering also triggers the internal stop signal. If the
    /// operation finishes on its first poll its result is returned here;
    /// otherwise it is spawned onto the runtime and `start` returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when called a second time (or after `stop`), and
    /// a `Startup` error when the operation failed synchronously. A failure
    /// raised while linking `external` is returned on its own, or aggregated
    /// with the operation's failure when both happened.
    #[instrument(skip(self, external), fields(task = %self.name))]
    pub async fn start(&self, external: &StopSignal) -> Result<()> {
        let operation = self.operation.lock().take().ok_or_else(|| {
            Error::invalid_state_with_code(
                ErrorCode::ServiceAlreadyStarted,
                format!("task '{}' can only be started once", self.name),
            )
        })?;

        let mut failures = Vec::new();
        match external.link_to(&self.stopping) {
            Ok(registration) => *self.link.lock() = Some(registration),
            Err(e) => failures.push(self.listener_failure(e)),
        }

        let (tx, rx) = watch::channel(None);
        let handle = ExecutionHandle {
            name: Arc::clone(&self.name),
            rx,
        };
        // `operation` was taken above, so only one caller ever gets here.
        let _ = self.execution.set(handle);

        let mut running = AssertUnwindSafe(operation(self.stopping.clone())).catch_unwind();

        match futures::poll!(&mut running) {
            Poll::Ready(result) => {
                let outcome = TaskOutcome::from_result(result, &self.name);
                debug!(failed = outcome.is_failed(), "Task operation completed synchronously");
                tx.send_replace(Some(outcome.clone()));
                if let TaskOutcome::Failed(e) = outcome {
                    failures.push(Error::startup_with_source(
                        self.name.to_string(),
                        "operation failed during start",
                        e,
                    ));
                }
            }
            Poll::Pending => {
                let name = Arc::clone(&self.name);
                let stopping = self.stopping.clone();
                tokio::spawn(async move {
                    let outcome = TaskOutcome::from_result(running.await, &name);
                    match &outcome {
                        TaskOutcome::Completed => {
                            info!(task = %name, "Task operation completed");
                        }
                        TaskOutcome::Failed(e) if stopping.is_triggered() => {
                            warn!(task = %name, error = %e, "Task operation failed while stopping");
                        }
                        TaskOutcome::Failed(e) => {
                            error!(task = %name, error = %e, "Task operation failed");
                        }
                    }
                    tx.send_replace(Some(outcome));
                });
                debug!("Task operation running in background");
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Error::aggregate(failures).map_or(Ok(()), Err),
        }
    }

    /// Ask the operation to stop and wait for it, or for `deadline`.
    ///
    /// A no-op if the task was never started or its operation already
    /// finished. A task stopped before it was started can no longer start.
    ///
    /// # Errors
    ///
    /// Returns the failures raised by listeners of the internal stop signal.
    /// The operation's own outcome is not surfaced here; read it through
    /// [`execution`](Self::execution).
    #[instrument(skip(self, deadline), fields(task = %self.name))]
    pub async fn stop(&self, deadline: &StopSignal) -> Result<()> {
        let Some(execution) = self.execution.get().cloned() else {
            if self.operation.lock().take().is_some() {
                debug!("Task stopped before start; retiring it");
            }
            return Ok(());
        };

        if execution.is_finished() {
            debug!("Task already finished; nothing to stop");
            return Ok(());
        }

        let failures: Vec<Error> = self
            .stopping
            .trigger_collect()
            .into_iter()
            .map(|e| self.listener_failure(e))
            .collect();
        drop(self.link.lock().take());

        tokio::select! {
            outcome = execution.wait() => {
                debug!(failed = outcome.is_failed(), "Task operation finished after stop request");
            }
            () = deadline.triggered() => {
                warn!("Stop deadline reached before task finished; leaving it running detached");
            }
        }

        Error::aggregate(failures).map_or(Ok(()), Err)
    }

    fn listener_failure(&self, error: Error) -> Error {
        Error::shutdown_with_source(
            ErrorCode::StopListenerFailed,
            self.name.to_string(),
            "stop listener failed",
            error,
        )
    }
}

impl Service for CancellableTask {
    fn start<'a>(&'a self, cancel: &'a StopSignal) -> ServiceFuture<'a> {
        Box::pin(Self::start(self, cancel))
    }

    fn stop<'a>(&'a self, deadline: &'a StopSignal) -> ServiceFuture<'a> {
        Box::pin(Self::stop(self, deadline))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn execution(&self) -> Option<ExecutionHandle> {
        Self::execution(self)
    }
}
