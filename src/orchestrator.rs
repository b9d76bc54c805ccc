//! Lifecycle orchestration for a registry of services.
//!
//! ```text
//!  Created ──start──► Starting ──► Running ──stop──► Stopping ──► Stopped
//!     │                  │                              │
//!     └──stop──► Stopped └──start failure──► Faulted    └──stop panic──► Faulted
//! ```
//!
//! Services start one at a time in registration order; each `start` must
//! return before the next begins. They stop all at once, bounded by a
//! deadline. A failed start stops the already-started services in reverse
//! order before the startup failure is returned.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::registry::{ServiceId, ServiceRegistry};
use crate::service::Service;
use crate::stop::StopSignal;
use crate::task::{ExecutionHandle, TaskOutcome};

/// Default bound on the reverse-order cleanup after a failed start.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// State of the orchestrator as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built, not yet started
    Created,
    /// Services are being started in order
    Starting,
    /// Every service started
    Running,
    /// Services are being stopped
    Stopping,
    /// Stop sequence completed
    Stopped,
    /// A start failed, or a stop panicked
    Faulted,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Faulted => write!(f, "Faulted"),
        }
    }
}

/// State of a single registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered, never started
    Registered,
    /// `start` in progress
    Starting,
    /// `start` returned successfully
    Running,
    /// `stop` in progress
    Stopping,
    /// `stop` returned successfully
    Stopped,
    /// `start` or `stop` failed, or the service failed while running
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "Registered"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Metadata about a registered service.
#[derive(Debug, Clone)]
pub struct ServiceMetadata {
    /// Registration index
    pub id: ServiceId,
    /// Human-readable name
    pub name: String,
    /// Current state
    pub state: ServiceState,
    /// When `start` last returned successfully
    pub started_at: Option<Instant>,
    /// When `stop` last returned
    pub stopped_at: Option<Instant>,
    /// Last error (if any)
    pub last_error: Option<String>,
}

/// Snapshot of the orchestrator for monitoring.
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    /// State of the orchestrator
    pub state: LifecycleState,
    /// Total number of registered services
    pub total_services: usize,
    /// Number of running services
    pub running_services: usize,
    /// Number of failed services
    pub failed_services: usize,
    /// Per-service metadata, in registration order
    pub services: Vec<ServiceMetadata>,
}

type StartedService = (ServiceId, Arc<dyn Service>);

/// Drives a [`ServiceRegistry`] through its start and stop sequences.
pub struct Orchestrator {
    core: Arc<Core>,
    cleanup_timeout: Duration,
}

/// State shared with the spawned stop sequence.
struct Core {
    registry: ServiceRegistry,
    state: watch::Sender<LifecycleState>,
    /// Passed to every `start`; triggered by a stop that arrives mid-startup.
    startup: StopSignal,
    /// Held for the whole start sequence.
    started: tokio::sync::Mutex<Vec<StartedService>>,
    executions: Mutex<Vec<(ServiceId, ExecutionHandle)>>,
    metadata: Arc<DashMap<ServiceId, ServiceMetadata>>,
    cleanup_outcome: Mutex<Option<Result<()>>>,
    stop_claimed: AtomicBool,
    /// Set exactly once, by the first stop sequence.
    stop_outcome: watch::Sender<Option<Result<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("services", &self.core.registry)
            .field("cleanup_timeout", &self.cleanup_timeout)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator over `registry`.
    #[must_use]
    pub fn new(registry: ServiceRegistry) -> Self {
        let metadata = DashMap::with_capacity(registry.len());
        for (id, service) in registry.iter() {
            metadata.insert(
                id,
                ServiceMetadata {
                    id,
                    name: service.name().to_string(),
                    state: ServiceState::Registered,
                    started_at: None,
                    stopped_at: None,
                    last_error: None,
                },
            );
        }

        Self {
            core: Arc::new(Core {
                registry,
                state: watch::channel(LifecycleState::Created).0,
                startup: StopSignal::new(),
                started: tokio::sync::Mutex::new(Vec::new()),
                executions: Mutex::new(Vec::new()),
                metadata: Arc::new(metadata),
                cleanup_outcome: Mutex::new(None),
                stop_claimed: AtomicBool::new(false),
                stop_outcome: watch::channel(None).0,
            }),
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    /// Bound the reverse-order cleanup that follows a failed start.
    #[must_use]
    pub const fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state()
    }

    /// Subscribe to lifecycle state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.core.state.subscribe()
    }

    /// Check if every service started and no stop began yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// The registry this orchestrator drives.
    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.core.registry
    }

    /// State of one service.
    #[must_use]
    pub fn service_state(&self, id: ServiceId) -> Option<ServiceState> {
        self.core.metadata.get(&id).map(|m| m.state)
    }

    /// Snapshot of the orchestrator and every service.
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        let mut services: Vec<ServiceMetadata> = self
            .core
            .metadata
            .iter()
            .map(|r| r.value().clone())
            .collect();
        services.sort_by_key(|m| m.id);

        let running_services = services
            .iter()
            .filter(|m| m.state == ServiceState::Running)
            .count();
        let failed_services = services
            .iter()
            .filter(|m| m.state == ServiceState::Failed)
            .count();

        OrchestratorStats {
            state: self.state(),
            total_services: services.len(),
            running_services,
            failed_services,
            services,
        }
    }

    /// Start every service in registration order.
    ///
    /// Each service's `start` is awaited before the next one is called. On the
    /// first failure the remaining services are not started, the ones already
    /// started are stopped in reverse order, the orchestrator moves to
    /// [`LifecycleState::Faulted`] and the start failure is returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if called more than once or after `stop`, a
    /// `Startup` error naming the failing service if a start fails, and
    /// `InvalidState` if a stop interrupted startup.
    #[instrument(skip(self), fields(services = self.core.registry.len()))]
    pub async fn start(&self) -> Result<()> {
        self.core.start(self.cleanup_timeout).await
    }

    /// Stop every started service concurrently, waiting at most `deadline`.
    ///
    /// The deadline also bounds waiting for a start sequence still in flight.
    /// Only the first call does any work; it runs on its own task, so every
    /// later call returns the same outcome even if the first caller was
    /// cancelled. Services still running at the deadline are abandoned: they
    /// keep running detached.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the deadline elapsed and nothing else failed,
    /// otherwise an `Aggregated` error holding every failure (including the
    /// timeout, if there was one). After a failed start, returns the outcome
    /// of the cleanup that start performed.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if !self.core.stop_claimed.swap(true, Ordering::AcqRel) {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move {
                let run = AssertUnwindSafe(Arc::clone(&core).run_stop(deadline)).catch_unwind();
                if let Err(payload) = run.await {
                    core.publish_stop(Err(Error::from_panic("stop sequence", payload.as_ref())));
                }
            });
        }

        let mut outcome = self.core.stop_outcome.subscribe();
        let published = outcome
            .wait_for(Option::is_some)
            .await
            .map(|o| o.clone());
        match published {
            Ok(Some(result)) => result,
            _ => Err(Error::runtime_with_source(
                ErrorCode::RuntimeJoinFailed,
                "stop sequence ended without an outcome",
                std::io::Error::from(std::io::ErrorKind::Interrupted),
            )),
        }
    }

    /// Wait until a running service's background work fails on its own.
    ///
    /// Failures observed after a stop began are ignored. Never returns if no
    /// such failure happens.
    pub async fn wait_for_fault(&self) -> Error {
        self.core.wait_for_fault().await
    }
}

impl Core {
    fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    async fn start(&self, cleanup_timeout: Duration) -> Result<()> {
        self.transition(LifecycleState::Created, LifecycleState::Starting)?;
        let mut started = self.started.lock().await;
        info!("Starting services");

        for (id, service) in self.registry.iter() {
            if self.startup.is_triggered() {
                warn!(service_id = id, "Startup aborted by stop request, not starting remaining services");
                break;
            }

            self.set_service_state(id, ServiceState::Starting);
            let result = match AssertUnwindSafe(service.start(&self.startup))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(Error::from_panic(
                    &format!("service '{}' start", service.name()),
                    payload.as_ref(),
                )),
            };

            match result {
                Ok(()) => {
                    started.push((id, Arc::clone(service)));
                    if let Some(execution) = service.execution() {
                        self.executions.lock().push((id, execution));
                    }
                    if let Some(mut m) = self.metadata.get_mut(&id) {
                        m.state = ServiceState::Running;
                        m.started_at = Some(Instant::now());
                    }
                    info!(service_id = id, service_name = %service.name(), "Started service");
                }
                Err(e) => {
                    let e = if e.is_startup() {
                        e
                    } else {
                        Error::startup_with_source(service.name(), "start failed", e)
                    };
                    error!(service_id = id, service_name = %service.name(), error = %e, "Service failed to start");
                    self.record_failure(id, &e);
                    self.state.send_replace(LifecycleState::Faulted);

                    let to_stop = std::mem::take(&mut *started);
                    let cleanup = self.stop_in_reverse(&to_stop, cleanup_timeout).await;
                    if let Err(cleanup_err) = &cleanup {
                        warn!(error = %cleanup_err, "Cleanup after failed startup reported failures");
                    }
                    *self.cleanup_outcome.lock() = Some(cleanup);
                    return Err(e);
                }
            }
        }
        drop(started);

        if self
            .transition(LifecycleState::Starting, LifecycleState::Running)
            .is_err()
        {
            let current = self.state();
            return Err(Error::invalid_state_with_current(
                "startup interrupted by stop",
                current.to_string(),
            ));
        }

        info!("All services running");
        Ok(())
    }

    #[instrument(skip(self), fields(deadline_ms = millis(deadline)))]
    async fn run_stop(self: Arc<Self>, deadline: Duration) {
        let mut previous = LifecycleState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            match previous {
                LifecycleState::Created => *state = LifecycleState::Stopped,
                LifecycleState::Starting | LifecycleState::Running => {
                    *state = LifecycleState::Stopping;
                }
                _ => return false,
            }
            true
        });

        let mut failures = Vec::new();
        match previous {
            LifecycleState::Created => {
                info!("Stop before start, nothing to stop");
                self.publish_stop(Ok(()));
                return;
            }
            LifecycleState::Starting => {
                info!("Stop requested during startup, aborting startup");
                failures.extend(self.startup.trigger_collect());
            }
            _ => {}
        }

        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);
        let deadline_signal = StopSignal::new();

        // Waits for an in-flight start sequence to return, within the deadline.
        let services = tokio::select! {
            mut started = self.started.lock() => std::mem::take(&mut *started),
            () = &mut timer => {
                warn!("Stop deadline elapsed while startup was still in progress");
                failures.extend(deadline_signal.trigger_collect());
                failures.push(Error::timeout("stop services", millis(deadline)));
                self.publish_stop(stop_result(failures));
                self.abandon_startup(&deadline_signal).await;
                return;
            }
        };

        if self.state() == LifecycleState::Faulted {
            debug!("Startup failed earlier, returning its cleanup outcome");
            let cleanup = self.cleanup_outcome.lock().clone().unwrap_or(Ok(()));
            self.publish_stop(cleanup);
            return;
        }

        info!(services = services.len(), "Stopping services");
        let mut pending: FuturesUnordered<_> = services
            .iter()
            .map(|(id, service)| {
                let handle = self.spawn_stop(*id, Arc::clone(service), &deadline_signal);
                let id = *id;
                async move { (id, handle.await) }
            })
            .collect();

        let mut faulted = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((_, Ok((result, panicked)))) => {
                        faulted |= panicked;
                        if let Err(e) = result {
                            failures.push(e);
                        }
                    }
                    Some((id, Err(join_err))) => {
                        faulted = true;
                        failures.push(Error::runtime_with_source(
                            ErrorCode::RuntimeJoinFailed,
                            format!("stop task for service {id} did not complete"),
                            join_err,
                        ));
                    }
                    None => break,
                },
                () = &mut timer => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                abandoned = pending.len(),
                "Stop deadline elapsed, abandoning unfinished services"
            );
            failures.extend(deadline_signal.trigger_collect());
            // Dropping the join handles detaches the stop tasks.
            drop(pending);
            failures.push(Error::timeout("stop services", millis(deadline)));
        }

        let terminal = if faulted {
            LifecycleState::Faulted
        } else {
            LifecycleState::Stopped
        };
        let _ = self.transition(LifecycleState::Stopping, terminal);

        let outcome = stop_result(failures);
        match &outcome {
            Ok(()) => info!(state = %terminal, "All services stopped"),
            Err(e) => warn!(state = %terminal, error = %e, "Services stopped with failures"),
        }
        self.publish_stop(outcome);
    }

    /// Once a timed-out stop has reported, wait for the interrupted start
    /// sequence and issue `stop` to whatever it started, without waiting.
    async fn abandon_startup(&self, deadline_signal: &StopSignal) {
        let services = std::mem::take(&mut *self.started.lock().await);
        if self.state() == LifecycleState::Faulted {
            return;
        }
        debug!(services = services.len(), "Stopping services left by interrupted startup");
        for (id, service) in services {
            drop(self.spawn_stop(id, service, deadline_signal));
        }
        let _ = self.transition(LifecycleState::Stopping, LifecycleState::Stopped);
    }

    fn publish_stop(&self, outcome: Result<()>) {
        self.stop_outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    async fn wait_for_fault(&self) -> Error {
        let mut states = self.state.subscribe();
        let settled = states
            .wait_for(|s| !matches!(s, LifecycleState::Created | LifecycleState::Starting))
            .await
            .map(|s| *s);
        if settled.ok() != Some(LifecycleState::Running) {
            return std::future::pending().await;
        }

        let executions = self.executions.lock().clone();
        let mut watching: FuturesUnordered<_> = executions
            .into_iter()
            .map(|(id, handle)| async move {
                let outcome = handle.wait().await;
                (id, handle.name().to_string(), outcome)
            })
            .collect();

        while let Some((id, name, outcome)) = watching.next().await {
            let TaskOutcome::Failed(e) = outcome else {
                debug!(service_id = id, service_name = %name, "Service background work completed");
                continue;
            };
            if self.state() != LifecycleState::Running {
                continue;
            }
            error!(service_id = id, service_name = %name, error = %e, "Service failed while running");
            self.record_failure(id, &e);
            return Error::runtime_with_source(
                ErrorCode::ServiceFaulted,
                format!("service '{name}' failed while running"),
                e,
            );
        }

        std::future::pending().await
    }

    async fn stop_in_reverse(&self, services: &[StartedService], cleanup_timeout: Duration) -> Result<()> {
        let deadline_at = tokio::time::Instant::now() + cleanup_timeout;
        let signal = StopSignal::new();
        let mut failures = Vec::new();
        let mut timed_out = false;

        for (id, service) in services.iter().rev() {
            let handle = self.spawn_stop(*id, Arc::clone(service), &signal);
            match tokio::time::timeout_at(deadline_at, handle).await {
                Ok(Ok((Ok(()), _))) => {}
                Ok(Ok((Err(e), _))) => failures.push(e),
                Ok(Err(join_err)) => failures.push(Error::runtime_with_source(
                    ErrorCode::RuntimeJoinFailed,
                    format!("stop task for service {id} did not complete"),
                    join_err,
                )),
                Err(_) => {
                    if !timed_out {
                        warn!(service_id = id, "Cleanup deadline elapsed, abandoning remaining stops");
                        failures.extend(signal.trigger_collect());
                        timed_out = true;
                    }
                }
            }
        }

        if timed_out {
            failures.push(Error::timeout("startup cleanup", millis(cleanup_timeout)));
        }
        Error::aggregate(failures).map_or(Ok(()), Err)
    }


    /// Run one service's `stop` on its own task, recording the outcome.
    ///
    /// The task yields the result and whether `stop` panicked.
    fn spawn_stop(
        &self,
        id: ServiceId,
        service: Arc<dyn Service>,
        deadline: &StopSignal,
    ) -> JoinHandle<(Result<()>, bool)> {
        self.set_service_state(id, ServiceState::Stopping);
        let metadata = Arc::clone(&self.metadata);
        let deadline = deadline.clone();

        tokio::spawn(async move {
            let (result, panicked) =
                match AssertUnwindSafe(service.stop(&deadline)).catch_unwind().await {
                    Ok(result) => (result, false),
                    Err(payload) => (
                        Err(Error::from_panic(
                            &format!("service '{}' stop", service.name()),
                            payload.as_ref(),
                        )),
                        true,
                    ),
                };

            if let Some(mut m) = metadata.get_mut(&id) {
                m.stopped_at = Some(Instant::now());
                match &result {
                    Ok(()) => m.state = ServiceState::Stopped,
                    Err(e) => {
                        m.state = ServiceState::Failed;
                        m.last_error = Some(e.to_string());
                    }
                }
            }
            match &result {
                Ok(()) => info!(service_id = id, service_name = %service.name(), "Service stopped"),
                Err(e) => warn!(service_id = id, service_name = %service.name(), error = %e, "Service failed to stop"),
            }
            (result, panicked)
        })
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if *state != from {
                result = Err(Error::invalid_state_with_current(
                    format!("cannot move to {to} from {state}"),
                    state.to_string(),
                ));
                return false;
            }
            *state = to;
            true
        });
        if result.is_ok() {
            debug!(from = %from, to = %to, "Lifecycle state changed");
        }
        result
    }

    fn set_service_state(&self, id: ServiceId, state: ServiceState) {
        if let Some(mut m) = self.metadata.get_mut(&id) {
            m.state = state;
        }
    }

    fn record_failure(&self, id: ServiceId, error: &Error) {
        if let Some(mut m) = self.metadata.get_mut(&id) {
            m.state = ServiceState::Failed;
            m.last_error = Some(error.to_string());
        }
    }
}


/// A lone timeout is returned as is; anything else is aggregated.
fn stop_result(mut failures: Vec<Error>) -> Result<()> {
    match failures.len() {
        0 => Ok(()),
        1 if failures[0].is_timeout() => Err(failures.remove(0)),
        _ => Error::aggregate(failures).map_or(Ok(()), Err),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
