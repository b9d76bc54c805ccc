//! Shutdown coordination: one stop, whatever asked for it first.
//!
//! Several sources may race to end the process: an operator signal, a
//! programmatic request, the configured maximum runtime, or a service that
//! failed while running. The [`ShutdownCoordinator`] accepts the first of
//! them and ignores the rest, then drives the orchestrator's stop sequence
//! exactly once.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;

/// Reason for shutdown initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Shutdown requested via signal (SIGTERM, SIGINT, etc.)
    Signal(i32),
    /// Shutdown requested programmatically
    Requested,
    /// The configured maximum runtime elapsed
    Timeout,
    /// A service failed while running
    Fault,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(sig) => write!(f, "Signal({sig})"),
            Self::Requested => write!(f, "Requested"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Fault => write!(f, "Fault"),
        }
    }
}

/// What a coordinated shutdown did.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// The trigger that won
    pub reason: ShutdownReason,
    /// The fault that triggered shutdown, for [`ShutdownReason::Fault`]
    pub fault: Option<Error>,
    /// Outcome of the orchestrator's stop sequence
    pub outcome: Result<()>,
    /// Time from initiation to the end of the stop sequence
    pub elapsed: Duration,
}

#[derive(Debug)]
struct ShutdownInner {
    initiated: AtomicBool,
    reason: ArcSwapOption<ShutdownReason>,
    initiated_at: Mutex<Option<Instant>>,
    fault: Mutex<Option<Error>>,
    notify: watch::Sender<bool>,
}

/// First-writer-wins shutdown trigger.
///
/// Cloning yields another handle onto the same coordinator.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                initiated: AtomicBool::new(false),
                reason: ArcSwapOption::empty(),
                initiated_at: Mutex::new(None),
                fault: Mutex::new(None),
                notify,
            }),
        }
    }

    /// Initiate shutdown.
    ///
    /// Returns true if this call initiated shutdown, false if shutdown was
    /// already in progress.
    pub fn initiate_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .inner
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(%reason, "Shutdown already initiated, ignoring additional request");
            return false;
        }

        self.inner.reason.store(Some(Arc::new(reason)));
        *self.inner.initiated_at.lock() = Some(Instant::now());
        self.inner.notify.send_replace(true);
        info!(%reason, "Shutdown initiated");
        true
    }

    /// Initiate shutdown because a service failed while running.
    ///
    /// The error is kept only if this call won.
    pub fn report_fault(&self, error: Error) -> bool {
        // Set before the reason: a reader that sees `Fault` also sees the error.
        let mut fault = self.inner.fault.lock();
        if self.is_shutdown() {
            debug!(error = %error, "Fault reported after shutdown began");
            return false;
        }
        *fault = Some(error);
        if self.initiate_shutdown(ShutdownReason::Fault) {
            true
        } else {
            *fault = None;
            false
        }
    }

    /// Check if shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.initiated.load(Ordering::Acquire)
    }

    /// The winning reason, once shutdown has been initiated.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.reason.load_full().map(|r| *r)
    }

    /// The fault that triggered shutdown, if one did.
    #[must_use]
    pub fn fault(&self) -> Option<Error> {
        self.inner.fault.lock().clone()
    }

    /// When shutdown was initiated.
    #[must_use]
    pub fn initiated_at(&self) -> Option<Instant> {
        *self.inner.initiated_at.lock()
    }

    /// Wait for shutdown to be initiated.
    pub async fn wait(&self) {
        let mut rx = self.inner.notify.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the first shutdown trigger, then stop `orchestrator`.
    ///
    /// Triggers are: [`initiate_shutdown`](Self::initiate_shutdown) from any
    /// clone, `max_runtime` elapsing, and a service failing while running.
    /// The orchestrator's stop is bounded by `deadline`.
    #[instrument(skip(self, orchestrator))]
    pub async fn run(
        &self,
        orchestrator: &Orchestrator,
        max_runtime: Option<Duration>,
        deadline: Duration,
    ) -> ShutdownReport {
        let max_runtime_elapsed = async {
            match max_runtime {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = self.wait() => {}
            () = max_runtime_elapsed => {
                if self.initiate_shutdown(ShutdownReason::Timeout) {
                    warn!(?max_runtime, "Maximum runtime elapsed");
                }
            }
            fault = orchestrator.wait_for_fault() => {
                self.report_fault(fault);
            }
        }

        let reason = self.reason().unwrap_or(ShutdownReason::Requested);
        let started = self.initiated_at().unwrap_or_else(Instant::now);
        info!(%reason, deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX), "Stopping services");

        let outcome = orchestrator.stop(deadline).await;
        ShutdownReport {
            reason,
            fault: self.fault(),
            outcome,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::LifecycleState;
    use crate::registry::ServiceRegistry;
    use crate::stop::StopSignal;
    use std::sync::atomic::AtomicUsize;

    fn one_task_orchestrator() -> Orchestrator {
        let mut registry = ServiceRegistry::new();
        registry.register_task("worker", |stop: StopSignal| async move {
            stop.triggered().await;
            Ok(())
        });
        Orchestrator::new(registry)
    }

    #[test]
    fn test_shutdown_reason_display() {
        assert_eq!(format!("{}", ShutdownReason::Signal(15)), "Signal(15)");
        assert_eq!(format!("{}", ShutdownReason::Requested), "Requested");
        assert_eq!(format!("{}", ShutdownReason::Timeout), "Timeout");
        assert_eq!(format!("{}", ShutdownReason::Fault), "Fault");
    }

    #[tokio::test]
    async fn test_multiple_shutdown_initiation() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let coordinator = ShutdownCoordinator::new();
            assert!(!coordinator.is_shutdown());
            assert!(coordinator.reason().is_none());

            assert!(coordinator.initiate_shutdown(ShutdownReason::Requested));
            assert!(!coordinator.initiate_shutdown(ShutdownReason::Signal(15)));
            assert!(!coordinator.report_fault(Error::runtime("late")));

            assert_eq!(coordinator.reason(), Some(ShutdownReason::Requested));
            assert!(coordinator.fault().is_none());
            assert!(coordinator.initiated_at().is_some());
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_initiators_have_one_winner() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let coordinator = ShutdownCoordinator::new();
            let winners = Arc::new(AtomicUsize::new(0));

            let racers: Vec<_> = (0..16)
                .map(|i| {
                    let coordinator = coordinator.clone();
                    let winners = Arc::clone(&winners);
                    tokio::spawn(async move {
                        if coordinator.initiate_shutdown(ShutdownReason::Signal(i)) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for racer in racers {
                racer.await.unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert!(matches!(coordinator.reason(), Some(ShutdownReason::Signal(_))));
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_run_stops_on_request() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let orchestrator = one_task_orchestrator();
            orchestrator.start().await.unwrap();

            let coordinator = ShutdownCoordinator::new();
            let trigger = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.initiate_shutdown(ShutdownReason::Signal(15));
            });

            let report = coordinator
                .run(&orchestrator, None, Duration::from_secs(1))
                .await;
            assert_eq!(report.reason, ShutdownReason::Signal(15));
            assert!(report.outcome.is_ok());
            assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_run_stops_after_max_runtime() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let orchestrator = one_task_orchestrator();
            orchestrator.start().await.unwrap();

            let coordinator = ShutdownCoordinator::new();
            let report = coordinator
                .run(
                    &orchestrator,
                    Some(Duration::from_millis(30)),
                    Duration::from_secs(1),
                )
                .await;

            assert_eq!(report.reason, ShutdownReason::Timeout);
            assert!(report.outcome.is_ok());
            // Later triggers lose.
            assert!(!coordinator.initiate_shutdown(ShutdownReason::Requested));
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }

    #[tokio::test]
    async fn test_run_stops_on_fault() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let mut registry = ServiceRegistry::new();
            registry.register_task("steady", |stop: StopSignal| async move {
                stop.triggered().await;
                Ok(())
            });
            registry.register_task("doomed", |_stop| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(Error::runtime("disk full"))
            });
            let orchestrator = Orchestrator::new(registry);
            orchestrator.start().await.unwrap();

            let coordinator = ShutdownCoordinator::new();
            let report = coordinator
                .run(&orchestrator, None, Duration::from_secs(1))
                .await;

            assert_eq!(report.reason, ShutdownReason::Fault);
            let fault = report.fault.expect("fault recorded");
            assert!(fault.to_string().contains("doomed"));
            assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
