//! Monotonic stop signal with listener callbacks.
//!
//! A [`StopSignal`] starts untriggered and can be triggered exactly once;
//! further triggers are no-ops. Listeners registered with
//! [`StopSignal::register`] run exactly once, on the first trigger, on the
//! triggering thread. A listener may fail (return `Err` or panic); every such
//! failure is collected and handed back to whoever triggered the signal, and
//! the remaining listeners still run.
//!
//! Signals compose: [`StopSignal::link_to`] makes one signal trigger another,
//! which is how a task's internal stop signal follows an external one without
//! the external one ever observing the internal.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};

type Listener = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct StopInner {
    triggered: AtomicBool,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
    watch_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for StopInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopInner")
            .field("triggered", &self.triggered.load(Ordering::Acquire))
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Cloneable handle to a shared, monotonic stop flag.
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create a new, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(StopInner {
                triggered: AtomicBool::new(false),
                next_listener: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                watch_tx,
            }),
        }
    }

    /// A signal that can never be triggered by anyone else.
    ///
    /// Useful as the external signal of a `start`/`stop` call that has no
    /// deadline.
    #[must_use]
    pub fn never() -> Self {
        Self::new()
    }

    /// Check if the signal has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Trigger the signal.
    ///
    /// Only the first call runs the listeners; it returns the failures they
    /// produced, folded into one error. Later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the aggregated listener failures of the first trigger.
    pub fn trigger(&self) -> Result<()> {
        match Error::aggregate(self.trigger_collect()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Trigger the signal and return every listener failure individually.
    pub fn trigger_collect(&self) -> Vec<Error> {
        if self
            .inner
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Vec::new();
        }

        self.inner.watch_tx.send_replace(true);

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        debug!(listeners = listeners.len(), "Stop signal triggered");

        let mut failures = Vec::new();
        for (_, listener) in listeners {
            if let Err(e) = run_listener(listener) {
                warn!(error = %e, "Stop listener failed");
                failures.push(e);
            }
        }
        failures
    }

    /// Wait until the signal is triggered. Returns immediately if it already is.
    pub async fn triggered(&self) {
        if self.is_triggered() {
            return;
        }
        let mut rx = self.inner.watch_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives as long as `self`; closed never happens here.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register a listener to run on the first trigger.
    ///
    /// If the signal is already triggered, the listener runs immediately on
    /// the calling thread and its failure, if any, is returned.
    ///
    /// The returned [`Registration`] removes the listener when dropped, unless
    /// it has already run.
    ///
    /// # Errors
    ///
    /// Returns the listener's failure when it ran immediately.
    pub fn register<F>(&self, listener: F) -> Result<Registration>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.inner.listeners.lock();
            // Checked under the lock: `trigger_collect` drains under the same
            // lock after setting the flag.
            if !self.is_triggered() {
                listeners.push((id, Box::new(listener)));
                return Ok(Registration {
                    signal: Arc::downgrade(&self.inner),
                    id,
                });
            }
        }

        run_listener(Box::new(listener))?;
        Ok(Registration::empty())
    }

    /// Make `self` trigger `target` when it triggers.
    ///
    /// Failures raised by `target`'s own listeners surface as this
    /// listener's failure. The link holds only a weak reference to `target`.
    ///
    /// # Errors
    ///
    /// When `self` is already triggered, `target` is triggered right away and
    /// its listener failures are returned.
    pub fn link_to(&self, target: &Self) -> Result<Registration> {
        let weak = Arc::downgrade(&target.inner);
        self.register(move || match weak.upgrade() {
            Some(inner) => Self { inner }.trigger(),
            None => Ok(()),
        })
    }

    /// Number of listeners waiting for the first trigger.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

fn run_listener(listener: Listener) -> Result<()> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(listener)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(payload) => {
            let panic = Error::from_panic("stop listener", payload.as_ref());
            Err(Error::shutdown_with_source(
                ErrorCode::StopListenerFailed,
                "stop-signal",
                "listener panicked",
                panic,
            ))
        }
    }
}

/// Keeps a listener registered; dropping it unregisters the listener.
#[derive(Debug)]
#[must_use = "dropping a Registration unregisters its listener"]
pub struct Registration {
    signal: Weak<StopInner>,
    id: u64,
}

impl Registration {
    const fn empty() -> Self {
        Self {
            signal: Weak::new(),
            id: 0,
        }
    }

    /// Keep the listener registered for the lifetime of the signal.
    pub fn forget(mut self) {
        self.signal = Weak::new();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.signal.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_trigger_is_monotonic_and_idempotent() {
        let signal = StopSignal::new();
        assert!(!signal.is_triggered());

        assert!(signal.trigger().is_ok());
        assert!(signal.is_triggered());

        assert!(signal.trigger().is_ok());
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_listeners_run_exactly_once() {
        let signal = StopSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        signal
            .register(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
            .forget();

        signal.trigger().unwrap();
        signal.trigger().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn test_listener_failures_are_collected() {
        let signal = StopSignal::new();
        let ran_last = Arc::new(AtomicBool::new(false));

        signal
            .register(|| Err(Error::shutdown("first", "refused")))
            .unwrap()
            .forget();
        signal
            .register(|| panic!("listener blew up"))
            .unwrap()
            .forget();
        let flag = Arc::clone(&ran_last);
        signal
            .register(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
            .forget();

        let failures = signal.trigger_collect();
        assert_eq!(failures.len(), 2);
        assert!(ran_last.load(Ordering::SeqCst));
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_register_after_trigger_runs_immediately() {
        let signal = StopSignal::new();
        signal.trigger().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let _registration = signal
            .register(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = signal
            .register(|| Err(Error::shutdown("late", "nope")))
            .unwrap_err();
        assert_eq!(err.category(), "shutdown");
    }

    #[test]
    fn test_dropped_registration_does_not_run() {
        let signal = StopSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let registration = signal
            .register(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        drop(registration);

        signal.trigger().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_link_propagates_one_way() {
        let external = StopSignal::new();
        let internal = StopSignal::new();
        let _link = external.link_to(&internal).unwrap();

        internal.trigger().unwrap();
        assert!(!external.is_triggered());

        let external = StopSignal::new();
        let internal = StopSignal::new();
        let _link = external.link_to(&internal).unwrap();
        external.trigger().unwrap();
        assert!(internal.is_triggered());
    }

    #[test]
    fn test_link_surfaces_target_listener_failure() {
        let external = StopSignal::new();
        let internal = StopSignal::new();
        internal
            .register(|| Err(Error::shutdown("inner", "listener failed")))
            .unwrap()
            .forget();
        let _link = external.link_to(&internal).unwrap();

        let err = external.trigger().unwrap_err();
        assert!(err.is_aggregated());
        assert!(internal.is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_wakes_waiters() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let signal = StopSignal::new();
            let waiter = {
                let signal = signal.clone();
                tokio::spawn(async move { signal.triggered().await })
            };

            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.trigger().unwrap();
            waiter.await.unwrap();

            // Already triggered: returns immediately.
            signal.triggered().await;
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
