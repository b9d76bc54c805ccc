//! The service capability: something that can be started and stopped.
//!
//! The orchestrator only ever talks to [`Service`]. Two ready-made variants
//! exist: [`FnService`], a plain start/stop pair built from closures, and
//! [`CancellableTask`](crate::task::CancellableTask), which wraps one
//! long-running operation.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::stop::StopSignal;
use crate::task::ExecutionHandle;

/// Boxed future returned by [`Service`] methods.
pub type ServiceFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A unit of long-running work managed by the orchestrator.
///
/// `start` must return promptly: long-running work belongs in a background
/// task, not in the `start` future. The orchestrator awaits each `start`
/// before starting the next service.
///
/// `stop` is told to give up waiting when `deadline` triggers. It should
/// return soon after, even if the service's own work is still winding down.
pub trait Service: Send + Sync + 'static {
    /// Start the service. `cancel` triggers if startup is aborted.
    fn start<'a>(&'a self, cancel: &'a StopSignal) -> ServiceFuture<'a>;

    /// Stop the service, giving up once `deadline` triggers.
    fn stop<'a>(&'a self, deadline: &'a StopSignal) -> ServiceFuture<'a>;

    /// Get the name of this service.
    fn name(&self) -> &str;

    /// Handle onto the service's background work, if it has any.
    ///
    /// The orchestrator watches it while running and reports an unprompted
    /// failure as fatal.
    fn execution(&self) -> Option<ExecutionHandle> {
        None
    }
}

/// A service built from a start closure and a stop closure.
pub struct FnService<Start, Stop> {
    name: String,
    start: Start,
    stop: Stop,
}

impl<Start, Stop> std::fmt::Debug for FnService<Start, Stop> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnService")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<Start, StartFut, Stop, StopFut> FnService<Start, Stop>
where
    Start: Fn(StopSignal) -> StartFut + Send + Sync + 'static,
    StartFut: Future<Output = Result<()>> + Send + 'static,
    Stop: Fn(StopSignal) -> StopFut + Send + Sync + 'static,
    StopFut: Future<Output = Result<()>> + Send + 'static,
{
    /// Create a service from a pair of closures.
    pub fn new<S: Into<String>>(name: S, start: Start, stop: Stop) -> Self {
        Self {
            name: name.into(),
            start,
            stop,
        }
    }
}

impl<Start, StartFut, Stop, StopFut> Service for FnService<Start, Stop>
where
    Start: Fn(StopSignal) -> StartFut + Send + Sync + 'static,
    StartFut: Future<Output = Result<()>> + Send + 'static,
    Stop: Fn(StopSignal) -> StopFut + Send + Sync + 'static,
    StopFut: Future<Output = Result<()>> + Send + 'static,
{
    fn start<'a>(&'a self, cancel: &'a StopSignal) -> ServiceFuture<'a> {
        Box::pin((self.start)(cancel.clone()))
    }

    fn stop<'a>(&'a self, deadline: &'a StopSignal) -> ServiceFuture<'a> {
        Box::pin((self.stop)(deadline.clone()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fn_service_forwards_calls() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let starts = Arc::new(AtomicUsize::new(0));
            let stops = Arc::new(AtomicUsize::new(0));
            let (s, t) = (Arc::clone(&starts), Arc::clone(&stops));

            let service = FnService::new(
                "pair",
                move |_cancel| {
                    let s = Arc::clone(&s);
                    async move {
                        s.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                move |_deadline| {
                    let t = Arc::clone(&t);
                    async move {
                        t.fetch_add(1, Ordering::SeqCst);
                        Err(Error::shutdown("pair", "flush failed"))
                    }
                },
            );

            let signal = StopSignal::new();
            assert_eq!(service.name(), "pair");
            assert!(service.execution().is_none());
            service.start(&signal).await.unwrap();
            assert!(service.stop(&signal).await.is_err());
            assert_eq!(starts.load(Ordering::SeqCst), 1);
            assert_eq!(stops.load(Ordering::SeqCst), 1);
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
