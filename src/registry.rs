//! Ordered collection of services.
//!
//! Registration order is identity: the first service registered gets id 0
//! and is started first. The registry is filled by the composition root and
//! then handed, whole, to the [`Orchestrator`](crate::orchestrator::Orchestrator).

use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::service::{FnService, Service};
use crate::stop::StopSignal;
use crate::task::CancellableTask;

/// Identifier of a registered service: its registration index.
pub type ServiceId = usize;

/// Ordered list of services, started in order and stopped as a group.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn Service>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.services.iter().map(|s| s.name()))
            .finish()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Returns its id.
    pub fn register<S: Service>(&mut self, service: S) -> ServiceId {
        self.register_arc(Arc::new(service))
    }

    /// Register an already shared service. Returns its id.
    pub fn register_arc(&mut self, service: Arc<dyn Service>) -> ServiceId {
        let id = self.services.len();
        info!(service_id = id, service_name = %service.name(), "Registered service");
        self.services.push(service);
        id
    }

    /// Register a plain start/stop pair built from closures.
    pub fn register_fn<Start, StartFut, Stop, StopFut>(
        &mut self,
        name: &str,
        start: Start,
        stop: Stop,
    ) -> ServiceId
    where
        Start: Fn(StopSignal) -> StartFut + Send + Sync + 'static,
        StartFut: Future<Output = Result<()>> + Send + 'static,
        Stop: Fn(StopSignal) -> StopFut + Send + Sync + 'static,
        StopFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(FnService::new(name, start, stop))
    }

    /// Register a long-running operation wrapped in a [`CancellableTask`].
    pub fn register_task<F, Fut>(&mut self, name: &str, operation: F) -> ServiceId
    where
        F: FnOnce(StopSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(CancellableTask::new(name, operation))
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if no service is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Look up a service by id.
    #[must_use]
    pub fn get(&self, id: ServiceId) -> Option<&Arc<dyn Service>> {
        self.services.get(id)
    }

    /// Iterate services in registration order, with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (ServiceId, &Arc<dyn Service>)> {
        self.services.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_registration_order() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.is_empty());

        let a = registry.register_fn("a", |_| async { Ok(()) }, |_| async { Ok(()) });
        let b = registry.register_task("b", |stop: StopSignal| async move {
            stop.triggered().await;
            Ok(())
        });

        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.len(), 2);
        let names: Vec<_> = registry.iter().map(|(_, s)| s.name().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(registry.get(1).map(|s| s.name()), Some("b"));
        assert!(registry.get(2).is_none());
    }
}
