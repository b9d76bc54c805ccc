//! Host assembly with builder pattern.
//!
//! A [`Host`] ties the pieces together: a configured [`Orchestrator`] over the
//! registered services, a [`ShutdownCoordinator`] fed by OS signals, and a
//! [`ContextPool`] sized from configuration.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::ContextPool;
use crate::error::{Error, ErrorCode, Result};
use crate::orchestrator::{Orchestrator, OrchestratorStats};
use crate::registry::{ServiceId, ServiceRegistry};
use crate::service::Service;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownReport};
use crate::signal::{SignalConfig, SignalHandler};
use crate::stop::StopSignal;

/// A configured service host.
pub struct Host {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    coordinator: ShutdownCoordinator,
    contexts: Arc<ContextPool>,
    signal_handler: Option<Arc<SignalHandler>>,
    init_logging: bool,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.config.name)
            .field("orchestrator", &self.orchestrator)
            .field("signals", &self.signal_handler.is_some())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Create a new host builder.
    #[must_use]
    pub fn builder(config: Config) -> HostBuilder {
        HostBuilder::new(config)
    }

    /// Create a host builder from the default configuration sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded.
    pub fn with_defaults() -> Result<HostBuilder> {
        Ok(HostBuilder::new(Config::load()?))
    }

    /// Start every service, wait for a shutdown trigger, then stop them.
    ///
    /// Shutdown triggers are OS signals (unless disabled), [`Host::shutdown`]
    /// or any clone of [`Host::coordinator`], the configured maximum runtime,
    /// and a service failing while running. A shutdown requested while
    /// services are still starting interrupts the start sequence.
    ///
    /// # Errors
    ///
    /// Returns the startup failure if a service failed to start, or a
    /// `Config` error if logging could not be initialized. Failures during
    /// the stop sequence are reported in [`ShutdownReport::outcome`].
    pub async fn run(&self) -> Result<ShutdownReport> {
        if self.init_logging {
            crate::logging::init(&self.config.logging)?;
        }

        let started_at = Instant::now();
        info!(host_name = %self.config.name, services = self.orchestrator.registry().len(), "Starting host");

        let signal_task = self.signal_handler.as_ref().map(|handler| {
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                if let Err(e) = handler.handle_signals().await {
                    error!(error = %e, "Signal handler error");
                }
            })
        });

        let mut stopper = {
            let orchestrator = Arc::clone(&self.orchestrator);
            let coordinator = self.coordinator.clone();
            let max_runtime = self.config.max_runtime();
            let deadline = self.config.shutdown_timeout();
            tokio::spawn(async move {
                coordinator
                    .run(&orchestrator, max_runtime, deadline)
                    .await
            })
        };

        let start = self.orchestrator.start();
        tokio::pin!(start);
        let (startup, joined) = tokio::select! {
            result = &mut start => (Some(result), None),
            // The stop deadline elapsed while a start was still in flight.
            joined = &mut stopper => (None, Some(joined)),
        };

        let startup_failure = match startup {
            Some(Ok(())) => {
                info!("Host started successfully, waiting for shutdown");
                None
            }
            Some(Err(e)) if self.coordinator.is_shutdown() => {
                debug!(error = %e, "Startup interrupted by shutdown");
                None
            }
            Some(Err(e)) => {
                error!(error = %e, "Failed to start all services");
                self.coordinator.report_fault(e.clone());
                Some(e)
            }
            None => {
                warn!("Shutdown finished before startup returned, abandoning startup");
                None
            }
        };

        let joined = match joined {
            Some(joined) => joined,
            None => stopper.await,
        };
        let report = joined.map_err(|e| {
            Error::runtime_with_source(
                ErrorCode::RuntimeJoinFailed,
                "shutdown sequence did not complete",
                e,
            )
        })?;

        if let Some(task) = signal_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Signal handler task failed");
            }
        }

        if let Some(e) = startup_failure {
            return Err(e);
        }

        match &report.outcome {
            Ok(()) => info!(
                reason = %report.reason,
                uptime_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Host stopped"
            ),
            Err(e) => warn!(reason = %report.reason, error = %e, "Host stopped with errors"),
        }
        Ok(report)
    }

    /// Request shutdown. Returns `true` if this call initiated it.
    pub fn shutdown(&self) -> bool {
        self.coordinator.initiate_shutdown(ShutdownReason::Requested)
    }

    /// Shutdown coordinator shared with signal handling and services.
    #[must_use]
    pub const fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Pool of per-request contexts.
    #[must_use]
    pub fn context_pool(&self) -> Arc<ContextPool> {
        Arc::clone(&self.contexts)
    }

    /// The orchestrator driving the registered services.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Snapshot of the orchestrator and every service.
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }

    /// Check if every service is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    /// Get the host configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Builder for creating hosts with fluent API.
pub struct HostBuilder {
    config: Config,
    registry: ServiceRegistry,
    contexts: Arc<ContextPool>,
    signal_config: Option<SignalConfig>,
    init_logging: bool,
}

impl std::fmt::Debug for HostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("signal_config", &self.signal_config)
            .field("init_logging", &self.init_logging)
            .finish_non_exhaustive()
    }
}

impl HostBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let contexts = Arc::new(ContextPool::new(config.pool_capacity(), config.pool.prewarm));
        Self {
            config,
            registry: ServiceRegistry::new(),
            contexts,
            signal_config: Some(SignalConfig::default()),
            init_logging: true,
        }
    }

    /// Register a service.
    #[must_use]
    pub fn with_service<S: Service>(mut self, service: S) -> Self {
        self.registry.register(service);
        self
    }

    /// Register a plain start/stop pair built from closures.
    #[must_use]
    pub fn with_service_fn<Start, StartFut, Stop, StopFut>(
        mut self,
        name: &str,
        start: Start,
        stop: Stop,
    ) -> Self
    where
        Start: Fn(StopSignal) -> StartFut + Send + Sync + 'static,
        StartFut: Future<Output = Result<()>> + Send + 'static,
        Stop: Fn(StopSignal) -> StopFut + Send + Sync + 'static,
        StopFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register_fn(name, start, stop);
        self
    }

    /// Register a long-running operation that runs until stopped.
    #[must_use]
    pub fn with_task<F, Fut>(mut self, name: &str, operation: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register_task(name, operation);
        self
    }

    /// Register services directly against the registry.
    #[must_use]
    pub fn with_registry<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&mut ServiceRegistry) -> ServiceId,
    {
        register(&mut self.registry);
        self
    }

    /// Pool of per-request contexts the built host will expose through
    /// [`Host::context_pool`]. Hand it to services while registering them.
    #[must_use]
    pub fn context_pool(&self) -> Arc<ContextPool> {
        Arc::clone(&self.contexts)
    }

    /// Choose which OS signals trigger shutdown.
    #[must_use]
    pub const fn with_signal_config(mut self, config: SignalConfig) -> Self {
        self.signal_config = Some(config);
        self
    }

    /// Disable OS signal handling.
    #[must_use]
    pub const fn without_signals(mut self) -> Self {
        self.signal_config = None;
        self
    }

    /// Leave the global tracing subscriber alone.
    #[must_use]
    pub const fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    /// Build the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<Host> {
        self.config.validate()?;

        let coordinator = ShutdownCoordinator::new();
        let signal_handler = self
            .signal_config
            .map(|config| Arc::new(SignalHandler::new(coordinator.clone(), config)));
        let orchestrator = Orchestrator::new(self.registry)
            .with_cleanup_timeout(self.config.shutdown_timeout());
        debug!(
            services = orchestrator.registry().len(),
            pool_capacity = self.config.pool_capacity(),
            "Host built"
        );

        Ok(Host {
            config: Arc::new(self.config),
            orchestrator: Arc::new(orchestrator),
            coordinator,
            contexts: self.contexts,
            signal_handler,
            init_logging: self.init_logging,
        })
    }

    /// Build and run the host in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be built or a service fails to start.
    pub async fn run(self) -> Result<ShutdownReport> {
        let host = self.build()?;
        host.run().await
    }
}
