#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//! # proc-host: Service Lifecycle Host
//!
//! Building blocks for long-running processes that host several services:
//! ordered startup with rollback, deadline-bounded concurrent stop, a single
//! shutdown decision point fed by OS signals and faults, and lock-free object
//! pools for per-request state.
//!
//! ## Key Features
//!
//! - **Cancellable tasks**: long-running work started in the background and
//!   stopped through a [`StopSignal`]
//! - **Ordered lifecycle**: services start in registration order; a failed
//!   start stops the already-started ones in reverse
//! - **Bounded stop**: all services stop concurrently, abandoned at a deadline
//! - **First-writer-wins shutdown**: signals, requests, max runtime and
//!   service faults all race for one [`ShutdownReason`]
//! - **Object pools**: bounded, non-blocking pools with reset-on-release,
//!   including a two-layer [`ContextPool`]
//! - **Configuration**: defaults, TOML file, and `HOST_` environment variables
//! - **Structured Logging**: `tracing` with optional JSON output
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use proc_host::{Config, Host, Result, StopSignal};
//!
//! async fn worker(stop: StopSignal) -> Result<()> {
//!     stop.triggered().await;
//!     tracing::info!("Worker shutting down gracefully");
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let report = Host::builder(Config::load()?)
//!         .with_task("worker", worker)
//!         .run()
//!         .await?;
//!     report.outcome
//! }
//! ```

// Private modules
mod config;
mod error;
mod host;
mod pool;

// Public modules
pub mod context;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod signal;
pub mod stop;
pub mod task;

// Public exports
pub use config::{Config, ConfigBuilder, LogConfig, LogLevel, PoolConfig, ShutdownConfig};
pub use context::{ContextPool, FeatureSet, PooledContext, RequestContext};
pub use error::{Error, ErrorCode, Result};
pub use host::{Host, HostBuilder};
pub use orchestrator::{
    LifecycleState, Orchestrator, OrchestratorStats, ServiceMetadata, ServiceState,
};
pub use pool::*;
pub use registry::{ServiceId, ServiceRegistry};
pub use service::{FnService, Service, ServiceFuture};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownReport};
pub use signal::{SignalConfig, SignalHandler};
pub use stop::{Registration, StopSignal};
pub use task::{CancellableTask, ExecutionHandle, TaskOutcome};

/// Version of the proc-host library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default stop deadline in milliseconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Default pool slots per available CPU
pub const DEFAULT_POOL_CAPACITY_PER_CPU: usize = 4;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "host.toml";

/// Prefix of environment variables overriding configuration
pub const ENV_PREFIX: &str = "HOST_";
