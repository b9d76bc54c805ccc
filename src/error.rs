//! Error handling for the proc-host runtime.
//!
//! Every failure the lifecycle core can produce is represented by [`Error`].
//! Each variant carries a stable [`ErrorCode`] for metrics and programmatic
//! handling, a human-readable message and, where one exists, the underlying
//! source error.
//!
//! # Taxonomy
//!
//! * [`Error::Startup`]: a service's `start` failed.
//! * [`Error::Shutdown`]: a service's `stop` failed, or a stop listener failed.
//! * [`Error::Timeout`]: the stop deadline elapsed before every service finished.
//! * [`Error::Aggregated`]: one or more of the above, collected while stopping
//!   services concurrently.
//!
//! Sources are held behind an `Arc`, which makes [`Error`] cheap to clone. The
//! orchestrator relies on this to hand the same stop outcome to every caller
//! of `stop`.
//!
//! ```no_run
//! use proc_host::{Error, Result};
//!
//! fn open_listener(port: u16) -> Result<()> {
//!     if port == 0 {
//!         return Err(Error::startup("listener", "port must be non-zero"));
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

/// Result type alias for proc-host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Shared, type-erased source error.
pub type Source = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error code enum for categorizing and identifying errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    // Configuration errors: 1000-1999
    ConfigInvalid = 1000,
    ConfigParse = 1001,

    // Signal handling errors: 2000-2999
    SignalRegisterFailed = 2000,
    SignalInvalid = 2001,

    // Shutdown errors: 3000-3999
    ShutdownTimeout = 3000,
    ShutdownFailed = 3001,
    ShutdownAggregated = 3002,
    StopListenerFailed = 3003,

    // Service errors: 4000-4999
    ServiceStartFailed = 4000,
    ServiceAlreadyStarted = 4001,
    ServiceFaulted = 4002,

    // IO errors: 5000-5999
    IoError = 5000,

    // Runtime errors: 6000-6999
    RuntimePanic = 6000,
    RuntimeJoinFailed = 6001,

    // State errors: 9000-9999
    InvalidStateTransition = 9000,
    InvalidStateValue = 9001,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_str(), *self as i32)
    }
}

impl ErrorCode {
    /// Convert error code to string representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ConfigParse => "CONFIG_PARSE",

            Self::SignalRegisterFailed => "SIGNAL_REGISTER_FAILED",
            Self::SignalInvalid => "SIGNAL_INVALID",

            Self::ShutdownTimeout => "SHUTDOWN_TIMEOUT",
            Self::ShutdownFailed => "SHUTDOWN_FAILED",
            Self::ShutdownAggregated => "SHUTDOWN_AGGREGATED",
            Self::StopListenerFailed => "STOP_LISTENER_FAILED",

            Self::ServiceStartFailed => "SERVICE_START_FAILED",
            Self::ServiceAlreadyStarted => "SERVICE_ALREADY_STARTED",
            Self::ServiceFaulted => "SERVICE_FAULTED",

            Self::IoError => "IO_ERROR",

            Self::RuntimePanic => "RUNTIME_PANIC",
            Self::RuntimeJoinFailed => "RUNTIME_JOIN_FAILED",

            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::InvalidStateValue => "INVALID_STATE_VALUE",
        }
    }
}

/// Comprehensive error type for all host operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// A service failed to start
    #[error("Service '{service}' failed to start [{code}]: {message}")]
    Startup {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Name of the service
        service: String,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Source>,
    },

    /// A service, or one of its stop listeners, failed while stopping
    #[error("Service '{service}' failed to stop [{code}]: {message}")]
    Shutdown {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Name of the service
        service: String,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Source>,
    },

    /// A deadline elapsed
    #[error("Operation timed out [{code}] after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Several failures collected from concurrent work
    #[error("{} failure(s) [{code}]: {}", .errors.len(), join_messages(.errors))]
    Aggregated {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Every member failure, in collection order
        errors: Vec<Error>,
    },

    /// Configuration-related errors
    #[error("Configuration error [{code}]: {message}")]
    Config {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Source>,
    },

    /// Signal handling errors
    #[error("Signal handling error [{code}]: {message}")]
    Signal {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Signal number if applicable
        signal: Option<i32>,
    },

    /// Invalid state errors
    #[error("Invalid state [{code}]: {message}")]
    InvalidState {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Current state if applicable
        current_state: Option<String>,
    },

    /// I/O operation errors
    #[error("I/O error [{code}]: {message}")]
    Io {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Source>,
    },

    /// Runtime errors (panics, failed joins)
    #[error("Runtime error [{code}]: {message}")]
    Runtime {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Source>,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a new startup failure for the named service.
    pub fn startup<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Startup {
            code: ErrorCode::ServiceStartFailed,
            service: service.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a new startup failure with a source error.
    pub fn startup_with_source<S, M, E>(service: S, message: M, source: E) -> Self
    where
        S: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Startup {
            code: ErrorCode::ServiceStartFailed,
            service: service.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a new shutdown failure for the named service.
    pub fn shutdown<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Shutdown {
            code: ErrorCode::ShutdownFailed,
            service: service.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a new shutdown failure with a specific code and source error.
    pub fn shutdown_with_source<S, M, E>(code: ErrorCode, service: S, message: M, source: E) -> Self
    where
        S: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Shutdown {
            code,
            service: service.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            code: ErrorCode::ShutdownTimeout,
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Fold a list of failures into one composite failure.
    ///
    /// Returns `None` when `errors` is empty. Nested aggregates are flattened so
    /// the composite lists every leaf failure exactly once.
    #[must_use]
    pub fn aggregate(errors: Vec<Self>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                Self::Aggregated { errors: inner, .. } => flat.extend(inner),
                other => flat.push(other),
            }
        }
        Some(Self::Aggregated {
            code: ErrorCode::ShutdownAggregated,
            errors: flat,
        })
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            code: ErrorCode::ConfigInvalid,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new signal error with signal number.
    pub fn signal_with_number<S: Into<String>>(message: S, signal: i32) -> Self {
        Self::Signal {
            code: ErrorCode::SignalRegisterFailed,
            message: message.into(),
            signal: Some(signal),
        }
    }

    /// Create a new signal error.
    pub fn signal<S: Into<String>>(message: S) -> Self {
        Self::Signal {
            code: ErrorCode::SignalInvalid,
            message: message.into(),
            signal: None,
        }
    }

    /// Create a new invalid state error.
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            code: ErrorCode::InvalidStateValue,
            message: message.into(),
            current_state: None,
        }
    }

    /// Create a new invalid state error with current state.
    pub fn invalid_state_with_current<S: Into<String>, C: Into<String>>(
        message: S,
        current_state: C,
    ) -> Self {
        Self::InvalidState {
            code: ErrorCode::InvalidStateTransition,
            message: message.into(),
            current_state: Some(current_state.into()),
        }
    }

    /// Create a new invalid state error with specific code.
    pub fn invalid_state_with_code<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self::InvalidState {
            code,
            message: message.into(),
            current_state: None,
        }
    }

    /// Create a new I/O error with source error.
    pub fn io_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Io {
            code: ErrorCode::IoError,
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a new runtime error.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            code: ErrorCode::RuntimePanic,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new runtime error with specific code and source error.
    pub fn runtime_with_source<S, E>(code: ErrorCode, message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime {
            code,
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Build a runtime error from a caught panic payload.
    pub(crate) fn from_panic(context: &str, payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::runtime(format!("{context} panicked: {detail}"))
    }

    /// The error code of this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Startup { code, .. }
            | Self::Shutdown { code, .. }
            | Self::Timeout { code, .. }
            | Self::Aggregated { code, .. }
            | Self::Config { code, .. }
            | Self::Signal { code, .. }
            | Self::InvalidState { code, .. }
            | Self::Io { code, .. }
            | Self::Runtime { code, .. } => *code,
        }
    }

    /// Check if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is a composite of several failures.
    #[must_use]
    pub const fn is_aggregated(&self) -> bool {
        matches!(self, Self::Aggregated { .. })
    }

    /// Check if this error is a startup failure.
    #[must_use]
    pub const fn is_startup(&self) -> bool {
        matches!(self, Self::Startup { .. })
    }

    /// Check if this error is configuration-related.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Leaf failures carried by this error.
    ///
    /// An aggregate yields its members; any other error yields itself.
    #[must_use]
    pub fn failures(&self) -> &[Self] {
        match self {
            Self::Aggregated { errors, .. } => errors,
            other => std::slice::from_ref(other),
        }
    }

    /// Check if this error, or any member of an aggregate, is a timeout.
    #[must_use]
    pub fn contains_timeout(&self) -> bool {
        self.failures().iter().any(Self::is_timeout)
    }

    /// Get the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Startup { .. } => "startup",
            Self::Shutdown { .. } => "shutdown",
            Self::Timeout { .. } => "timeout",
            Self::Aggregated { .. } => "aggregated",
            Self::Config { .. } => "config",
            Self::Signal { .. } => "signal",
            Self::InvalidState { .. } => "state",
            Self::Io { .. } => "io",
            Self::Runtime { .. } => "runtime",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_with_source("I/O operation failed", err)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config {
            code: ErrorCode::ConfigParse,
            message: format!("Configuration loading failed: {err}"),
            source: Some(Arc::new(err)),
        }
    }
}
