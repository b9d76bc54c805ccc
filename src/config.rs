//! Configuration management for the host.
//!
//! Settings are layered with clear precedence, lowest first:
//!
//! 1. Built-in defaults
//! 2. A TOML file (with the `toml` feature), if it exists
//! 3. `HOST_`-prefixed environment variables, nested with `__`
//!    (for example `HOST_SHUTDOWN__TIMEOUT_MS=2000`)

use figment::providers::{Env, Serialized};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level logging (most verbose)
    Trace,
    /// Debug level logging
    Debug,
    /// Info level logging (default)
    #[default]
    Info,
    /// Warning level logging
    Warn,
    /// Error level logging
    Error,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level
    pub level: LogLevel,
    /// Enable JSON formatted logs (needs the `json-logs` feature)
    pub json: bool,
    /// Enable colored output (ignored for JSON logs)
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            color: true,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for stopping every service, in milliseconds
    pub timeout_ms: u64,
    /// Stop the host after running this long, in milliseconds
    pub max_runtime_ms: Option<u64>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: crate::DEFAULT_SHUTDOWN_TIMEOUT_MS,
            max_runtime_ms: None,
        }
    }
}

/// Request-context pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pooled objects per available hardware thread
    pub capacity_per_cpu: usize,
    /// Absolute capacity; overrides `capacity_per_cpu` when set
    pub capacity: Option<usize>,
    /// Objects created up front
    pub prewarm: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_per_cpu: crate::DEFAULT_POOL_CAPACITY_PER_CPU,
            capacity: None,
            prewarm: 0,
        }
    }
}

/// Main host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host name/identifier
    pub name: String,
    /// Logging configuration
    pub logging: LogConfig,
    /// Shutdown configuration
    pub shutdown: ShutdownConfig,
    /// Pool configuration
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("proc-host"),
            logging: LogConfig::default(),
            shutdown: ShutdownConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default file location.
    ///
    /// # Errors
    ///
    /// Will return an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from_file(crate::DEFAULT_CONFIG_FILE)
    }

    /// Load config from defaults, `path` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Will return an error if the file cannot be read or contains invalid configuration data.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        #[allow(unused_mut)]
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if path.exists() {
            #[cfg(feature = "toml")]
            {
                use figment::providers::Format;
                figment = figment.merge(figment::providers::Toml::file(path));
            }
            #[cfg(not(feature = "toml"))]
            tracing::warn!(path = %path.display(), "Config file ignored, built without TOML support");
        }

        let config: Self = figment
            .merge(Env::prefixed(crate::ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with `provider` layered over the defaults.
    ///
    /// # Errors
    ///
    /// Will return an error if the provider fails to load a valid configuration.
    pub fn load_with_provider<P: Provider>(provider: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(provider)
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the stop deadline as a Duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.timeout_ms)
    }

    /// Get the maximum runtime as a Duration.
    #[must_use]
    pub fn max_runtime(&self) -> Option<Duration> {
        self.shutdown.max_runtime_ms.map(Duration::from_millis)
    }

    /// Resolved capacity of each request-context pool.
    #[must_use]
    pub fn pool_capacity(&self) -> usize {
        self.pool
            .capacity
            .unwrap_or_else(|| crate::pool::default_capacity(self.pool.capacity_per_cpu))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if any configuration values are invalid or missing required fields.
    pub fn validate(&self) -> Result<()> {
        if self.shutdown.timeout_ms == 0 {
            return Err(Error::config("Shutdown timeout must be greater than 0"));
        }

        if self.shutdown.max_runtime_ms == Some(0) {
            return Err(Error::config("Maximum runtime must be greater than 0"));
        }

        if self.pool.capacity == Some(0) || self.pool.capacity_per_cpu == 0 {
            return Err(Error::config("Pool capacity must be greater than 0"));
        }

        if self.name.is_empty() {
            return Err(Error::config("Host name cannot be empty"));
        }

        Ok(())
    }

    /// Check if colored logging is enabled.
    #[must_use]
    pub const fn is_colored_logging(&self) -> bool {
        self.logging.color && !self.logging.json
    }

    /// Create a builder for this configuration.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for creating configurations programmatically.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host name.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the log level.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Enable JSON logging.
    #[must_use]
    pub const fn json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Set the stop deadline.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.config.shutdown.timeout_ms = u64::try_from(timeout.as_millis())
            .map_err(|_| Error::config("Shutdown timeout too large"))?;
        Ok(self)
    }

    /// Set the maximum runtime.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn max_runtime(mut self, runtime: Duration) -> Result<Self> {
        self.config.shutdown.max_runtime_ms = Some(
            u64::try_from(runtime.as_millis())
                .map_err(|_| Error::config("Maximum runtime too large"))?,
        );
        Ok(self)
    }

    /// Set an absolute pool capacity.
    #[must_use]
    pub const fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool.capacity = Some(capacity);
        self
    }

    /// Set how many pooled objects to create up front.
    #[must_use]
    pub const fn pool_prewarm(mut self, prewarm: usize) -> Self {
        self.config.pool.prewarm = prewarm;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if the configuration is invalid.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "proc-host");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(!config.logging.json);
        assert!(config.is_colored_logging());
        assert!(config.max_runtime().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .name("test-host")
            .log_level(LogLevel::Debug)
            .json_logging(true)
            .shutdown_timeout(Duration::from_secs(10))
            .unwrap()
            .max_runtime(Duration::from_secs(60))
            .unwrap()
            .pool_capacity(16)
            .pool_prewarm(4)
            .build()
            .unwrap();

        assert_eq!(config.name, "test-host");
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(!config.is_colored_logging());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_runtime(), Some(Duration::from_secs(60)));
        assert_eq!(config.pool_capacity(), 16);
        assert_eq!(config.pool.prewarm, 4);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.shutdown.timeout_ms = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.shutdown.timeout_ms = 5000;
        config.shutdown.max_runtime_ms = Some(0);
        assert!(config.validate().is_err());

        config.shutdown.max_runtime_ms = None;
        config.pool.capacity = Some(0);
        assert!(config.validate().is_err());

        config.pool.capacity = None;
        config.name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_capacity_scales_with_cpus() {
        let config = Config::default();
        assert!(config.pool_capacity() >= crate::DEFAULT_POOL_CAPACITY_PER_CPU);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Info), tracing::Level::INFO);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warn.as_str(), "warn");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.shutdown.timeout_ms, crate::DEFAULT_SHUTDOWN_TIMEOUT_MS);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name = "edge"

[shutdown]
timeout_ms = 2500
max_runtime_ms = 60000

[pool]
capacity = 32
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(2500));
        assert_eq!(config.max_runtime(), Some(Duration::from_secs(60)));
        assert_eq!(config.pool_capacity(), 32);
        // Untouched sections keep their defaults.
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shutdown]\ntimeout_ms = 0").unwrap();
        assert!(Config::load_from_file(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shutdown]\ntimeout_ms = \"soon\"").unwrap();
        let err = Config::load_from_file(file.path()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigParse);
    }

    #[test]
    fn test_load_with_provider() {
        let overrides = Serialized::default("shutdown.timeout_ms", 750);
        let config = Config::load_with_provider(overrides).unwrap();
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(750));
    }
}
