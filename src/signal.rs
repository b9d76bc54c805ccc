//! OS abort signals feeding the shutdown coordinator.
//!
//! On Unix, SIGTERM, SIGINT, SIGQUIT and SIGHUP are handled; on Windows,
//! Ctrl+C and Ctrl+Break. Each received signal is forwarded to the
//! [`ShutdownCoordinator`] as [`ShutdownReason::Signal`]; the handler stops
//! listening once shutdown has been initiated, whoever initiated it.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

/// Which signals to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalConfig {
    /// SIGTERM
    pub term: bool,
    /// SIGINT, or Ctrl+C on Windows
    pub interrupt: bool,
    /// SIGQUIT, or Ctrl+Break on Windows
    pub quit: bool,
    /// SIGHUP
    pub hangup: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            term: true,
            interrupt: true,
            quit: true,
            hangup: true,
        }
    }
}

/// Signal handler that turns OS signals into shutdown requests.
#[derive(Debug)]
pub struct SignalHandler {
    shutdown_coordinator: ShutdownCoordinator,
    config: SignalConfig,
    handling_signals: AtomicBool,
}

impl SignalHandler {
    /// Create a new signal handler.
    #[must_use]
    pub const fn new(shutdown_coordinator: ShutdownCoordinator, config: SignalConfig) -> Self {
        Self {
            shutdown_coordinator,
            config,
            handling_signals: AtomicBool::new(false),
        }
    }

    /// Handle signals until shutdown has been initiated.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handling is already active or if a handler
    /// could not be registered.
    pub async fn handle_signals(&self) -> Result<()> {
        if self
            .handling_signals
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::invalid_state("Signal handling already started"));
        }

        info!("Starting signal handler");
        let result = self.handle_platform_signals().await;
        self.handling_signals.store(false, Ordering::Release);
        result
    }

    /// Check if signal handling is active.
    #[must_use]
    pub fn is_handling(&self) -> bool {
        self.handling_signals.load(Ordering::Acquire)
    }

    fn forward(&self, signal: i32) -> bool {
        info!(signal, description = signal_description(signal), "Received signal");
        self.shutdown_coordinator
            .initiate_shutdown(ShutdownReason::Signal(signal))
    }
}

#[cfg(unix)]
impl SignalHandler {
    async fn handle_platform_signals(&self) -> Result<()> {
        use tokio::signal::unix::{signal, Signal, SignalKind};

        fn install(enabled: bool, kind: SignalKind, number: i32) -> Result<Option<Signal>> {
            if !enabled {
                return Ok(None);
            }
            signal(kind).map(Some).map_err(|e| {
                Error::signal_with_number(format!("Failed to register handler: {e}"), number)
            })
        }

        async fn recv(stream: &mut Option<Signal>) {
            match stream {
                Some(s) => {
                    if s.recv().await.is_none() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        }

        let mut sigterm = install(self.config.term, SignalKind::terminate(), 15)?;
        let mut sigint = install(self.config.interrupt, SignalKind::interrupt(), 2)?;
        let mut sigquit = install(self.config.quit, SignalKind::quit(), 3)?;
        let mut sighup = install(self.config.hangup, SignalKind::hangup(), 1)?;

        info!(config = ?self.config, "Unix signal handlers registered");

        loop {
            let signal = tokio::select! {
                () = recv(&mut sigterm) => 15,
                () = recv(&mut sigint) => 2,
                () = recv(&mut sigquit) => 3,
                () = recv(&mut sighup) => 1,
                () = self.shutdown_coordinator.wait() => {
                    debug!("Shutdown initiated elsewhere, signal handler exiting");
                    return Ok(());
                }
            };

            if self.forward(signal) {
                return Ok(());
            }
            warn!(signal, "Shutdown already in progress, signal ignored");
        }
    }
}

#[cfg(windows)]
impl SignalHandler {
    async fn handle_platform_signals(&self) -> Result<()> {
        use tokio::signal::windows::{ctrl_break, ctrl_c};

        let mut ctrl_c_stream = ctrl_c()
            .map_err(|e| Error::signal(format!("Failed to register Ctrl+C handler: {e}")))?;
        let mut ctrl_break_stream = ctrl_break()
            .map_err(|e| Error::signal(format!("Failed to register Ctrl+Break handler: {e}")))?;

        info!("Windows console event handlers registered");

        loop {
            let signal = tokio::select! {
                _ = ctrl_c_stream.recv(), if self.config.interrupt => 2,
                _ = ctrl_break_stream.recv(), if self.config.quit => 3,
                () = self.shutdown_coordinator.wait() => {
                    debug!("Shutdown initiated elsewhere, signal handler exiting");
                    return Ok(());
                }
            };

            if self.forward(signal) {
                return Ok(());
            }
            warn!(signal, "Shutdown already in progress, signal ignored");
        }
    }
}

/// Helper function to get a human-readable description of a signal.
#[must_use]
pub const fn signal_description(signal: i32) -> &'static str {
    match signal {
        1 => "SIGHUP (Hangup)",
        2 => "SIGINT (Interrupt/Ctrl+C)",
        3 => "SIGQUIT (Quit/Ctrl+Break)",
        15 => "SIGTERM (Terminate)",
        _ => "Unknown signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_description() {
        assert_eq!(signal_description(15), "SIGTERM (Terminate)");
        assert_eq!(signal_description(2), "SIGINT (Interrupt/Ctrl+C)");
        assert_eq!(signal_description(42), "Unknown signal");
    }

    #[tokio::test]
    async fn test_handler_exits_when_shutdown_initiated_elsewhere() {
        let test_result = tokio::time::timeout(Duration::from_secs(5), async {
            let coordinator = ShutdownCoordinator::new();
            let handler = SignalHandler::new(
                coordinator.clone(),
                SignalConfig {
                    term: false,
                    interrupt: false,
                    quit: false,
                    hangup: false,
                },
            );

            let trigger = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.initiate_shutdown(ShutdownReason::Requested);
            });

            handler.handle_signals().await.unwrap();
            assert!(!handler.is_handling());
            assert_eq!(coordinator.reason(), Some(ShutdownReason::Requested));
        })
        .await;

        assert!(test_result.is_ok(), "Test timed out after 5 seconds");
    }
}
