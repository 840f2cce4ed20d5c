//! Bridge error types with rich context

use std::time::Duration;
use thiserror::Error;

use crate::types::SyncResultCode;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types organized by layer
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Could not connect to adb daemon at {addr}")]
    ConnectionRefused { addr: String },

    #[error("Timed out while {operation}")]
    Timeout { operation: String },

    #[error("adb protocol error: {message}")]
    Protocol { message: String },

    /// The daemon answered `FAIL`.
    #[error("adb daemon rejected the request: {message}")]
    AdbRejected { message: String },

    // ─────────────────────────────────────────────────────────────
    // Device Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device not found: {serial}")]
    DeviceNotFound { serial: String },

    #[error("Device is offline: {serial}")]
    DeviceOffline { serial: String },

    #[error("Shell command '{command}' produced no output for {timeout:?}")]
    ShellUnresponsive { command: String, timeout: Duration },

    // ─────────────────────────────────────────────────────────────
    // Sync/Install Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Sync service unavailable on {serial}: {message}")]
    SyncUnavailable { serial: String, message: String },

    #[error("Sync failed ({code}): {message}")]
    SyncFailed {
        code: SyncResultCode,
        message: String,
    },

    #[error("Installation failed: {reason}")]
    InstallFailed { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn connection_refused(addr: impl Into<String>) -> Self {
        Self::ConnectionRefused { addr: addr.into() }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::AdbRejected {
            message: message.into(),
        }
    }

    pub fn device_not_found(serial: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            serial: serial.into(),
        }
    }

    pub fn device_offline(serial: impl Into<String>) -> Self {
        Self::DeviceOffline {
            serial: serial.into(),
        }
    }

    pub fn shell_unresponsive(command: impl Into<String>, timeout: Duration) -> Self {
        Self::ShellUnresponsive {
            command: command.into(),
            timeout,
        }
    }

    pub fn sync_unavailable(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SyncUnavailable {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn sync_failed(code: SyncResultCode, message: impl Into<String>) -> Self {
        Self::SyncFailed {
            code,
            message: message.into(),
        }
    }

    pub fn install_failed(reason: impl Into<String>) -> Self {
        Self::InstallFailed {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionRefused { .. }
                | Error::Timeout { .. }
                | Error::DeviceOffline { .. }
                | Error::ShellUnresponsive { .. }
        )
    }

    /// Check if the daemon itself refused the request
    pub fn is_daemon_rejection(&self) -> bool {
        matches!(
            self,
            Error::AdbRejected { .. }
                | Error::DeviceNotFound { .. }
                | Error::DeviceOffline { .. }
                | Error::SyncUnavailable { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::rejected("device unauthorized");
        assert_eq!(
            err.to_string(),
            "adb daemon rejected the request: device unauthorized"
        );

        let err = Error::connection_refused("127.0.0.1:5037");
        assert!(err.to_string().contains("127.0.0.1:5037"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::timeout("reading status").is_retryable());
        assert!(Error::connection_refused("127.0.0.1:5037").is_retryable());
        assert!(Error::device_offline("emulator-5554").is_retryable());
        assert!(!Error::protocol("bad token").is_retryable());
        assert!(!Error::install_failed("INSTALL_FAILED_OLDER_SDK").is_retryable());
    }

    #[test]
    fn test_error_is_daemon_rejection() {
        assert!(Error::rejected("closed").is_daemon_rejection());
        assert!(Error::device_not_found("abc").is_daemon_rejection());
        assert!(Error::sync_unavailable("abc", "closed").is_daemon_rejection());
        assert!(!Error::timeout("x").is_daemon_rejection());
    }

    #[test]
    fn test_shell_unresponsive_mentions_command() {
        let err = Error::shell_unresponsive("getprop", Duration::from_secs(5));
        let text = err.to_string();
        assert!(text.contains("getprop"));
        assert!(text.contains("5s"));
    }

    #[test]
    fn test_sync_failed_includes_code_and_message() {
        let err = Error::sync_failed(SyncResultCode::RemoteError, "Read-only file system");
        let text = err.to_string();
        assert!(text.contains("remote error"));
        assert!(text.contains("Read-only file system"));
    }

    #[test]
    fn test_result_ext_preserves_error() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let err = res.context("opening apk").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
