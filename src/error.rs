//! Error types and retry classification.
//!
//! Bring-up failures (`Configuration`, `Permission`, `UnsupportedPlatform`,
//! `SshDaemon`, `SshdNotReady`) are fatal to the whole run. `Tunnel` errors are
//! caught at the orchestrator boundary and only fail their own backend.
//! `Network` and `Timeout` errors are candidates for retry; whether a given
//! failure is worth retrying is decided by [`is_retryable_error`].
//!
//! # Classification Strategy
//!
//! 1. **Permanent failures (NOT retryable)**: missing release assets, denied
//!    access, unsupported architectures. Retrying only burns the job's time.
//!
//! 2. **Transient failures (retryable)**: refused or reset connections,
//!    timeouts, DNS hiccups, upstream 5xx responses.
//!
//! 3. **Unknown errors**: retried. Downloads in CI fail transiently far more
//!    often than they fail permanently.
//!
//! Permanent patterns take precedence over transient ones.

use std::time::Duration;

use thiserror::Error;

use crate::types::{SshMode, TunnelKind};

/// Top-level error type for daemon bring-up and tunnel backends.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid or missing required settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Insufficient privilege for the requested mode
    #[error("Permission error ({mode} mode): {message}")]
    Permission { mode: SshMode, message: String },

    /// The host OS has no bring-up strategy
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// The daemon could not be configured or started
    #[error("SSH daemon error ({mode} mode): {message}")]
    SshDaemon { mode: SshMode, message: String },

    /// The daemon was started but never listened on its port
    #[error("sshd not ready: port {port} not listening after {timeout:?}")]
    SshdNotReady { port: u16, timeout: Duration },

    /// A tunnel backend failed to install or start
    #[error("{kind} tunnel error: {message}")]
    Tunnel { kind: TunnelKind, message: String },

    /// A download or remote call failed
    #[error("Network error: {0}")]
    Network(String),

    /// An operation exceeded its bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Shorthand for a [`RelayError::Tunnel`] error.
    pub fn tunnel(kind: TunnelKind, message: impl Into<String>) -> Self {
        RelayError::Tunnel {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a [`RelayError::SshDaemon`] error.
    pub fn daemon(mode: SshMode, message: impl Into<String>) -> Self {
        RelayError::SshDaemon {
            mode,
            message: message.into(),
        }
    }

    /// Short machine-readable category, used in reports.
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Configuration(_) => "configuration",
            RelayError::Permission { .. } => "permission",
            RelayError::UnsupportedPlatform(_) => "unsupported_platform",
            RelayError::SshDaemon { .. } => "ssh_daemon",
            RelayError::SshdNotReady { .. } => "sshd_not_ready",
            RelayError::Tunnel { .. } => "tunnel",
            RelayError::Network(_) => "network",
            RelayError::Timeout(_) => "timeout",
            RelayError::Io(_) => "io",
        }
    }

    /// Whether another attempt might succeed.
    ///
    /// Only `Network` and `Timeout` errors are ever retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Network(message) => is_retryable_error(message),
            RelayError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error patterns that will not resolve by retrying.
const PERMANENT_ERRORS: &[&str] = &[
    "404",
    "403",
    "401",
    "not found",
    "permission denied",
    "forbidden",
    "unauthorized",
    "unsupported",
    "no such file",
    "could not resolve proxy",
    "neither curl nor wget",
];

/// Error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "could not resolve host",
    "temporary failure",
    "network is unreachable",
    "no route to host",
    "500",
    "502",
    "503",
    "504",
    "ssl",
    "broken pipe",
];

/// Determines if an error message describes a transient failure.
///
/// # Rules
///
/// 1. Permanent patterns (`404`, `permission denied`, ...) are checked first
///    and are never retried.
/// 2. Transient patterns (`connection refused`, `timeout`, HTTP 5xx, ...)
///    are retried.
/// 3. Anything else is retried.
///
/// # Examples
///
/// ```rust
/// use ci_sshd_relay::error::is_retryable_error;
///
/// assert!(!is_retryable_error("curl: (22) The requested URL returned error: 404"));
/// assert!(is_retryable_error("curl: (7) Failed to connect: Connection refused"));
/// assert!(is_retryable_error("something odd happened"));
/// ```
pub fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    // Permanent failures are checked first for priority
    for permanent in PERMANENT_ERRORS {
        if error_lower.contains(permanent) {
            return false;
        }
    }

    for retryable in RETRYABLE_ERRORS {
        if error_lower.contains(retryable) {
            return true;
        }
    }

    true
}
