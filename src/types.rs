//! Serializable data model shared by the bring-up and tunnel phases.
//!
//! All values here are created once per invocation and never mutated after
//! construction. They implement `Serialize` so the final report can be
//! logged as JSON and handed to external reporters.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tunnel backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Pinggy,
    #[serde(rename = "sshj")]
    SshJ,
    Cloudflare,
}

impl TunnelKind {
    /// Stable lowercase identifier, used for log, PID and variable names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Pinggy => "pinggy",
            TunnelKind::SshJ => "sshj",
            TunnelKind::Cloudflare => "cloudflare",
        }
    }

    /// Prefix for exported pipeline variables (e.g. `SSHJ_CONNECT`).
    pub fn variable_prefix(&self) -> &'static str {
        match self {
            TunnelKind::Pinggy => "PINGGY",
            TunnelKind::SshJ => "SSHJ",
            TunnelKind::Cloudflare => "CLOUDFLARE",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the SSH daemon was brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshMode {
    /// Private daemon instance owned by this invocation, no privilege needed
    User,
    /// The system daemon, reconfigured in place
    Root,
    /// The Windows OpenSSH service
    Windows,
}

impl fmt::Display for SshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshMode::User => write!(f, "user"),
            SshMode::Root => write!(f, "root"),
            SshMode::Windows => write!(f, "windows"),
        }
    }
}

/// Per-backend bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TunnelTimeouts {
    /// Bound on a single dependency download or remote reconciliation call
    pub install: Duration,
    /// Bound on endpoint discovery from the backend's log
    pub discovery: Duration,
}

/// Validated, read-only description of one tunnel backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelDescriptor {
    pub kind: TunnelKind,
    pub enabled: bool,
    /// Relay host the backend connects to
    pub target_host: String,
    /// Relay port the backend connects to
    pub target_port: u16,
    /// Replace the current process with the backend instead of detaching
    pub foreground: bool,
    pub timeouts: TunnelTimeouts,
}

/// Non-owning handle to a detached child process.
///
/// The invocation does not own the child's lifetime once it is backgrounded;
/// the pid is only retained to signal it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

/// Failure details recorded on a failed outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    /// Error category (see `RelayError::category`)
    pub kind: String,
    pub message: String,
}

/// Result of one backend run
#[derive(Debug, Clone, Serialize)]
pub struct TunnelOutcome {
    pub kind: TunnelKind,
    pub succeeded: bool,
    /// Discovered public endpoint, if any yet
    pub endpoint: Option<String>,
    pub connect_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Flat values to export to the pipeline (host, namespace, device, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

impl TunnelOutcome {
    /// A failed outcome carrying only the error.
    pub fn failed(kind: TunnelKind, error: ErrorInfo) -> Self {
        Self {
            kind,
            succeeded: false,
            endpoint: None,
            connect_command: None,
            process: None,
            error: Some(error),
            variables: BTreeMap::new(),
        }
    }
}

/// Proof that a daemon is listening; required input of every tunnel start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshBringupResult {
    pub mode: SshMode,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Liveness probe result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
}

/// Settled result of one concurrently launched backend.
///
/// Order in the orchestrator's output always matches plugin input order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Settlement {
    /// `start` returned an outcome
    Fulfilled { value: TunnelOutcome },
    /// `install`/`start` returned an error or panicked
    Rejected {
        kind: TunnelKind,
        reason: ErrorInfo,
    },
}

impl Settlement {
    pub fn kind(&self) -> TunnelKind {
        match self {
            Settlement::Fulfilled { value } => value.kind,
            Settlement::Rejected { kind, .. } => *kind,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled { .. })
    }

    /// View as an outcome; rejections become failed outcomes.
    pub fn outcome(&self) -> TunnelOutcome {
        match self {
            Settlement::Fulfilled { value } => value.clone(),
            Settlement::Rejected { kind, reason } => TunnelOutcome::failed(*kind, reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod tunnel_kind {
        use super::*;

        #[test]
        fn test_display_and_prefix() {
            assert_eq!(TunnelKind::Pinggy.to_string(), "pinggy");
            assert_eq!(TunnelKind::SshJ.to_string(), "sshj");
            assert_eq!(TunnelKind::Cloudflare.variable_prefix(), "CLOUDFLARE");
        }

        #[test]
        fn test_serialized_form() {
            let json = serde_json::to_string(&TunnelKind::SshJ).unwrap();
            assert_eq!(json, "\"sshj\"");
        }
    }

    mod settlement {
        use super::*;

        fn outcome(kind: TunnelKind) -> TunnelOutcome {
            TunnelOutcome {
                kind,
                succeeded: true,
                endpoint: Some("tcp://a.example:1234".to_string()),
                connect_command: None,
                process: None,
                error: None,
                variables: BTreeMap::new(),
            }
        }

        #[test]
        fn test_fulfilled_json_structure() {
            let settlement = Settlement::Fulfilled {
                value: outcome(TunnelKind::Pinggy),
            };
            let json = serde_json::to_value(&settlement).unwrap();

            assert_eq!(json["status"], "fulfilled");
            assert_eq!(json["value"]["kind"], "pinggy");
            assert_eq!(json["value"]["endpoint"], "tcp://a.example:1234");
            // Optional fields are omitted
            assert!(json["value"].get("error").is_none());
            assert!(json["value"].get("process").is_none());
        }

        #[test]
        fn test_rejected_becomes_failed_outcome() {
            let settlement = Settlement::Rejected {
                kind: TunnelKind::Cloudflare,
                reason: ErrorInfo {
                    kind: "tunnel".to_string(),
                    message: "cloudflared missing".to_string(),
                },
            };
            assert!(!settlement.is_fulfilled());
            assert_eq!(settlement.kind(), TunnelKind::Cloudflare);

            let failed = settlement.outcome();
            assert!(!failed.succeeded);
            assert!(failed.endpoint.is_none());
            assert_eq!(failed.error.unwrap().message, "cloudflared missing");

            let json = serde_json::to_value(&settlement).unwrap();
            assert_eq!(json["status"], "rejected");
            assert_eq!(json["reason"]["kind"], "tunnel");
        }
    }

    #[test]
    fn test_bringup_result_serialization() {
        let result = SshBringupResult {
            mode: SshMode::User,
            port: 2222,
            log_path: None,
            pid: Some(42),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["mode"], "user");
        assert_eq!(json["port"], 2222);
        assert_eq!(json["pid"], 42);
        assert!(json.get("log_path").is_none());
    }
}
