//! Final run report and pipeline variable export.
//!
//! The report is a plain serializable value. Exports are a flat string map
//! handed to the CI platform by appending to its environment file
//! (`$GITHUB_ENV` style). Writing that file is best-effort from the caller's
//! point of view: failures are logged, never fatal.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Settlement, SshBringupResult, TunnelOutcome};

/// Everything one invocation produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ssh: SshBringupResult,
    pub tunnels: Vec<Settlement>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(ssh: SshBringupResult, tunnels: Vec<Settlement>) -> Self {
        Self {
            ssh,
            tunnels,
            finished_at: Utc::now(),
        }
    }

    /// Every settlement viewed as an outcome, in order.
    pub fn outcomes(&self) -> Vec<TunnelOutcome> {
        self.tunnels.iter().map(Settlement::outcome).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes().iter().filter(|o| o.succeeded).count()
    }

    /// Flat variables for the pipeline: the daemon's port and mode plus every
    /// successful backend's own values.
    pub fn exports(&self) -> BTreeMap<String, String> {
        let mut exports = BTreeMap::from([
            ("SSH_PORT".to_string(), self.ssh.port.to_string()),
            ("SSH_MODE".to_string(), self.ssh.mode.to_string()),
        ]);
        for outcome in self.outcomes().into_iter().filter(|o| o.succeeded) {
            exports.extend(outcome.variables);
        }
        exports
    }

    /// One human-readable line per attempted backend.
    pub fn summary_lines(&self) -> Vec<String> {
        self.outcomes()
            .iter()
            .map(|o| {
                if o.succeeded {
                    format!(
                        "{}: ok, endpoint {}, connect with: {}",
                        o.kind,
                        o.endpoint.as_deref().unwrap_or("pending"),
                        o.connect_command.as_deref().unwrap_or("n/a")
                    )
                } else {
                    let message = o.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error");
                    format!("{}: failed, {}", o.kind, message)
                }
            })
            .collect()
    }

    /// Log the per-backend summary and the full report as JSON.
    pub fn log_summary(&self) {
        info!(
            "SSH daemon listening on port {} ({} mode)",
            self.ssh.port, self.ssh.mode
        );
        if self.tunnels.is_empty() {
            info!("No tunnels were requested");
        }
        for line in self.summary_lines() {
            if line.contains(": failed,") {
                warn!("{}", line);
            } else {
                info!("{}", line);
            }
        }
        match serde_json::to_string(self) {
            Ok(json) => info!("Run report: {}", json),
            Err(e) => warn!("Could not serialize run report: {}", e),
        }
    }
}

/// Render exports in environment-file syntax.
///
/// Single-line values become `KEY=VALUE`; values containing a newline use the
/// `KEY<<DELIMITER` heredoc form with a random delimiter.
pub fn format_env_file(exports: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in exports {
        if value.contains('\n') {
            let delimiter = format!("ghadelimiter_{}", Uuid::new_v4());
            out.push_str(&format!("{}<<{}\n{}\n{}\n", key, delimiter, value, delimiter));
        } else {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

/// Append exports to the CI environment file at `path`.
pub fn write_env_file(path: &Path, exports: &BTreeMap<String, String>) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(format_env_file(exports).as_bytes())?;
    info!("Exported {} variable(s) to {}", exports.len(), path.display());
    Ok(())
}
