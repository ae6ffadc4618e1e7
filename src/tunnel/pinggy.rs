//! Pinggy backend: a reverse TCP forward over the system `ssh` client.
//!
//! Pinggy allocates a public `tcp://host:port` address and prints it in the
//! session output, which lands in the backend's log.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::config::PinggySettings;
use crate::error::{RelayError, Result};
use crate::probe;
use crate::process::{self, CommandSpec, ProcessRegistry};
use crate::types::{HealthStatus, SshBringupResult, TunnelDescriptor, TunnelKind, TunnelOutcome};

use super::{BackendProcess, TunnelPlugin, ssh_client_options};

/// Public TCP address printed by Pinggy
static ENDPOINT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"tcp://[A-Za-z0-9.-]+(?::\d+)?").expect("valid endpoint pattern"));

pub struct PinggyTunnel {
    settings: PinggySettings,
    login_user: String,
    process: BackendProcess,
    endpoint: Option<String>,
}

impl PinggyTunnel {
    pub fn new(settings: PinggySettings, login_user: String, registry: ProcessRegistry) -> Self {
        Self {
            settings,
            login_user,
            process: BackendProcess::new(TunnelKind::Pinggy, registry),
            endpoint: None,
        }
    }

    /// `ssh` invocation forwarding a Pinggy-allocated port to `local_port`.
    pub fn command(&self, local_port: u16) -> CommandSpec {
        let descriptor = &self.settings.descriptor;
        let spec = CommandSpec::new(self.settings.ssh_binary.as_str())
            .arg("-T")
            .arg("-p")
            .arg(descriptor.target_port.to_string())
            .args(ssh_client_options())
            .arg(format!("-R0:localhost:{}", local_port));

        match &self.settings.token {
            Some(token) => spec.secret_arg(format!("{}+tcp@{}", token, descriptor.target_host)),
            None => spec.arg(format!("tcp@{}", descriptor.target_host)),
        }
    }

    fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if let Some(endpoint) = &self.endpoint {
            vars.insert("PINGGY_ENDPOINT".to_string(), endpoint.clone());
            if let Some((host, port)) = split_endpoint(endpoint) {
                vars.insert("PINGGY_HOST".to_string(), host.to_string());
                if let Some(port) = port {
                    vars.insert("PINGGY_PORT".to_string(), port.to_string());
                }
            }
        }
        if let Some(connect) = self.connect_command() {
            vars.insert("PINGGY_CONNECT".to_string(), connect);
        }
        vars
    }
}

/// Split `tcp://host[:port]` into host and optional port.
pub fn split_endpoint(endpoint: &str) -> Option<(&str, Option<u16>)> {
    let address = endpoint.strip_prefix("tcp://")?;
    match address.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok())),
        None => Some((address, None)),
    }
}

/// First Pinggy endpoint in a chunk of log output.
pub fn extract_endpoint(log: &str) -> Option<String> {
    ENDPOINT_PATTERN.find(log).map(|m| m.as_str().to_string())
}

#[async_trait]
impl TunnelPlugin for PinggyTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Pinggy
    }

    fn descriptor(&self) -> &TunnelDescriptor {
        &self.settings.descriptor
    }

    fn is_available(&self) -> bool {
        self.settings.descriptor.enabled
    }

    async fn install(&mut self) -> Result<()> {
        // Plain ssh; nothing to download
        match process::find_binary(&self.settings.ssh_binary) {
            Some(_) => Ok(()),
            None => Err(RelayError::tunnel(
                TunnelKind::Pinggy,
                format!("ssh client '{}' not found", self.settings.ssh_binary),
            )),
        }
    }

    async fn start(&mut self, ssh: &SshBringupResult, log_dir: &Path) -> Result<TunnelOutcome> {
        let spec = self.command(ssh.port);
        if self.settings.descriptor.foreground {
            return Err(self.process.exec(&spec));
        }

        let handle = self.process.launch(&spec, log_dir)?;
        let log_path = BackendProcess::log_path(TunnelKind::Pinggy, log_dir);
        let timeout = self.settings.descriptor.timeouts.discovery;

        self.endpoint = probe::wait_for_log_match(&log_path, &ENDPOINT_PATTERN, timeout).await;
        match &self.endpoint {
            Some(endpoint) => info!("Pinggy endpoint: {}", endpoint),
            None => warn!(
                "No Pinggy endpoint in {} after {:?}; the tunnel may still report it later",
                log_path.display(),
                timeout
            ),
        }

        Ok(TunnelOutcome {
            kind: TunnelKind::Pinggy,
            succeeded: true,
            endpoint: self.endpoint.clone(),
            connect_command: self.connect_command(),
            process: Some(handle),
            error: None,
            variables: self.variables(),
        })
    }

    fn connect_command(&self) -> Option<String> {
        let (host, port) = split_endpoint(self.endpoint.as_deref()?)?;
        Some(match port {
            Some(port) => format!("ssh -p {} {}@{}", port, self.login_user, host),
            None => format!("ssh {}@{}", self.login_user, host),
        })
    }

    fn health_check(&self) -> HealthStatus {
        self.process.health()
    }

    fn stop(&mut self) -> bool {
        self.endpoint = None;
        self.process.stop()
    }
}
