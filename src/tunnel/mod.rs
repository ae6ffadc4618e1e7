//! Tunnel backends exposing the local SSH port publicly.
//!
//! Supports three backends:
//! - **Pinggy** - reverse TCP forward over plain `ssh`, endpoint read from its log
//! - **SSH-J** - jump-host relay over plain `ssh`, endpoint fully determined by
//!   namespace, device and host
//! - **Cloudflare** (`cloudflared`, feature `cloudflare`) - named tunnel,
//!   reconciled get-or-create before start
//!
//! Every backend implements [`TunnelPlugin`] and is driven by the
//! [`TunnelOrchestrator`](orchestrator::TunnelOrchestrator). Each owns exactly
//! one log file and one PID file, both named after its kind.

#[cfg(feature = "cloudflare")]
pub mod cloudflare;
pub mod orchestrator;
pub mod pinggy;
pub mod sshj;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::process::{self, CommandSpec, ProcessRegistry};
use crate::types::{
    HealthStatus, ProcessHandle, SshBringupResult, TunnelDescriptor, TunnelKind, TunnelOutcome,
};

pub use orchestrator::TunnelOrchestrator;

/// Contract every tunnel backend implements.
///
/// `start` takes the bring-up result, so no backend can be started before a
/// daemon is confirmed listening.
#[async_trait]
pub trait TunnelPlugin: Send + Sync {
    fn kind(&self) -> TunnelKind;

    fn descriptor(&self) -> &TunnelDescriptor;

    /// Whether this backend should run. Pure read of configuration.
    fn is_available(&self) -> bool;

    /// Make sure the backend's client is present, installing it if needed.
    ///
    /// Idempotent. Errors name the missing dependency.
    async fn install(&mut self) -> Result<()>;

    /// Launch the backend and try to discover its public endpoint.
    ///
    /// A foreground backend replaces the current process instead and only
    /// returns if that fails. Not finding an endpoint in time is not an
    /// error: the outcome succeeds with no endpoint.
    async fn start(&mut self, ssh: &SshBringupResult, log_dir: &Path) -> Result<TunnelOutcome>;

    /// Client command for the known endpoint, if any yet.
    fn connect_command(&self) -> Option<String>;

    /// Liveness of the launched process. Never fails.
    fn health_check(&self) -> HealthStatus;

    /// Signal the launched process and forget it.
    ///
    /// Returns whether a signal was sent. Never fails.
    fn stop(&mut self) -> bool;
}

/// Placeholder `ssh` uses to discard known-hosts entries
#[cfg(unix)]
pub(crate) const NULL_DEVICE: &str = "/dev/null";
#[cfg(not(unix))]
pub(crate) const NULL_DEVICE: &str = "NUL";

/// Options every `ssh`-based backend passes: never prompt, never record the
/// relay's host key, keep the connection alive and fail if the forward cannot
/// be set up.
pub(crate) fn ssh_client_options() -> Vec<String> {
    let known_hosts = format!("UserKnownHostsFile={}", NULL_DEVICE);
    [
        "StrictHostKeyChecking=no",
        known_hosts.as_str(),
        "BatchMode=yes",
        "ServerAliveInterval=30",
        "ServerAliveCountMax=3",
        "ExitOnForwardFailure=yes",
    ]
    .iter()
    .flat_map(|opt| ["-o".to_string(), opt.to_string()])
    .collect()
}

/// The single detached process a backend owns, with its log and PID file.
pub struct BackendProcess {
    kind: TunnelKind,
    registry: ProcessRegistry,
    handle: Option<ProcessHandle>,
    pid_file: Option<PathBuf>,
}

impl BackendProcess {
    pub fn new(kind: TunnelKind, registry: ProcessRegistry) -> Self {
        Self {
            kind,
            registry,
            handle: None,
            pid_file: None,
        }
    }

    pub fn log_path(kind: TunnelKind, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}.log", kind))
    }

    pub fn pid_path(kind: TunnelKind, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}.pid", kind))
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Start `spec` detached with a fresh log, record its PID file and
    /// register it for interrupt cleanup.
    pub fn launch(&mut self, spec: &CommandSpec, log_dir: &Path) -> Result<ProcessHandle> {
        if self.handle.is_some() {
            return Err(RelayError::tunnel(self.kind, "backend already running"));
        }

        let log_path = Self::log_path(self.kind, log_dir);
        // Output of an earlier run must not be mistaken for this one's
        if let Err(e) = std::fs::remove_file(&log_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Could not clear old {} log: {}", self.kind, e);
        }

        let handle = process::spawn_detached(spec, &log_path)
            .map_err(|e| RelayError::tunnel(self.kind, format!("failed to launch: {}", e)))?;

        let pid_path = Self::pid_path(self.kind, log_dir);
        match process::write_pid_file(&pid_path, handle.pid) {
            Ok(()) => self.pid_file = Some(pid_path),
            Err(e) => warn!("Could not write {}: {}", pid_path.display(), e),
        }

        self.registry.register(handle.clone());
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Replace the current process with `spec`. Only returns on failure.
    pub fn exec(&self, spec: &CommandSpec) -> RelayError {
        let error = process::exec_foreground(spec);
        RelayError::tunnel(
            self.kind,
            format!("failed to hand over to {}: {}", spec.program, error),
        )
    }

    pub fn health(&self) -> HealthStatus {
        match &self.handle {
            None => HealthStatus {
                healthy: false,
                message: format!("{} is not running", self.kind),
            },
            Some(handle) if process::is_process_alive(handle.pid) => HealthStatus {
                healthy: true,
                message: format!("{} running (pid {})", self.kind, handle.pid),
            },
            Some(handle) => HealthStatus {
                healthy: false,
                message: format!("{} process {} has exited", self.kind, handle.pid),
            },
        }
    }

    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        self.registry.release(handle.pid);
        let signalled = process::terminate(handle.pid);
        debug!("Stopped {} (pid {}): signalled={}", self.kind, handle.pid, signalled);

        if let Some(pid_file) = self.pid_file.take()
            && let Err(e) = process::remove_pid_file(&pid_file)
        {
            warn!("Could not remove {}: {}", pid_file.display(), e);
        }
        signalled
    }
}

/// Build every compiled-in backend in reporting order.
pub fn build_plugins(settings: &Settings, registry: &ProcessRegistry) -> Vec<Box<dyn TunnelPlugin>> {
    #[allow(unused_mut)]
    let mut plugins: Vec<Box<dyn TunnelPlugin>> = vec![
        Box::new(pinggy::PinggyTunnel::new(
            settings.pinggy.clone(),
            settings.login_user.clone(),
            registry.clone(),
        )),
        Box::new(sshj::SshJTunnel::new(
            settings.sshj.clone(),
            settings.login_user.clone(),
            settings.state_dir.clone(),
            registry.clone(),
        )),
    ];

    #[cfg(feature = "cloudflare")]
    plugins.push(Box::new(cloudflare::CloudflareTunnel::new(
        settings.cloudflare.clone(),
        settings.login_user.clone(),
        settings.state_dir.clone(),
        settings.backoff,
        registry.clone(),
    )));

    #[cfg(not(feature = "cloudflare"))]
    if settings.cloudflare.descriptor.enabled {
        warn!("Cloudflare tunnel requested but this build lacks the `cloudflare` feature");
    }

    plugins
}
