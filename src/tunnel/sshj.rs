//! SSH-J backend: registers the local daemon as a device on the ssh-j.com
//! jump host.
//!
//! Nothing is discovered from the log. Clients reach the runner with
//! `ssh -J <namespace>@<host> <user>@<device>`, which is known as soon as the
//! forward is launched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::SshJSettings;
use crate::error::{RelayError, Result};
use crate::process::{self, CommandSpec, ProcessRegistry};
use crate::types::{HealthStatus, SshBringupResult, TunnelDescriptor, TunnelKind, TunnelOutcome};

use super::{BackendProcess, TunnelPlugin, ssh_client_options};

pub struct SshJTunnel {
    settings: SshJSettings,
    login_user: String,
    /// Client key generated on install, if that succeeded
    identity: Option<PathBuf>,
    key_dir: PathBuf,
    process: BackendProcess,
    launched: bool,
}

impl SshJTunnel {
    pub fn new(
        settings: SshJSettings,
        login_user: String,
        state_dir: PathBuf,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            settings,
            login_user,
            identity: None,
            key_dir: state_dir.join("sshj"),
            process: BackendProcess::new(TunnelKind::SshJ, registry),
            launched: false,
        }
    }

    /// `ssh` invocation publishing `local_port` as port 22 of the device.
    pub fn command(&self, local_port: u16) -> CommandSpec {
        let descriptor = &self.settings.descriptor;
        let mut spec = CommandSpec::new(self.settings.ssh_binary.as_str())
            .args(["-N", "-T", "-p"])
            .arg(descriptor.target_port.to_string())
            .args(ssh_client_options());
        if let Some(identity) = &self.identity {
            spec = spec
                .arg("-i")
                .arg(identity.to_string_lossy())
                .args(["-o", "IdentitiesOnly=yes"]);
        }
        spec.arg("-R")
            .arg(format!("{}:22:localhost:{}", self.settings.device, local_port))
            .arg(format!("{}@{}", self.settings.namespace, descriptor.target_host))
    }

    fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([
            ("SSHJ_NAMESPACE".to_string(), self.settings.namespace.clone()),
            ("SSHJ_DEVICE".to_string(), self.settings.device.clone()),
            (
                "SSHJ_HOST".to_string(),
                self.settings.descriptor.target_host.clone(),
            ),
        ]);
        if let Some(connect) = self.connect_command() {
            vars.insert("SSHJ_CONNECT".to_string(), connect);
        }
        vars
    }

    /// Generate the per-invocation client key. Failure is tolerated: ssh
    /// falls back to whatever identities the user already has.
    async fn ensure_identity(&mut self) {
        let key = self.key_dir.join("id_ed25519");
        if key.exists() {
            self.identity = Some(key);
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.key_dir).await {
            warn!("Could not create {}: {}", self.key_dir.display(), e);
            return;
        }

        let spec = CommandSpec::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "ci-sshd-relay-sshj", "-f"])
            .arg(key.to_string_lossy());
        match process::run(&spec, Duration::from_secs(30)).await {
            Ok(output) if output.success() => {
                debug!("Generated SSH-J client key {}", key.display());
                self.identity = Some(key);
            }
            Ok(output) => warn!("SSH-J client key generation failed: {}", output.failure_message()),
            Err(e) => warn!("SSH-J client key generation failed: {}", e),
        }
    }
}

#[async_trait]
impl TunnelPlugin for SshJTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::SshJ
    }

    fn descriptor(&self) -> &TunnelDescriptor {
        &self.settings.descriptor
    }

    fn is_available(&self) -> bool {
        self.settings.descriptor.enabled
    }

    async fn install(&mut self) -> Result<()> {
        if process::find_binary(&self.settings.ssh_binary).is_none() {
            return Err(RelayError::tunnel(
                TunnelKind::SshJ,
                format!("ssh client '{}' not found", self.settings.ssh_binary),
            ));
        }
        self.ensure_identity().await;
        Ok(())
    }

    async fn start(&mut self, ssh: &SshBringupResult, log_dir: &Path) -> Result<TunnelOutcome> {
        let spec = self.command(ssh.port);
        if self.settings.descriptor.foreground {
            return Err(self.process.exec(&spec));
        }

        let handle = self.process.launch(&spec, log_dir)?;
        self.launched = true;

        let connect = self.connect_command();
        if let Some(connect) = &connect {
            info!("SSH-J connect command: {}", connect);
        }

        Ok(TunnelOutcome {
            kind: TunnelKind::SshJ,
            succeeded: true,
            endpoint: None,
            connect_command: connect,
            process: Some(handle),
            error: None,
            variables: self.variables(),
        })
    }

    fn connect_command(&self) -> Option<String> {
        if !self.launched {
            return None;
        }
        Some(format!(
            "ssh -J {}@{} {}@{}",
            self.settings.namespace,
            self.settings.descriptor.target_host,
            self.login_user,
            self.settings.device
        ))
    }

    fn health_check(&self) -> HealthStatus {
        self.process.health()
    }

    fn stop(&mut self) -> bool {
        self.launched = false;
        self.process.stop()
    }
}
