//! Root mode: reconfigure and restart the system daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::probe;
use crate::process::{self, CommandSpec};
use crate::types::{SshBringupResult, SshMode};

use super::sshd_config::{managed_directives, rewrite_system_config, unix_force_command};

/// System daemon configuration
pub const SYSTEM_SSHD_CONFIG: &str = "/etc/ssh/sshd_config";

/// Suffix of the one-time backup of the original system config
pub const BACKUP_SUFFIX: &str = ".ci-sshd-relay.bak";

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Service restart commands tried in order until one succeeds
const RESTART_COMMANDS: &[&[&str]] = &[
    &["systemctl", "restart", "ssh"],
    &["systemctl", "restart", "sshd"],
    &["service", "ssh", "restart"],
    &["service", "sshd", "restart"],
];

/// How privileged commands are run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Already running as superuser
    Superuser,
    /// Through `sudo -n`
    Sudo,
}

impl Elevation {
    fn command(&self, program: &str) -> CommandSpec {
        match self {
            Elevation::Superuser => CommandSpec::new(program),
            Elevation::Sudo => CommandSpec::new("sudo").args(["-n", program]),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<process::CommandOutput> {
        process::run(
            &self.command(program).args(args.iter().copied()),
            COMMAND_TIMEOUT,
        )
        .await
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        match self {
            Elevation::Superuser => Ok(tokio::fs::write(path, content).await?),
            Elevation::Sudo => {
                let spec = self
                    .command("tee")
                    .arg(path.to_string_lossy())
                    .stdin(content);
                let output = process::run(&spec, COMMAND_TIMEOUT).await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(RelayError::daemon(
                        SshMode::Root,
                        format!("writing {} failed: {}", path.display(), output.failure_message()),
                    ))
                }
            }
        }
    }
}

/// Fail fast unless the process is superuser or can sudo without a password.
pub async fn ensure_privilege() -> Result<Elevation> {
    if process::is_superuser() {
        return Ok(Elevation::Superuser);
    }
    if process::has_passwordless_sudo().await {
        return Ok(Elevation::Sudo);
    }
    Err(RelayError::Permission {
        mode: SshMode::Root,
        message: "root mode needs superuser or passwordless sudo".to_string(),
    })
}

/// Per-user authorized-keys file used by the system daemon.
pub fn authorized_keys_path(home: &Path) -> PathBuf {
    home.join(".ssh").join("authorized_keys")
}

/// Home directory of the invoking user.
pub fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| RelayError::Configuration("HOME is not set; cannot place authorized keys".to_string()))
}

fn backup_path(config: &Path) -> PathBuf {
    let mut name = config.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// New content of the system config for these settings.
pub fn render(original: &str, settings: &Settings) -> String {
    let directives = managed_directives(settings.ssh.port, &settings.ssh.allowed_users);
    let force = settings.ssh.default_workdir.as_deref().map(unix_force_command);
    rewrite_system_config(original, &directives, force.as_deref())
}

/// Reconfigure and restart the system daemon, then wait for its port.
pub async fn bring_up(settings: &Settings, elevation: Elevation) -> Result<SshBringupResult> {
    let config_path = Path::new(SYSTEM_SSHD_CONFIG);
    let original = tokio::fs::read_to_string(config_path).await.map_err(|e| {
        RelayError::daemon(SshMode::Root, format!("cannot read {}: {}", SYSTEM_SSHD_CONFIG, e))
    })?;

    let backup = backup_path(config_path);
    if !backup.exists() {
        let target = backup.to_string_lossy().into_owned();
        let copy = elevation
            .run("cp", &["-p", SYSTEM_SSHD_CONFIG, target.as_str()])
            .await;
        match copy {
            Ok(output) if output.success() => info!("Backed up {} to {}", SYSTEM_SSHD_CONFIG, backup.display()),
            Ok(output) => warn!("Config backup failed: {}", output.failure_message()),
            Err(e) => warn!("Config backup failed: {}", e),
        }
    }

    let updated = render(&original, settings);
    if updated != original {
        elevation.write_file(config_path, &updated).await?;
        info!("Rewrote {}", SYSTEM_SSHD_CONFIG);
    } else {
        debug!("{} already up to date", SYSTEM_SSHD_CONFIG);
    }

    let sshd = process::find_binary("sshd")
        .unwrap_or_else(|| PathBuf::from("/usr/sbin/sshd"))
        .to_string_lossy()
        .into_owned();
    // Privilege separation directory is missing on some minimal images
    let _ = elevation.run("mkdir", &["-p", "/run/sshd"]).await;

    let test = elevation.run(&sshd, &["-t", "-f", SYSTEM_SSHD_CONFIG]).await?;
    if !test.success() {
        if updated != original {
            warn!("Restoring original {} after failed validation", SYSTEM_SSHD_CONFIG);
            if let Err(e) = elevation.write_file(config_path, &original).await {
                warn!("Restore failed: {}", e);
            }
        }
        return Err(RelayError::daemon(
            SshMode::Root,
            format!("sshd rejected the rewritten config: {}", test.failure_message()),
        ));
    }

    restart_service(elevation).await;

    let host = probe::probe_host(&settings.ssh.listen_address);
    if !probe::wait_for_port(host, settings.ssh.port, settings.ssh.ready_timeout).await {
        return Err(RelayError::SshdNotReady {
            port: settings.ssh.port,
            timeout: settings.ssh.ready_timeout,
        });
    }

    Ok(SshBringupResult {
        mode: SshMode::Root,
        port: settings.ssh.port,
        log_path: None,
        pid: None,
    })
}

/// Restart the service through whichever init system answers first.
///
/// Returns whether any restart command succeeded.
async fn restart_service(elevation: Elevation) -> bool {
    if process::find_binary("systemctl").is_some() {
        let _ = elevation.run("systemctl", &["daemon-reload"]).await;
    }
    for command in RESTART_COMMANDS {
        let (program, args) = (command[0], &command[1..]);
        if process::find_binary(program).is_none() {
            continue;
        }
        match elevation.run(program, args).await {
            Ok(output) if output.success() => {
                info!("Restarted SSH service with `{}`", command.join(" "));
                return true;
            }
            Ok(output) => debug!("`{}` failed: {}", command.join(" "), output.failure_message()),
            Err(e) => debug!("`{}` failed: {}", command.join(" "), e),
        }
    }
    warn!("No service manager restarted sshd; relying on the port probe");
    false
}
