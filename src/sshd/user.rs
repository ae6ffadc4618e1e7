//! User mode: a private daemon instance owned by this invocation.
//!
//! Nothing system-wide is touched. The instance has its own config, host
//! keys, PID file and log under `<state_dir>/sshd`, and only runs as the
//! invoking user.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{SSHD_BINARY_ENV_VAR, Settings};
use crate::error::{RelayError, Result};
use crate::install;
use crate::probe;
use crate::process::{self, CommandSpec};
use crate::types::{SshBringupResult, SshMode};

use super::sshd_config::{UserConfig, render_user_config};

/// Places the daemon binary is commonly installed outside `PATH`
const SSHD_FALLBACK_PATHS: &[&str] = &["/usr/sbin/sshd", "/usr/local/sbin/sshd", "/sbin/sshd"];

/// Bound on short helper commands (key generation, config test, daemon fork)
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on waiting for a previous instance to release the port
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Files owned by the private daemon instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserModePaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub host_ed25519: PathBuf,
    pub host_rsa: PathBuf,
    pub authorized_keys: PathBuf,
}

impl UserModePaths {
    pub fn new(state_dir: &Path) -> Self {
        let dir = state_dir.join("sshd");
        Self {
            config: dir.join("sshd_config"),
            pid_file: dir.join("sshd.pid"),
            log_file: dir.join("sshd.log"),
            host_ed25519: dir.join("ssh_host_ed25519_key"),
            host_rsa: dir.join("ssh_host_rsa_key"),
            authorized_keys: dir.join("authorized_keys"),
            dir,
        }
    }
}

/// Locate the daemon binary, installing it when missing and privilege allows.
///
/// An explicitly configured binary is used as is and never installed.
pub async fn find_or_install_sshd(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(explicit) = explicit {
        return process::find_binary(explicit).ok_or_else(|| {
            RelayError::daemon(
                SshMode::User,
                format!("{} '{}' is not an executable", SSHD_BINARY_ENV_VAR, explicit),
            )
        });
    }
    if let Some(found) = locate_sshd() {
        return Ok(found);
    }

    let superuser = process::is_superuser();
    let sudo = !superuser && process::has_passwordless_sudo().await;
    if superuser || sudo {
        warn!("sshd not found, attempting to install openssh-server");
        install::install_system_package("openssh-server", sudo).await;
        if let Some(found) = locate_sshd() {
            return Ok(found);
        }
    }

    Err(RelayError::daemon(
        SshMode::User,
        "sshd binary not found and could not be installed",
    ))
}

fn locate_sshd() -> Option<PathBuf> {
    process::find_binary("sshd").or_else(|| {
        SSHD_FALLBACK_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    })
}

/// Generate a host key unless one already exists at `path`.
///
/// Returns whether a key was generated.
pub async fn ensure_host_key(path: &Path, key_type: &str) -> Result<bool> {
    if path.exists() {
        debug!("Host key {} already present", path.display());
        return Ok(false);
    }

    let mut spec = CommandSpec::new("ssh-keygen")
        .args(["-q", "-t", key_type, "-N", "", "-C", "ci-sshd-relay", "-f"])
        .arg(path.to_string_lossy());
    if key_type == "rsa" {
        spec = spec.args(["-b", "3072"]);
    }

    let output = process::run(&spec, COMMAND_TIMEOUT).await?;
    if !output.success() {
        return Err(RelayError::daemon(
            SshMode::User,
            format!(
                "ssh-keygen failed for {}: {}",
                path.display(),
                output.failure_message()
            ),
        ));
    }
    info!("Generated {} host key {}", key_type, path.display());
    Ok(true)
}

/// Stop an instance left behind by an earlier run with the same state dir
/// and wait for it to exit.
async fn stop_previous_instance(pid_file: &Path) {
    match process::read_pid_file(pid_file) {
        Ok(Some(pid)) if process::is_process_alive(pid) => {
            info!("Stopping previous sshd instance (pid {})", pid);
            process::terminate(pid);
            if !process::wait_for_exit(pid, STOP_TIMEOUT).await {
                warn!(
                    "Previous sshd instance (pid {}) still running after {:?}",
                    pid, STOP_TIMEOUT
                );
            }
        }
        Ok(_) => {}
        Err(e) => debug!("Ignoring unreadable pid file {}: {}", pid_file.display(), e),
    }
    if let Err(e) = process::remove_pid_file(pid_file) {
        debug!("Could not remove {}: {}", pid_file.display(), e);
    }
}

/// Bring up the private daemon. Authorized keys must already be written to
/// `paths.authorized_keys`.
pub async fn bring_up(settings: &Settings, paths: &UserModePaths) -> Result<SshBringupResult> {
    let sshd = find_or_install_sshd(settings.ssh.sshd_binary.as_deref()).await?;
    tokio::fs::create_dir_all(&paths.dir).await?;

    ensure_host_key(&paths.host_ed25519, "ed25519").await?;
    ensure_host_key(&paths.host_rsa, "rsa").await?;

    let rendered = render_user_config(&UserConfig {
        port: settings.ssh.port,
        listen_address: settings.ssh.listen_address.clone(),
        host_keys: vec![paths.host_ed25519.clone(), paths.host_rsa.clone()],
        pid_file: paths.pid_file.clone(),
        authorized_keys: paths.authorized_keys.clone(),
        allowed_users: settings.ssh.allowed_users.clone(),
        default_workdir: settings.ssh.default_workdir.clone(),
    });
    tokio::fs::write(&paths.config, rendered).await?;

    let sshd = sshd.to_string_lossy().into_owned();
    let config = paths.config.to_string_lossy().into_owned();

    let test = process::run(
        &CommandSpec::new(sshd.as_str()).args(["-t", "-f", config.as_str()]),
        COMMAND_TIMEOUT,
    )
    .await?;
    if !test.success() {
        return Err(RelayError::daemon(
            SshMode::User,
            format!("generated config rejected: {}", test.failure_message()),
        ));
    }

    stop_previous_instance(&paths.pid_file).await;

    // sshd daemonizes itself; the foreground command returns once forked
    let start = CommandSpec::new(sshd.as_str())
        .args(["-f", config.as_str(), "-E"])
        .arg(paths.log_file.to_string_lossy());
    let output = process::run(&start, COMMAND_TIMEOUT).await?;
    if !output.success() {
        return Err(RelayError::daemon(
            SshMode::User,
            format!("sshd failed to start: {}", output.failure_message()),
        ));
    }

    let host = probe::probe_host(&settings.ssh.listen_address);
    if !probe::wait_for_port(host, settings.ssh.port, settings.ssh.ready_timeout).await {
        return Err(RelayError::SshdNotReady {
            port: settings.ssh.port,
            timeout: settings.ssh.ready_timeout,
        });
    }

    let pid = match process::read_pid_file(&paths.pid_file) {
        Ok(pid) => pid,
        Err(e) => {
            warn!("Could not read sshd pid file: {}", e);
            None
        }
    };

    Ok(SshBringupResult {
        mode: SshMode::User,
        port: settings.ssh.port,
        log_path: Some(paths.log_file.clone()),
        pid,
    })
}
