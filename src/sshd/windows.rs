//! Windows mode: the OpenSSH Server service, driven through PowerShell.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::probe;
use crate::process::{self, CommandSpec};
use crate::types::{SshBringupResult, SshMode};

use super::sshd_config::{managed_directives, rewrite_system_config, windows_force_command};

/// Service configuration directory
pub const PROGRAM_DATA_SSH: &str = r"C:\ProgramData\ssh";

/// Bound on each PowerShell step; capability install can be slow
const STEP_TIMEOUT: Duration = Duration::from_secs(600);

pub fn config_path() -> PathBuf {
    Path::new(PROGRAM_DATA_SSH).join("sshd_config")
}

/// Keys file the stock config uses for members of Administrators.
pub fn authorized_keys_path() -> PathBuf {
    Path::new(PROGRAM_DATA_SSH).join("administrators_authorized_keys")
}

fn powershell(script: &str) -> CommandSpec {
    CommandSpec::new("powershell.exe")
        .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
        .arg(script)
}

const ENSURE_CAPABILITY: &str = "if (-not (Get-Service -Name sshd -ErrorAction SilentlyContinue)) { \
     Add-WindowsCapability -Online -Name OpenSSH.Server~~~~0.0.1.0 | Out-Null }";

const SET_STARTUP: &str = "Set-Service -Name sshd -StartupType Automatic";

// First start generates the stock config and host keys
const START_SERVICE: &str = "Start-Service -Name sshd";

const RESTART_SERVICE: &str = "Restart-Service -Name sshd -Force";

/// Run one PowerShell step; failures are reported to the caller.
async fn step(script: &str) -> Result<()> {
    let output = process::run(&powershell(script), STEP_TIMEOUT).await?;
    if output.success() {
        Ok(())
    } else {
        Err(RelayError::daemon(
            SshMode::Windows,
            format!("`{}` failed: {}", script, output.failure_message()),
        ))
    }
}

/// Run a step whose failure does not stop the bring-up.
async fn best_effort(script: &str) {
    if let Err(e) = step(script).await {
        warn!("{}", e);
    }
}

/// Lock the admin keys file down to Administrators and SYSTEM, as sshd
/// requires.
fn restrict_keys_command(path: &Path) -> CommandSpec {
    CommandSpec::new("icacls.exe")
        .arg(path.to_string_lossy())
        .args([
            "/inheritance:r",
            "/grant",
            "Administrators:F",
            "/grant",
            "SYSTEM:F",
        ])
}

/// New content of the service config for these settings.
pub fn render(original: &str, settings: &Settings) -> String {
    let directives = managed_directives(settings.ssh.port, &settings.ssh.allowed_users);
    let force = settings.ssh.default_workdir.as_deref().map(windows_force_command);
    rewrite_system_config(original, &directives, force.as_deref())
}

/// Ensure, configure and restart the service, then wait for its port.
/// Authorized keys must already be written to [`authorized_keys_path`].
pub async fn bring_up(settings: &Settings) -> Result<SshBringupResult> {
    best_effort(ENSURE_CAPABILITY).await;
    best_effort(SET_STARTUP).await;

    let config = config_path();
    if !config.exists() {
        best_effort(START_SERVICE).await;
    }
    let original = match tokio::fs::read_to_string(&config).await {
        Ok(content) => content,
        Err(e) => {
            warn!("{} unreadable ({}), writing a fresh config", config.display(), e);
            String::new()
        }
    };

    let updated = render(&original, settings);
    if updated != original {
        tokio::fs::write(&config, &updated).await.map_err(|e| {
            RelayError::daemon(SshMode::Windows, format!("cannot write {}: {}", config.display(), e))
        })?;
        info!("Rewrote {}", config.display());
    }

    let acl = process::run(&restrict_keys_command(&authorized_keys_path()), STEP_TIMEOUT).await?;
    if !acl.success() {
        warn!("icacls on authorized keys failed: {}", acl.failure_message());
    }

    step(RESTART_SERVICE).await?;

    let host = probe::probe_host(&settings.ssh.listen_address);
    if !probe::wait_for_port(host, settings.ssh.port, settings.ssh.ready_timeout).await {
        return Err(RelayError::SshdNotReady {
            port: settings.ssh.port,
            timeout: settings.ssh.ready_timeout,
        });
    }

    Ok(SshBringupResult {
        mode: SshMode::Windows,
        port: settings.ssh.port,
        log_path: None,
        pid: None,
    })
}
