//! SSH daemon bring-up.
//!
//! The bring-up is a small state machine:
//!
//! ```text
//! Uninitialized -> KeysWritten -> UserMode | RootMode | WindowsMode -> Ready
//!        \______________\________________\_______________________-> Failed
//! ```
//!
//! The mode is a pure function of platform and configured mode (see
//! [`select_mode`]). Authorized keys are always written before any daemon is
//! touched, and any failure is terminal: no tunnel is attempted against a
//! daemon that is not confirmed listening.

pub mod keys;
pub mod root;
pub mod sshd_config;
pub mod user;
pub mod windows;

use std::fmt;
use std::path::PathBuf;

use tracing::{error, info};

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::types::{SshBringupResult, SshMode};

/// Host operating system families with distinct bring-up strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    Other(String),
}

impl Platform {
    /// Classify an OS name in `std::env::consts::OS` form.
    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            other => Platform::Other(other.to_string()),
        }
    }

    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Windows => write!(f, "windows"),
            Platform::Other(os) => write!(f, "{}", os),
        }
    }
}

/// Pick the bring-up mode.
///
/// Windows always uses the service. On Linux only an explicit `root` selects
/// the system daemon; anything else (`auto`, `user`) gets a private instance.
pub fn select_mode(platform: &Platform, configured: &str) -> Result<SshMode> {
    match platform {
        Platform::Windows => Ok(SshMode::Windows),
        Platform::Linux if configured.eq_ignore_ascii_case("root") => Ok(SshMode::Root),
        Platform::Linux => Ok(SshMode::User),
        Platform::Other(os) => Err(RelayError::UnsupportedPlatform(format!(
            "no SSH bring-up strategy for {}",
            os
        ))),
    }
}

/// Bring-up progress
#[derive(Debug, Clone, PartialEq)]
pub enum BringupState {
    Uninitialized,
    KeysWritten,
    UserMode,
    RootMode,
    WindowsMode,
    Ready(SshBringupResult),
    Failed(String),
}

impl BringupState {
    fn for_mode(mode: SshMode) -> Self {
        match mode {
            SshMode::User => BringupState::UserMode,
            SshMode::Root => BringupState::RootMode,
            SshMode::Windows => BringupState::WindowsMode,
        }
    }
}

impl fmt::Display for BringupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringupState::Uninitialized => write!(f, "uninitialized"),
            BringupState::KeysWritten => write!(f, "keys-written"),
            BringupState::UserMode => write!(f, "user-mode"),
            BringupState::RootMode => write!(f, "root-mode"),
            BringupState::WindowsMode => write!(f, "windows-mode"),
            BringupState::Ready(_) => write!(f, "ready"),
            BringupState::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Drives one bring-up from configuration to a listening daemon.
pub struct SshBringup<'a> {
    settings: &'a Settings,
    platform: Platform,
    state: BringupState,
}

impl<'a> SshBringup<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self::with_platform(settings, Platform::current())
    }

    pub fn with_platform(settings: &'a Settings, platform: Platform) -> Self {
        Self {
            settings,
            platform,
            state: BringupState::Uninitialized,
        }
    }

    pub fn state(&self) -> &BringupState {
        &self.state
    }

    fn transition(&mut self, next: BringupState) {
        info!("SSH bring-up: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run the bring-up to completion.
    ///
    /// Errors leave the machine in [`BringupState::Failed`]; running again
    /// after a terminal state is not supported.
    pub async fn run(&mut self) -> Result<SshBringupResult> {
        if self.state != BringupState::Uninitialized {
            return Err(RelayError::Configuration(format!(
                "SSH bring-up already ran (state {})",
                self.state
            )));
        }

        match self.drive().await {
            Ok(result) => {
                info!(
                    "SSH daemon ready on port {} ({} mode)",
                    result.port, result.mode
                );
                self.transition(BringupState::Ready(result.clone()));
                Ok(result)
            }
            Err(e) => {
                error!("SSH bring-up failed: {}", e);
                self.transition(BringupState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<SshBringupResult> {
        let mode = select_mode(&self.platform, &self.settings.ssh.mode)?;
        info!("Selected {} mode on {}", mode, self.platform);

        // Root mode must not touch the system before privilege is confirmed
        let elevation = match mode {
            SshMode::Root => Some(root::ensure_privilege().await?),
            _ => None,
        };

        let keys_path = self.authorized_keys_path(mode)?;
        keys::write_authorized_keys(&self.settings.ssh.public_keys, &keys_path)?;
        self.transition(BringupState::KeysWritten);

        self.transition(BringupState::for_mode(mode));
        match (mode, elevation) {
            (SshMode::Root, Some(elevation)) => root::bring_up(self.settings, elevation).await,
            (SshMode::Windows, _) => windows::bring_up(self.settings).await,
            _ => {
                let paths = user::UserModePaths::new(&self.settings.state_dir);
                user::bring_up(self.settings, &paths).await
            }
        }
    }

    /// Where the keys for `mode` are read from by its daemon.
    pub fn authorized_keys_path(&self, mode: SshMode) -> Result<PathBuf> {
        match mode {
            SshMode::User => Ok(user::UserModePaths::new(&self.settings.state_dir).authorized_keys),
            SshMode::Root => Ok(root::authorized_keys_path(&root::home_dir()?)),
            SshMode::Windows => Ok(windows::authorized_keys_path()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn settings(state_dir: &std::path::Path, keys: &str) -> Result<Settings> {
        let map: HashMap<String, String> = HashMap::from([
            ("SSH_PUBLIC_KEYS".to_string(), keys.to_string()),
            (
                "RELAY_STATE_DIR".to_string(),
                state_dir.to_string_lossy().into_owned(),
            ),
        ]);
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    fn settings_with(state_dir: &std::path::Path, pairs: &[(&str, &str)]) -> Result<Settings> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert(
            "RELAY_STATE_DIR".to_string(),
            state_dir.to_string_lossy().into_owned(),
        );
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    mod mode_selection {
        use super::*;

        #[test]
        fn test_linux_modes() {
            assert_eq!(select_mode(&Platform::Linux, "root").unwrap(), SshMode::Root);
            assert_eq!(select_mode(&Platform::Linux, "user").unwrap(), SshMode::User);
            assert_eq!(select_mode(&Platform::Linux, "auto").unwrap(), SshMode::User);
            assert_eq!(select_mode(&Platform::Linux, "").unwrap(), SshMode::User);
        }

        #[test]
        fn test_windows_ignores_configured_mode() {
            for configured in ["root", "user", "auto"] {
                assert_eq!(
                    select_mode(&Platform::Windows, configured).unwrap(),
                    SshMode::Windows
                );
            }
        }

        #[test]
        fn test_other_platforms_unsupported() {
            let result = select_mode(&Platform::from_os("macos"), "auto");
            assert!(matches!(result, Err(RelayError::UnsupportedPlatform(_))));
        }

        #[test]
        fn test_platform_from_os() {
            assert_eq!(Platform::from_os("linux"), Platform::Linux);
            assert_eq!(Platform::from_os("windows"), Platform::Windows);
            assert_eq!(Platform::from_os("freebsd").to_string(), "freebsd");
        }
    }

    mod state_machine {
        use super::*;

        const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBfa x";

        #[tokio::test]
        async fn test_unsupported_platform_fails_before_keys() {
            let dir = TempDir::new().unwrap();
            let settings = settings(dir.path(), KEY).unwrap();
            let mut bringup = SshBringup::with_platform(&settings, Platform::from_os("macos"));

            let result = bringup.run().await;
            assert!(matches!(result, Err(RelayError::UnsupportedPlatform(_))));
            assert!(matches!(bringup.state(), BringupState::Failed(_)));
            assert!(!dir.path().join("sshd").join("authorized_keys").exists());
        }

        #[tokio::test]
        async fn test_failed_machine_cannot_rerun() {
            let dir = TempDir::new().unwrap();
            let settings = settings(dir.path(), KEY).unwrap();
            let mut bringup = SshBringup::with_platform(&settings, Platform::from_os("macos"));

            assert!(bringup.run().await.is_err());
            let again = bringup.run().await;
            assert!(matches!(again, Err(RelayError::Configuration(_))));
        }

        #[test]
        fn test_user_mode_keys_live_in_state_dir() {
            let dir = TempDir::new().unwrap();
            let settings = settings(dir.path(), KEY).unwrap();
            let bringup = SshBringup::with_platform(&settings, Platform::Linux);

            assert_eq!(
                bringup.authorized_keys_path(SshMode::User).unwrap(),
                dir.path().join("sshd").join("authorized_keys")
            );
            assert_eq!(bringup.state(), &BringupState::Uninitialized);
        }

        #[test]
        fn test_state_names() {
            assert_eq!(BringupState::KeysWritten.to_string(), "keys-written");
            assert_eq!(BringupState::for_mode(SshMode::Root), BringupState::RootMode);
            assert_eq!(BringupState::Failed("x".into()).to_string(), "failed");
        }
    }

    #[cfg(unix)]
    mod user_mode {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBfa ci@laptop";

        /// Stand-in daemon: accepts the config test, records every call and
        /// writes a pid file on start without ever listening itself.
        fn fake_sshd(dir: &Path) -> std::path::PathBuf {
            let script = dir.join("fake-sshd");
            let calls = dir.join("calls");
            let body = format!(
                "#!/bin/sh\n\
                 echo \"$*\" >> '{}'\n\
                 [ \"$1\" = \"-t\" ] && exit 0\n\
                 echo $$ > \"$(dirname \"$2\")/sshd.pid\"\n\
                 exit 0\n",
                calls.display()
            );
            std::fs::write(&script, body).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            script
        }

        /// Host keys in place so no ssh-keygen is needed.
        fn seed_host_keys(state_dir: &Path) {
            let dir = state_dir.join("sshd");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("ssh_host_ed25519_key"), "seeded").unwrap();
            std::fs::write(dir.join("ssh_host_rsa_key"), "seeded").unwrap();
        }

        fn free_port() -> u16 {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        }

        fn user_settings(state_dir: &Path, sshd: &Path, port: u16) -> Settings {
            let port = port.to_string();
            let sshd = sshd.to_string_lossy();
            settings_with(
                state_dir,
                &[
                    ("SSH_PUBLIC_KEYS", KEY),
                    ("SSH_MODE", "user"),
                    ("SSH_PORT", &port),
                    ("SSH_LISTEN_ADDRESS", "127.0.0.1"),
                    ("SSH_READY_TIMEOUT", "1"),
                    ("SSHD_BINARY", &sshd),
                ],
            )
            .unwrap()
        }

        #[tokio::test]
        async fn test_daemon_that_never_listens_fails_bringup() {
            let state = TempDir::new().unwrap();
            let bin = TempDir::new().unwrap();
            let sshd = fake_sshd(bin.path());
            seed_host_keys(state.path());
            let port = free_port();
            let settings = user_settings(state.path(), &sshd, port);
            let mut bringup = SshBringup::with_platform(&settings, Platform::Linux);

            let result = bringup.run().await;

            match result {
                Err(RelayError::SshdNotReady { port: p, .. }) => assert_eq!(p, port),
                other => panic!("expected sshd not ready, got {:?}", other),
            }
            assert!(matches!(bringup.state(), BringupState::Failed(_)));

            // Keys were installed before the daemon was started
            let keys = std::fs::read_to_string(state.path().join("sshd").join("authorized_keys")).unwrap();
            assert!(keys.contains(KEY));

            let calls = std::fs::read_to_string(bin.path().join("calls")).unwrap();
            let calls: Vec<&str> = calls.lines().collect();
            assert_eq!(calls.len(), 2);
            assert!(calls[0].starts_with("-t -f "));
            assert!(calls[1].contains(" -E "));
        }

        #[tokio::test]
        async fn test_listening_daemon_reaches_ready() {
            let state = TempDir::new().unwrap();
            let bin = TempDir::new().unwrap();
            let sshd = fake_sshd(bin.path());
            seed_host_keys(state.path());
            // Stands in for the forked daemon's socket
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let settings = user_settings(state.path(), &sshd, port);
            let mut bringup = SshBringup::with_platform(&settings, Platform::Linux);

            let result = bringup.run().await.unwrap();

            assert_eq!(result.mode, SshMode::User);
            assert_eq!(result.port, port);
            assert!(result.pid.is_some());
            assert_eq!(
                result.log_path,
                Some(state.path().join("sshd").join("sshd.log"))
            );
            assert_eq!(bringup.state(), &BringupState::Ready(result.clone()));

            let sshd_dir = state.path().join("sshd");
            let keys = std::fs::read_to_string(sshd_dir.join("authorized_keys")).unwrap();
            assert!(keys.contains(KEY));
            let config = std::fs::read_to_string(sshd_dir.join("sshd_config")).unwrap();
            assert!(config.contains(&format!("Port {}", port)));
            assert!(config.contains(&format!(
                "AuthorizedKeysFile {}",
                sshd_dir.join("authorized_keys").display()
            )));
            drop(listener);
        }
    }
}
