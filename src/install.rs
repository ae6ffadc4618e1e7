//! Dependency installation.
//!
//! Tunnel clients missing from the runner are fetched with `curl` (or `wget`
//! when curl is absent) under the configured [`BackoffPolicy`]. Downloads land
//! in a `.part` file first and are renamed into place only once complete, so an
//! interrupted download never leaves a truncated executable behind.
//!
//! Missing system packages (the SSH daemon) are installed best-effort through
//! whichever package manager the host has.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{RelayError, Result};
use crate::process::{self, CommandSpec};

/// Release download base for cloudflared
pub const CLOUDFLARED_RELEASE_BASE: &str =
    "https://github.com/cloudflare/cloudflared/releases/latest/download";

/// Bound on one package manager invocation
const PACKAGE_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP client used for downloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downloader {
    Curl(PathBuf),
    Wget(PathBuf),
}

impl Downloader {
    /// Pick curl, then wget, from `PATH`.
    pub fn detect() -> Result<Self> {
        if let Some(curl) = process::find_binary("curl") {
            return Ok(Downloader::Curl(curl));
        }
        if let Some(wget) = process::find_binary("wget") {
            return Ok(Downloader::Wget(wget));
        }
        Err(RelayError::Network(
            "neither curl nor wget is available on PATH".to_string(),
        ))
    }

    fn command(&self, url: &str, dest: &Path) -> CommandSpec {
        let dest = dest.to_string_lossy().into_owned();
        match self {
            Downloader::Curl(bin) => CommandSpec::new(bin.to_string_lossy())
                .args(["--fail", "--silent", "--show-error", "--location", "--output"])
                .arg(dest)
                .arg(url),
            Downloader::Wget(bin) => CommandSpec::new(bin.to_string_lossy())
                .args(["--quiet", "--output-document"])
                .arg(dest)
                .arg(url),
        }
    }
}

/// Download `url` to `dest` and mark it executable.
///
/// Each attempt is bounded by `timeout`; failed attempts are retried per
/// `policy`. The error of the final attempt is returned unchanged.
pub async fn download(url: &str, dest: &Path, policy: &BackoffPolicy, timeout: Duration) -> Result<()> {
    let downloader = Downloader::detect()?;
    download_with(&downloader, url, dest, policy, timeout).await
}

/// [`download`] with an explicit client.
pub async fn download_with(
    downloader: &Downloader,
    url: &str,
    dest: &Path,
    policy: &BackoffPolicy,
    timeout: Duration,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(dest);
    let spec = downloader.command(url, &partial);

    info!("Downloading {} to {}", url, dest.display());
    let label = format!("download {}", url);
    policy
        .retry(&label, || async {
            let output = process::run(&spec, timeout).await?;
            if output.success() {
                Ok(())
            } else {
                Err(RelayError::Network(format!(
                    "download of {} failed ({})",
                    url,
                    output.failure_message()
                )))
            }
        })
        .await?;

    tokio::fs::rename(&partial, dest).await?;
    make_executable(dest)?;
    debug!("Installed {}", dest.display());
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Release asset name of cloudflared for a target OS/arch pair
/// (`std::env::consts` naming).
pub fn cloudflared_asset(os: &str, arch: &str) -> Result<&'static str> {
    let asset = match (os, arch) {
        ("linux", "x86_64") => "cloudflared-linux-amd64",
        ("linux", "aarch64") => "cloudflared-linux-arm64",
        ("linux", "arm") => "cloudflared-linux-arm",
        ("linux", "x86") => "cloudflared-linux-386",
        ("windows", "x86_64") => "cloudflared-windows-amd64.exe",
        ("windows", "x86") => "cloudflared-windows-386.exe",
        _ => {
            return Err(RelayError::UnsupportedPlatform(format!(
                "no cloudflared release for {}/{}",
                os, arch
            )));
        }
    };
    Ok(asset)
}

/// Download URL of cloudflared for the running host.
pub fn cloudflared_url() -> Result<String> {
    let asset = cloudflared_asset(std::env::consts::OS, std::env::consts::ARCH)?;
    Ok(format!("{}/{}", CLOUDFLARED_RELEASE_BASE, asset))
}

/// Package managers tried in order, with their non-interactive install verb
const PACKAGE_MANAGERS: &[(&str, &[&str])] = &[
    ("apt-get", &["install", "-y", "-q"]),
    ("dnf", &["install", "-y"]),
    ("yum", &["install", "-y"]),
    ("apk", &["add", "--no-cache"]),
    ("zypper", &["--non-interactive", "install"]),
    ("pacman", &["-S", "--noconfirm"]),
];

/// Best-effort install of a system package.
///
/// Runs directly as superuser, through `sudo -n` when `use_sudo` is set.
/// Returns whether an install command succeeded; never errors.
pub async fn install_system_package(package: &str, use_sudo: bool) -> bool {
    let Some((manager, verb)) = PACKAGE_MANAGERS
        .iter()
        .find(|(manager, _)| process::find_binary(manager).is_some())
    else {
        warn!("No supported package manager found to install {}", package);
        return false;
    };

    if *manager == "apt-get" {
        let update = elevated(use_sudo, manager).args(["update", "-q"]);
        if !process::succeeds(&update, PACKAGE_INSTALL_TIMEOUT).await {
            warn!("apt-get update failed, attempting install anyway");
        }
    }

    let spec = elevated(use_sudo, manager)
        .args(verb.iter().copied())
        .arg(package)
        .env("DEBIAN_FRONTEND", "noninteractive");
    info!("Installing {} with {}", package, manager);
    let installed = process::succeeds(&spec, PACKAGE_INSTALL_TIMEOUT).await;
    if !installed {
        warn!("Installing {} with {} failed", package, manager);
    }
    installed
}

fn elevated(use_sudo: bool, program: &str) -> CommandSpec {
    if use_sudo {
        CommandSpec::new("sudo").args(["-n", program])
    } else {
        CommandSpec::new(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(2),
            max_retries: 1,
        }
    }

    mod assets {
        use super::*;

        #[test]
        fn test_linux_assets() {
            assert_eq!(
                cloudflared_asset("linux", "x86_64").unwrap(),
                "cloudflared-linux-amd64"
            );
            assert_eq!(
                cloudflared_asset("linux", "aarch64").unwrap(),
                "cloudflared-linux-arm64"
            );
        }

        #[test]
        fn test_windows_asset_is_exe() {
            assert!(cloudflared_asset("windows", "x86_64").unwrap().ends_with(".exe"));
        }

        #[test]
        fn test_unknown_target() {
            let err = cloudflared_asset("freebsd", "x86_64").unwrap_err();
            assert!(matches!(err, RelayError::UnsupportedPlatform(_)));
        }

        #[test]
        fn test_partial_path() {
            assert_eq!(
                partial_path(Path::new("/opt/bin/cloudflared")),
                PathBuf::from("/opt/bin/cloudflared.part")
            );
        }
    }

    mod downloader {
        use super::*;

        #[test]
        fn test_curl_arguments() {
            let spec = Downloader::Curl(PathBuf::from("/usr/bin/curl"))
                .command("https://example.com/f", Path::new("/tmp/f.part"));
            assert_eq!(
                spec.to_string(),
                "/usr/bin/curl --fail --silent --show-error --location --output /tmp/f.part https://example.com/f"
            );
        }

        #[test]
        fn test_wget_arguments() {
            let spec = Downloader::Wget(PathBuf::from("wget"))
                .command("https://example.com/f", Path::new("/tmp/f.part"));
            assert_eq!(
                spec.to_string(),
                "wget --quiet --output-document /tmp/f.part https://example.com/f"
            );
        }
    }

    #[cfg(unix)]
    mod downloads {
        use super::*;

        fn curl() -> Option<Downloader> {
            process::find_binary("curl").map(Downloader::Curl)
        }

        #[tokio::test]
        async fn test_local_file_download_is_executable() {
            let Some(curl) = curl() else { return };
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("source.bin");
            std::fs::write(&source, b"#!/bin/sh\necho ok\n").unwrap();
            let dest = dir.path().join("bin").join("tool");

            let url = format!("file://{}", source.display());
            download_with(&curl, &url, &dest, &fast_policy(), Duration::from_secs(10))
                .await
                .unwrap();

            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            assert!(!partial_path(&dest).exists());
        }

        #[tokio::test]
        async fn test_failed_download_is_network_error() {
            let Some(curl) = curl() else { return };
            let dir = TempDir::new().unwrap();
            let dest = dir.path().join("tool");

            let url = format!("file://{}/missing.bin", dir.path().display());
            let result =
                download_with(&curl, &url, &dest, &fast_policy(), Duration::from_secs(10)).await;

            assert!(matches!(result, Err(RelayError::Network(_))));
            assert!(!dest.exists());
        }
    }
}
