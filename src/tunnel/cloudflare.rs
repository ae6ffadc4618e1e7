//! Cloudflare backend: a named `cloudflared` tunnel serving `ssh://`.
//!
//! Before launching, the named tunnel is reconciled remotely: existing
//! tunnels are listed by name and one is created only if none exists, so
//! repeated runs with the same name reuse a single remote resource.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::CloudflareSettings;
use crate::error::{RelayError, Result};
use crate::install;
use crate::probe;
use crate::process::{self, CommandSpec, ProcessRegistry};
use crate::types::{HealthStatus, SshBringupResult, TunnelDescriptor, TunnelKind, TunnelOutcome};

use super::{BackendProcess, TunnelPlugin};

/// Public hostname of a named tunnel
static ENDPOINT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://[0-9a-fA-F-]+\.cfargotunnel\.com").expect("valid endpoint pattern")
});

#[cfg(windows)]
const BINARY_NAME: &str = "cloudflared.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "cloudflared";

/// A tunnel as listed by `cloudflared tunnel list --output json`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteTunnel {
    pub id: String,
    pub name: String,
}

pub struct CloudflareTunnel {
    settings: CloudflareSettings,
    login_user: String,
    install_dir: PathBuf,
    backoff: BackoffPolicy,
    binary: Option<PathBuf>,
    tunnel_id: Option<String>,
    process: BackendProcess,
    endpoint: Option<String>,
}

impl CloudflareTunnel {
    pub fn new(
        settings: CloudflareSettings,
        login_user: String,
        state_dir: PathBuf,
        backoff: BackoffPolicy,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            settings,
            login_user,
            install_dir: state_dir.join("bin"),
            backoff,
            binary: None,
            tunnel_id: None,
            process: BackendProcess::new(TunnelKind::Cloudflare, registry),
            endpoint: None,
        }
    }

    fn err(message: impl Into<String>) -> RelayError {
        RelayError::tunnel(TunnelKind::Cloudflare, message)
    }

    /// `cloudflared tunnel [--origincert CERT]` prefix shared by every call.
    fn tunnel_command(&self) -> Result<CommandSpec> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| Self::err("cloudflared is not installed"))?;
        let mut spec = CommandSpec::new(binary.to_string_lossy())
            .arg("tunnel")
            .arg("--no-autoupdate");
        if let Some(cert) = &self.settings.origin_cert {
            spec = spec.arg("--origincert").arg(cert.to_string_lossy());
        }
        Ok(spec)
    }

    /// Run one remote management call; failures are network errors so the
    /// backoff policy applies.
    async fn remote(&self, spec: &CommandSpec) -> Result<String> {
        let output = process::run(spec, self.settings.descriptor.timeouts.install).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(RelayError::Network(format!(
                "`{}` failed: {}",
                spec,
                output.failure_message()
            )))
        }
    }

    /// Look the named tunnel up, creating it only if absent.
    async fn reconcile(&self) -> Result<RemoteTunnel> {
        let name = &self.settings.tunnel_name;
        let list = self
            .tunnel_command()?
            .args(["list", "--output", "json", "--name"])
            .arg(name.as_str());
        let listed = self
            .backoff
            .retry("cloudflared tunnel list", || self.remote(&list))
            .await?;

        if let Some(existing) = find_tunnel(&listed, name)? {
            info!("Reusing Cloudflare tunnel {} ({})", existing.name, existing.id);
            return Ok(existing);
        }

        let create = self
            .tunnel_command()?
            .args(["create", "--output", "json"])
            .arg(name.as_str());
        // Not retried: a create that timed out may have succeeded remotely
        let created = self.remote(&create).await?;
        let tunnel: RemoteTunnel = serde_json::from_str(created.trim())
            .map_err(|e| Self::err(format!("unexpected `tunnel create` output: {}", e)))?;
        info!("Created Cloudflare tunnel {} ({})", tunnel.name, tunnel.id);
        Ok(tunnel)
    }

    fn run_command(&self, local_port: u16) -> Result<CommandSpec> {
        Ok(self
            .tunnel_command()?
            .arg("--url")
            .arg(format!("ssh://localhost:{}", local_port))
            .arg("run")
            .arg(self.settings.tunnel_name.as_str()))
    }

    fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([(
            "CLOUDFLARE_TUNNEL_NAME".to_string(),
            self.settings.tunnel_name.clone(),
        )]);
        if let Some(id) = &self.tunnel_id {
            vars.insert("CLOUDFLARE_TUNNEL_ID".to_string(), id.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            vars.insert("CLOUDFLARE_ENDPOINT".to_string(), endpoint.clone());
        }
        if let Some(connect) = self.connect_command() {
            vars.insert("CLOUDFLARE_CONNECT".to_string(), connect);
        }
        vars
    }
}

/// Find a tunnel by exact name in `tunnel list` JSON output.
pub fn find_tunnel(list_json: &str, name: &str) -> Result<Option<RemoteTunnel>> {
    let trimmed = list_json.trim();
    // Older releases print nothing at all when the list is empty
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    let tunnels: Vec<RemoteTunnel> = serde_json::from_str(trimmed).map_err(|e| {
        RelayError::tunnel(
            TunnelKind::Cloudflare,
            format!("unexpected `tunnel list` output: {}", e),
        )
    })?;
    Ok(tunnels.into_iter().find(|t| t.name == name))
}

/// First Cloudflare endpoint in a chunk of log output.
pub fn extract_endpoint(log: &str) -> Option<String> {
    ENDPOINT_PATTERN.find(log).map(|m| m.as_str().to_string())
}

#[async_trait]
impl TunnelPlugin for CloudflareTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Cloudflare
    }

    fn descriptor(&self) -> &TunnelDescriptor {
        &self.settings.descriptor
    }

    /// Named tunnels need an origin certificate.
    fn is_available(&self) -> bool {
        self.settings.descriptor.enabled && self.settings.origin_cert.is_some()
    }

    async fn install(&mut self) -> Result<()> {
        if self.binary.is_some() {
            return Ok(());
        }

        let local = self.install_dir.join(BINARY_NAME);
        let found = match &self.settings.binary {
            Some(explicit) => process::find_binary(explicit),
            None => process::find_binary("cloudflared"),
        }
        .or_else(|| local.is_file().then(|| local.clone()));
        if let Some(found) = found {
            self.binary = Some(found);
            return Ok(());
        }

        if let Some(explicit) = &self.settings.binary {
            return Err(Self::err(format!("cloudflared binary '{}' not found", explicit)));
        }

        let url = install::cloudflared_url()
            .map_err(|e| Self::err(format!("cloudflared is missing: {}", e)))?;
        install::download(&url, &local, &self.backoff, self.settings.descriptor.timeouts.install)
            .await
            .map_err(|e| Self::err(format!("cloudflared is missing and could not be installed: {}", e)))?;
        self.binary = Some(local);
        Ok(())
    }

    async fn start(&mut self, ssh: &SshBringupResult, log_dir: &Path) -> Result<TunnelOutcome> {
        let tunnel = self.reconcile().await.map_err(|e| match e {
            RelayError::Tunnel { .. } => e,
            other => Self::err(format!("tunnel reconciliation failed: {}", other)),
        })?;
        self.tunnel_id = Some(tunnel.id);

        let spec = self.run_command(ssh.port)?;
        if self.settings.descriptor.foreground {
            return Err(self.process.exec(&spec));
        }

        let handle = self.process.launch(&spec, log_dir)?;
        let log_path = BackendProcess::log_path(TunnelKind::Cloudflare, log_dir);
        let timeout = self.settings.descriptor.timeouts.discovery;

        self.endpoint = probe::wait_for_log_match(&log_path, &ENDPOINT_PATTERN, timeout).await;
        match &self.endpoint {
            Some(endpoint) => info!("Cloudflare endpoint: {}", endpoint),
            None => warn!(
                "No Cloudflare endpoint in {} after {:?}; the tunnel may still report it later",
                log_path.display(),
                timeout
            ),
        }

        Ok(TunnelOutcome {
            kind: TunnelKind::Cloudflare,
            succeeded: true,
            endpoint: self.endpoint.clone(),
            connect_command: self.connect_command(),
            process: Some(handle),
            error: None,
            variables: self.variables(),
        })
    }

    fn connect_command(&self) -> Option<String> {
        let host = self.endpoint.as_deref()?.strip_prefix("https://")?;
        Some(format!(
            r#"ssh -o ProxyCommand="cloudflared access ssh --hostname {}" {}@{}"#,
            host, self.login_user, host
        ))
    }

    fn health_check(&self) -> HealthStatus {
        self.process.health()
    }

    fn stop(&mut self) -> bool {
        self.endpoint = None;
        self.process.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TunnelTimeouts;
    use std::time::Duration;
    use tempfile::TempDir;

    fn tunnel(state_dir: &Path, cert: Option<&str>, binary: Option<&str>) -> CloudflareTunnel {
        CloudflareTunnel::new(
            CloudflareSettings {
                descriptor: TunnelDescriptor {
                    kind: TunnelKind::Cloudflare,
                    enabled: true,
                    target_host: "cfargotunnel.com".to_string(),
                    target_port: 443,
                    foreground: false,
                    timeouts: TunnelTimeouts {
                        install: Duration::from_secs(5),
                        discovery: Duration::from_secs(2),
                    },
                },
                origin_cert: cert.map(PathBuf::from),
                tunnel_name: "ci-ssh-runner".to_string(),
                binary: binary.map(str::to_string),
            },
            "runner".to_string(),
            state_dir.to_path_buf(),
            BackoffPolicy {
                initial_delay: Duration::from_millis(1),
                factor: 2.0,
                max_delay: Duration::from_millis(2),
                max_retries: 2,
            },
            ProcessRegistry::new(),
        )
    }

    mod parsing {
        use super::*;

        const LIST: &str = r#"[
            {"id":"6ff42ae2-765d-4adf-8112-31c55c1551ef","name":"ci-ssh-runner-old","created_at":"2026-01-01T00:00:00Z","connections":[]},
            {"id":"0c7d5b4a-1111-2222-3333-444455556666","name":"ci-ssh-runner","created_at":"2026-02-01T00:00:00Z","connections":[]}
        ]"#;

        #[test]
        fn test_find_by_exact_name() {
            let found = find_tunnel(LIST, "ci-ssh-runner").unwrap().unwrap();
            assert_eq!(found.id, "0c7d5b4a-1111-2222-3333-444455556666");
            assert!(find_tunnel(LIST, "ci-ssh").unwrap().is_none());
        }

        #[test]
        fn test_empty_listing() {
            assert!(find_tunnel("", "x").unwrap().is_none());
            assert!(find_tunnel("null\n", "x").unwrap().is_none());
            assert!(find_tunnel("[]", "x").unwrap().is_none());
        }

        #[test]
        fn test_garbage_listing_is_tunnel_error() {
            let err = find_tunnel("You did not specify any valid credentials", "x").unwrap_err();
            assert!(matches!(err, RelayError::Tunnel { kind: TunnelKind::Cloudflare, .. }));
        }

        #[test]
        fn test_extract_endpoint() {
            let log = "2026-02-01T00:00:00Z INF Registered tunnel connection \
                       url=https://0c7d5b4a-1111-2222-3333-444455556666.cfargotunnel.com\n";
            assert_eq!(
                extract_endpoint(log).as_deref(),
                Some("https://0c7d5b4a-1111-2222-3333-444455556666.cfargotunnel.com")
            );
            assert!(extract_endpoint("https://quick.trycloudflare.com").is_none());
        }
    }

    mod plugin {
        use super::*;

        #[test]
        fn test_requires_certificate() {
            let dir = TempDir::new().unwrap();
            assert!(!tunnel(dir.path(), None, None).is_available());
            assert!(tunnel(dir.path(), Some("/cert.pem"), None).is_available());
        }

        #[test]
        fn test_connect_command_via_access_proxy() {
            let dir = TempDir::new().unwrap();
            let mut cf = tunnel(dir.path(), Some("/cert.pem"), None);
            assert!(cf.connect_command().is_none());

            cf.endpoint = Some("https://abc-123.cfargotunnel.com".to_string());
            assert_eq!(
                cf.connect_command().as_deref(),
                Some(
                    r#"ssh -o ProxyCommand="cloudflared access ssh --hostname abc-123.cfargotunnel.com" runner@abc-123.cfargotunnel.com"#
                )
            );
        }

        #[test]
        fn test_run_command() {
            let dir = TempDir::new().unwrap();
            let mut cf = tunnel(dir.path(), Some("/cert.pem"), None);
            assert!(cf.run_command(2222).is_err());

            cf.binary = Some(PathBuf::from("/opt/cloudflared"));
            let spec = cf.run_command(2222).unwrap();
            assert_eq!(
                spec.to_string(),
                "/opt/cloudflared tunnel --no-autoupdate --origincert /cert.pem --url ssh://localhost:2222 run ci-ssh-runner"
            );
        }

        #[tokio::test]
        async fn test_missing_explicit_binary() {
            let dir = TempDir::new().unwrap();
            let mut cf = tunnel(dir.path(), Some("/cert.pem"), Some("/nonexistent/cloudflared"));
            let err = cf.install().await.unwrap_err();
            assert!(err.to_string().contains("/nonexistent/cloudflared"));
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn test_preinstalled_binary_in_state_dir() {
            let dir = TempDir::new().unwrap();
            let bin = dir.path().join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            std::fs::write(bin.join(BINARY_NAME), "#!/bin/sh\n").unwrap();

            let mut cf = tunnel(dir.path(), Some("/cert.pem"), None);
            if process::find_binary("cloudflared").is_some() {
                return;
            }
            cf.install().await.unwrap();
            assert_eq!(cf.binary, Some(bin.join(BINARY_NAME)));
        }
    }

    #[cfg(unix)]
    mod reconciliation {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Fake cloudflared recording every invocation; `list` answers with
        /// the contents of `listing`.
        fn fake_cloudflared(dir: &Path, listing: &str) -> PathBuf {
            let calls = dir.join("calls");
            let list_file = dir.join("listing.json");
            std::fs::write(&list_file, listing).unwrap();
            let script = dir.join("cloudflared");
            std::fs::write(
                &script,
                format!(
                    "#!/bin/sh\n\
                     echo \"$@\" >> '{calls}'\n\
                     case \"$*\" in\n\
                     *' list '*) cat '{list}' ;;\n\
                     *' create '*) echo '{{\"id\":\"new-id\",\"name\":\"ci-ssh-runner\"}}' ;;\n\
                     *) exit 3 ;;\n\
                     esac\n",
                    calls = calls.display(),
                    list = list_file.display()
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            script
        }

        fn calls(dir: &Path) -> Vec<String> {
            std::fs::read_to_string(dir.join("calls"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        #[tokio::test]
        async fn test_existing_tunnel_is_reused() {
            let dir = TempDir::new().unwrap();
            let script = fake_cloudflared(
                dir.path(),
                r#"[{"id":"existing-id","name":"ci-ssh-runner"}]"#,
            );
            let mut cf = tunnel(dir.path(), Some("/cert.pem"), None);
            cf.binary = Some(script);

            let found = cf.reconcile().await.unwrap();
            assert_eq!(found.id, "existing-id");
            let calls = calls(dir.path());
            assert_eq!(calls.len(), 1);
            assert!(!calls[0].contains("create"));
        }

        #[tokio::test]
        async fn test_absent_tunnel_is_created_once() {
            let dir = TempDir::new().unwrap();
            let script = fake_cloudflared(dir.path(), "[]");
            let mut cf = tunnel(dir.path(), Some("/cert.pem"), None);
            cf.binary = Some(script);

            let created = cf.reconcile().await.unwrap();
            assert_eq!(created.id, "new-id");
            let calls = calls(dir.path());
            assert_eq!(calls.len(), 2);
            assert!(calls[1].contains("create --output json ci-ssh-runner"));
        }
    }
}
