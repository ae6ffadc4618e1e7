//! Configuration context for one invocation.
//!
//! Every value is resolved once at startup and frozen into [`Settings`], which
//! is then passed by reference into every component. Nothing mutates it
//! afterwards.
//!
//! Resolution order for each value:
//!
//! 1. **Environment Variable** (a `.env` file is loaded first by `main`)
//! 2. **Default** - Built-in default value
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_PORT` | 2222 | Port the daemon listens on |
//! | `SSH_MODE` | auto | `auto`, `user` or `root` |
//! | `SSH_LISTEN_ADDRESS` | 0.0.0.0 | Daemon listen address |
//! | `SSH_ALLOWED_USERS` | login user | Comma/space separated allow-list |
//! | `SSH_DEFAULT_DIR` | - | Working directory forced on login |
//! | `SSH_PUBLIC_KEYS` | **required** | Authorized public keys, one per line |
//! | `SSH_READY_TIMEOUT` | 30s | Bound on the daemon port probe |
//! | `SSHD_BINARY` | PATH lookup | sshd executable for user mode |
//! | `RELAY_STATE_DIR` | `$RUNNER_TEMP/ci-sshd-relay` | Keys, configs, logs |
//! | `RELAY_USER` | `$USER` | Login user for connect commands |
//! | `RELAY_MAX_RETRIES` | 3 | Download/remote call retries |
//! | `RELAY_RETRY_DELAY_MS` | 1000ms | Initial retry delay |
//! | `RELAY_MAX_RETRY_DELAY_MS` | 10000ms | Retry delay cap |
//! | `RELAY_EXPORT_FILE` | `$GITHUB_ENV` | File receiving `KEY=VALUE` exports |
//!
//! Each backend `P` in `PINGGY`, `SSHJ`, `CLOUDFLARE` also reads `P_ENABLED`,
//! `P_HOST`, `P_PORT`, `P_FOREGROUND`, `P_TIMEOUT` and `P_INSTALL_TIMEOUT`.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{RelayError, Result};
use crate::types::{TunnelDescriptor, TunnelKind, TunnelTimeouts};

/// Default daemon port
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// Default daemon listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

/// Default bound on the daemon port probe in seconds
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;

/// Default bound on endpoint discovery in seconds
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 30;

/// Default bound on one dependency download in seconds
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 120;

/// Default Pinggy relay
pub const DEFAULT_PINGGY_HOST: &str = "a.pinggy.io";
pub const DEFAULT_PINGGY_PORT: u16 = 443;

/// Default SSH-J relay
pub const DEFAULT_SSHJ_HOST: &str = "ssh-j.com";
pub const DEFAULT_SSHJ_PORT: u16 = 22;

/// Cloudflare's tunnel edge domain
pub const DEFAULT_CLOUDFLARE_HOST: &str = "cfargotunnel.com";
pub const DEFAULT_CLOUDFLARE_PORT: u16 = 443;

/// Environment variable names
pub const SSH_PORT_ENV_VAR: &str = "SSH_PORT";
pub const SSH_MODE_ENV_VAR: &str = "SSH_MODE";
pub const LISTEN_ADDRESS_ENV_VAR: &str = "SSH_LISTEN_ADDRESS";
pub const ALLOWED_USERS_ENV_VAR: &str = "SSH_ALLOWED_USERS";
pub const DEFAULT_DIR_ENV_VAR: &str = "SSH_DEFAULT_DIR";
pub const PUBLIC_KEYS_ENV_VAR: &str = "SSH_PUBLIC_KEYS";
pub const READY_TIMEOUT_ENV_VAR: &str = "SSH_READY_TIMEOUT";
pub const STATE_DIR_ENV_VAR: &str = "RELAY_STATE_DIR";
pub const USER_ENV_VAR: &str = "RELAY_USER";
pub const MAX_RETRIES_ENV_VAR: &str = "RELAY_MAX_RETRIES";
pub const RETRY_DELAY_MS_ENV_VAR: &str = "RELAY_RETRY_DELAY_MS";
pub const MAX_RETRY_DELAY_MS_ENV_VAR: &str = "RELAY_MAX_RETRY_DELAY_MS";
pub const EXPORT_FILE_ENV_VAR: &str = "RELAY_EXPORT_FILE";
pub const SSHD_BINARY_ENV_VAR: &str = "SSHD_BINARY";
pub const CLOUDFLARE_CERT_ENV_VAR: &str = "CLOUDFLARE_CERT";

/// Settings for the SSH daemon bring-up
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub port: u16,
    /// `auto`, `user` or `root`, lowercased
    pub mode: String,
    pub listen_address: String,
    pub allowed_users: Vec<String>,
    pub default_workdir: Option<PathBuf>,
    /// Raw public key blob as configured
    pub public_keys: String,
    pub ready_timeout: Duration,
    /// Explicit sshd executable for user mode; searched for otherwise
    pub sshd_binary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PinggySettings {
    pub descriptor: TunnelDescriptor,
    pub token: Option<String>,
    pub ssh_binary: String,
}

#[derive(Debug, Clone)]
pub struct SshJSettings {
    pub descriptor: TunnelDescriptor,
    pub namespace: String,
    pub device: String,
    pub ssh_binary: String,
}

#[derive(Debug, Clone)]
pub struct CloudflareSettings {
    pub descriptor: TunnelDescriptor,
    /// Origin certificate from `cloudflared tunnel login`
    pub origin_cert: Option<PathBuf>,
    pub tunnel_name: String,
    /// Explicit cloudflared binary; looked up on PATH otherwise
    pub binary: Option<String>,
}

/// Immutable context built once per invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub ssh: SshSettings,
    pub pinggy: PinggySettings,
    pub sshj: SshJSettings,
    pub cloudflare: CloudflareSettings,
    pub backoff: BackoffPolicy,
    /// Root for generated keys, configs, binaries and logs
    pub state_dir: PathBuf,
    /// Account used in connect commands and the default allow-list
    pub login_user: String,
    pub export_file: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup: &lookup };

        let login_user = source
            .string(USER_ENV_VAR)
            .or_else(|| source.string("USER"))
            .or_else(|| source.string("USERNAME"))
            .unwrap_or_else(|| "runner".to_string());

        let port = match source.string(SSH_PORT_ENV_VAR) {
            Some(raw) => raw.parse::<u16>().map_err(|e| {
                RelayError::Configuration(format!("{} must be a port number: {}", SSH_PORT_ENV_VAR, e))
            })?,
            None => DEFAULT_SSH_PORT,
        };

        let mut allowed_users = source
            .string(ALLOWED_USERS_ENV_VAR)
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        if allowed_users.is_empty() {
            allowed_users.push(login_user.clone());
        }

        let ssh = SshSettings {
            port,
            mode: source
                .string(SSH_MODE_ENV_VAR)
                .unwrap_or_else(|| "auto".to_string())
                .to_lowercase(),
            listen_address: source
                .string(LISTEN_ADDRESS_ENV_VAR)
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            allowed_users,
            default_workdir: source.string(DEFAULT_DIR_ENV_VAR).map(PathBuf::from),
            public_keys: source.raw(PUBLIC_KEYS_ENV_VAR).unwrap_or_default(),
            ready_timeout: source.secs(READY_TIMEOUT_ENV_VAR, DEFAULT_READY_TIMEOUT_SECS),
            sshd_binary: source.string(SSHD_BINARY_ENV_VAR),
        };

        let host_label = sanitize_label(&machine_name());

        let pinggy = PinggySettings {
            descriptor: source.descriptor(
                TunnelKind::Pinggy,
                true,
                DEFAULT_PINGGY_HOST,
                DEFAULT_PINGGY_PORT,
            ),
            token: source.string("PINGGY_TOKEN"),
            ssh_binary: source
                .string("PINGGY_SSH_BINARY")
                .unwrap_or_else(|| "ssh".to_string()),
        };

        let sshj = SshJSettings {
            descriptor: source.descriptor(TunnelKind::SshJ, true, DEFAULT_SSHJ_HOST, DEFAULT_SSHJ_PORT),
            namespace: source
                .string("SSHJ_NAMESPACE")
                .unwrap_or_else(generate_namespace),
            device: source
                .string("SSHJ_DEVICE")
                .map(|d| sanitize_label(&d))
                .unwrap_or_else(|| host_label.clone()),
            ssh_binary: source
                .string("SSHJ_SSH_BINARY")
                .unwrap_or_else(|| "ssh".to_string()),
        };

        let cloudflare = CloudflareSettings {
            descriptor: source.descriptor(
                TunnelKind::Cloudflare,
                false,
                DEFAULT_CLOUDFLARE_HOST,
                DEFAULT_CLOUDFLARE_PORT,
            ),
            origin_cert: source
                .string(CLOUDFLARE_CERT_ENV_VAR)
                .or_else(|| source.string("TUNNEL_ORIGIN_CERT"))
                .map(PathBuf::from),
            tunnel_name: source
                .string("CLOUDFLARE_TUNNEL_NAME")
                .unwrap_or_else(|| format!("ci-ssh-{}", host_label)),
            binary: source.string("CLOUDFLARE_BINARY"),
        };

        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(
                source.parse(RETRY_DELAY_MS_ENV_VAR, BackoffPolicy::default().initial_delay.as_millis() as u64),
            ),
            max_delay: Duration::from_millis(
                source.parse(MAX_RETRY_DELAY_MS_ENV_VAR, BackoffPolicy::default().max_delay.as_millis() as u64),
            ),
            max_retries: source.parse(MAX_RETRIES_ENV_VAR, BackoffPolicy::default().max_retries),
            ..BackoffPolicy::default()
        };

        let state_dir = source
            .string(STATE_DIR_ENV_VAR)
            .map(PathBuf::from)
            .or_else(|| source.string("RUNNER_TEMP").map(|t| PathBuf::from(t).join("ci-sshd-relay")))
            .unwrap_or_else(|| env::temp_dir().join("ci-sshd-relay"));
        // Generated daemon configs embed paths under this directory
        let state_dir = std::path::absolute(&state_dir).map_err(|e| {
            RelayError::Configuration(format!(
                "cannot resolve state directory {}: {}",
                state_dir.display(),
                e
            ))
        })?;

        let export_file = source
            .string(EXPORT_FILE_ENV_VAR)
            .or_else(|| source.string("GITHUB_ENV"))
            .map(PathBuf::from);

        let settings = Settings {
            ssh,
            pinggy,
            sshj,
            cloudflare,
            backoff,
            state_dir,
            login_user,
            export_file,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the bring-up cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.ssh.public_keys.trim().is_empty() {
            return Err(RelayError::Configuration(format!(
                "{} is required and must contain at least one public key",
                PUBLIC_KEYS_ENV_VAR
            )));
        }
        if self.ssh.port == 0 {
            return Err(RelayError::Configuration(format!(
                "{} must not be 0",
                SSH_PORT_ENV_VAR
            )));
        }
        if !matches!(self.ssh.mode.as_str(), "auto" | "user" | "root") {
            return Err(RelayError::Configuration(format!(
                "{} must be one of auto, user, root (got '{}')",
                SSH_MODE_ENV_VAR, self.ssh.mode
            )));
        }
        let foreground: Vec<String> = self
            .descriptors()
            .iter()
            .filter(|d| d.enabled && d.foreground)
            .map(|d| d.kind.to_string())
            .collect();
        if foreground.len() > 1 {
            return Err(RelayError::Configuration(format!(
                "only one tunnel can run in the foreground (got {})",
                foreground.join(", ")
            )));
        }
        if self.cloudflare.descriptor.enabled && self.cloudflare.origin_cert.is_none() {
            return Err(RelayError::Configuration(format!(
                "Cloudflare tunnel is enabled but {} (or TUNNEL_ORIGIN_CERT) is not set",
                CLOUDFLARE_CERT_ENV_VAR
            )));
        }
        Ok(())
    }

    /// All backend descriptors in reporting order.
    pub fn descriptors(&self) -> [&TunnelDescriptor; 3] {
        [
            &self.pinggy.descriptor,
            &self.sshj.descriptor,
            &self.cloudflare.descriptor,
        ]
    }

    /// Directory holding every backend's log and PID file.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

/// Typed access to a key lookup
struct Source<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Source<'_> {
    /// Value as configured, untrimmed
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    /// Trimmed value; blank counts as unset
    fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parsed value; unparseable values fall back to the default
    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(_) => {
                    warn!("Ignoring invalid value '{}' for {}", raw, key);
                    default
                }
            },
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.string(key) {
            Some(raw) => raw.eq_ignore_ascii_case("true") || raw == "1",
            None => default,
        }
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.parse(key, default))
    }

    fn descriptor(
        &self,
        kind: TunnelKind,
        enabled_by_default: bool,
        default_host: &str,
        default_port: u16,
    ) -> TunnelDescriptor {
        let prefix = kind.variable_prefix();
        TunnelDescriptor {
            kind,
            enabled: self.flag(&format!("{}_ENABLED", prefix), enabled_by_default),
            target_host: self
                .string(&format!("{}_HOST", prefix))
                .unwrap_or_else(|| default_host.to_string()),
            target_port: self.parse(&format!("{}_PORT", prefix), default_port),
            foreground: self.flag(&format!("{}_FOREGROUND", prefix), false),
            timeouts: TunnelTimeouts {
                install: self.secs(&format!("{}_INSTALL_TIMEOUT", prefix), DEFAULT_INSTALL_TIMEOUT_SECS),
                discovery: self.secs(&format!("{}_TIMEOUT", prefix), DEFAULT_DISCOVERY_TIMEOUT_SECS),
            },
        }
    }
}

/// Split a comma/whitespace separated list.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

/// Reduce a name to lowercase alphanumerics and single dashes.
pub fn sanitize_label(raw: &str) -> String {
    let mut label = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
        } else if !label.is_empty() && !label.ends_with('-') {
            label.push('-');
        }
    }
    let label = label.trim_end_matches('-');
    if label.is_empty() {
        "ci-runner".to_string()
    } else {
        label.to_string()
    }
}

fn generate_namespace() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("ci-{}", &id[..12])
}
