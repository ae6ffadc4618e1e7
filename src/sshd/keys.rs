//! Authorized-keys provisioning.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::error::{RelayError, Result};

/// Key types accepted in an authorized-keys blob
pub const KEY_TYPE_PREFIXES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ssh-dss",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Extract the usable key lines from a multi-line blob.
///
/// Blank lines, comments and anything not starting with a known key type are
/// dropped. Kept lines are trimmed but otherwise unchanged.
pub fn parse_public_keys(blob: &str) -> Vec<String> {
    blob.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| {
            let key_type = line.split_whitespace().next().unwrap_or_default();
            KEY_TYPE_PREFIXES.contains(&key_type)
        })
        .map(str::to_string)
        .collect()
}

/// Render keys with an audit comment naming when each was added.
pub fn render_authorized_keys(keys: &[String], added_at: DateTime<Utc>) -> String {
    let stamp = added_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut out = String::new();
    for key in keys {
        out.push_str(&format!("# added by ci-sshd-relay at {}\n", stamp));
        out.push_str(key);
        out.push('\n');
    }
    out
}

/// Write the keys in `blob` to `path` with owner-only permissions.
///
/// Returns the keys written. A blob without a single usable key is a
/// configuration error and leaves `path` untouched.
pub fn write_authorized_keys(blob: &str, path: &Path) -> Result<Vec<String>> {
    let keys = parse_public_keys(blob);
    if keys.is_empty() {
        return Err(RelayError::Configuration(
            "no usable SSH public keys in the configured key blob".to_string(),
        ));
    }

    let skipped = blob
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count()
        - keys.len();
    if skipped > 0 {
        warn!("Ignored {} line(s) without a recognised key type", skipped);
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
        restrict(dir, 0o700)?;
    }

    let mut file = fs::File::create(path)?;
    restrict(path, 0o600)?;
    file.write_all(render_authorized_keys(&keys, Utc::now()).as_bytes())?;
    file.sync_all()?;

    info!("Wrote {} authorized key(s) to {}", keys.len(), path.display());
    Ok(keys)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

// ACLs are applied by the Windows bring-up
#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
