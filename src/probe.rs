//! Bounded readiness polling.
//!
//! Two probes, both polling at [`PROBE_INTERVAL`] until success or timeout:
//!
//! - [`wait_for_port`]: a local TCP port accepts connections. A raw connect is
//!   tried first; on Linux the kernel's listening-socket table is consulted as
//!   a fallback (covers daemons bound to an address we cannot reach directly).
//! - [`wait_for_log_match`]: a log file's accumulated content matches a
//!   pattern. The whole file is re-read every cycle; it may not exist yet.
//!
//! Neither probe returns an error. A `false`/`None` result means the timeout
//! elapsed.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Fixed polling interval for both probes
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Kernel state code for a listening TCP socket in `/proc/net/tcp`
const TCP_LISTEN_STATE: &str = "0A";

/// Map a listen address to an address a local client can connect to.
///
/// Wildcard binds are probed through loopback.
pub fn probe_host(listen_address: &str) -> &str {
    match listen_address {
        "" | "0.0.0.0" | "*" => "127.0.0.1",
        "::" | "[::]" => "::1",
        other => other,
    }
}

/// Poll until `host:port` accepts a TCP connection or `timeout` elapses.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if port_accepts(host, port).await || port_in_listen_table(port).await {
            debug!("Port {}:{} is accepting connections", host, port);
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("Port {}:{} still closed after {:?}", host, port, timeout);
            return false;
        }
        tokio::time::sleep(PROBE_INTERVAL.min(deadline - now)).await;
    }
}

async fn port_accepts(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_INTERVAL, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(target_os = "linux")]
async fn port_in_listen_table(port: u16) -> bool {
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = tokio::fs::read_to_string(table).await
            && parse_listening_ports(&content).contains(&port)
        {
            return true;
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
async fn port_in_listen_table(_port: u16) -> bool {
    false
}

/// Extract the local ports of listening sockets from a `/proc/net/tcp` dump.
pub fn parse_listening_ports(content: &str) -> Vec<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN_STATE {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

/// Poll `path` until its content matches `pattern` or `timeout` elapses.
///
/// Returns the first matched substring. Non-UTF-8 bytes are replaced rather
/// than treated as an error.
pub async fn wait_for_log_match(path: &Path, pattern: &Regex, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Ok(bytes) = tokio::fs::read(path).await {
            let content = String::from_utf8_lossy(&bytes);
            if let Some(found) = pattern.find(&content) {
                debug!("Matched {:?} in {}", found.as_str(), path.display());
                return Some(found.as_str().to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("No match for {} in {} after {:?}", pattern, path.display(), timeout);
            return None;
        }
        tokio::time::sleep(PROBE_INTERVAL.min(deadline - now)).await;
    }
}
