//! Concurrent, failure-isolated tunnel start-up.
//!
//! Every available background backend is installed and started at once on the
//! current task; their waits interleave freely. An error or panic in one
//! backend becomes a [`Settlement::Rejected`] for that backend only. Results
//! keep the input order regardless of which backend finished first.
//!
//! There is no retry at this level.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;

use futures::FutureExt;
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::types::{ErrorInfo, HealthStatus, Settlement, SshBringupResult, TunnelKind};

use super::TunnelPlugin;

pub struct TunnelOrchestrator {
    plugins: Vec<Box<dyn TunnelPlugin>>,
}

impl TunnelOrchestrator {
    pub fn new(plugins: Vec<Box<dyn TunnelPlugin>>) -> Self {
        Self { plugins }
    }

    /// Kinds that will be attempted by [`run`](Self::run), in order.
    pub fn planned(&self) -> Vec<TunnelKind> {
        self.plugins
            .iter()
            .filter(|p| p.is_available() && !p.descriptor().foreground)
            .map(|p| p.kind())
            .collect()
    }

    /// Install and start every available background backend concurrently.
    ///
    /// Disabled backends are absent from the result. A foreground backend is
    /// left for [`hand_over`](Self::hand_over).
    pub async fn run(&mut self, ssh: &SshBringupResult, log_dir: &Path) -> Vec<Settlement> {
        let attempts = self
            .plugins
            .iter_mut()
            .filter(|p| p.is_available() && !p.descriptor().foreground)
            .map(|plugin| settle(plugin.as_mut(), ssh, log_dir));

        let settlements = join_all(attempts).await;
        let succeeded = settlements.iter().filter(|s| s.is_fulfilled()).count();
        info!("{} of {} tunnel(s) started", succeeded, settlements.len());
        settlements
    }

    /// Replace the current process with the foreground backend, if any.
    ///
    /// Returns `Ok(())` when no backend is flagged foreground; otherwise only
    /// returns if the hand-over failed.
    pub async fn hand_over(&mut self, ssh: &SshBringupResult, log_dir: &Path) -> Result<()> {
        let Some(plugin) = self
            .plugins
            .iter_mut()
            .find(|p| p.is_available() && p.descriptor().foreground)
        else {
            return Ok(());
        };

        info!("Handing over to the {} tunnel in the foreground", plugin.kind());
        plugin.install().await?;
        plugin.start(ssh, log_dir).await.map(|_| ())
    }

    pub fn health(&self) -> Vec<(TunnelKind, HealthStatus)> {
        self.plugins
            .iter()
            .filter(|p| p.is_available())
            .map(|p| (p.kind(), p.health_check()))
            .collect()
    }

    /// Stop every backend. Returns how many were signalled.
    pub fn stop_all(&mut self) -> usize {
        self.plugins
            .iter_mut()
            .map(|p| p.stop())
            .filter(|&signalled| signalled)
            .count()
    }
}

/// Run one backend to a settlement; never fails, never panics.
async fn settle<P>(plugin: &mut P, ssh: &SshBringupResult, log_dir: &Path) -> Settlement
where
    P: TunnelPlugin + ?Sized,
{
    let kind = plugin.kind();
    let attempt = async {
        plugin.install().await?;
        plugin.start(ssh, log_dir).await
    };

    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(Ok(value)) => Settlement::Fulfilled { value },
        Ok(Err(e)) => {
            let e = match e {
                RelayError::Tunnel { .. } => e,
                other => RelayError::tunnel(kind, other.to_string()),
            };
            warn!("{}", e);
            Settlement::Rejected {
                kind,
                reason: ErrorInfo {
                    kind: e.category().to_string(),
                    message: e.to_string(),
                },
            }
        }
        Err(panic) => {
            let message = format!("{} tunnel panicked: {}", kind, panic_message(panic.as_ref()));
            warn!("{}", message);
            Settlement::Rejected {
                kind,
                reason: ErrorInfo {
                    kind: "panic".to_string(),
                    message,
                },
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
