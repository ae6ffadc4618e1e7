#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use ci_sshd_relay::config::Settings;
use ci_sshd_relay::process::{ProcessRegistry, spawn_shutdown_listener};
use ci_sshd_relay::report::{RunReport, write_env_file};
use ci_sshd_relay::sshd::SshBringup;
use ci_sshd_relay::tunnel::{TunnelOrchestrator, build_plugins};
use dotenv::dotenv;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let registry = ProcessRegistry::new();
    let shutdown = spawn_shutdown_listener(registry.clone());

    let mut bringup = SshBringup::new(&settings);
    let ssh = match bringup.run().await {
        Ok(ssh) => ssh,
        Err(e) => {
            error!("SSH daemon bring-up failed ({}): {}", e.category(), e);
            std::process::exit(1);
        }
    };
    info!("SSH daemon ready on port {} ({} mode)", ssh.port, ssh.mode);

    let log_dir = settings.log_dir();
    let mut orchestrator = TunnelOrchestrator::new(build_plugins(&settings, &registry));
    let settlements = orchestrator.run(&ssh, &log_dir).await;

    let report = RunReport::new(ssh.clone(), settlements);
    report.log_summary();

    if let Some(path) = &settings.export_file
        && let Err(e) = write_env_file(path, &report.exports())
    {
        warn!("Could not export variables to {}: {}", path.display(), e);
    }

    // Only returns when no backend runs in the foreground or exec failed
    if let Err(e) = orchestrator.hand_over(&ssh, &log_dir).await {
        error!("Foreground tunnel failed: {}", e);
        std::process::exit(1);
    }

    // Detached backends keep running after we exit
    shutdown.cancel();
    info!("{} tunnel(s) running in the background", registry.len());
}
