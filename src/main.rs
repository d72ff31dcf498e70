use std::path::PathBuf;
use switchyard::action::Extensions;
use switchyard::config::Config;
use switchyard::service::Service;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("switchyard.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let service = Service::start(config, Extensions::default()).await.map_err(|e| {
        error!(error = %format!("{:#}", e), "Failed to start service");
        e
    })?;

    for addr in service.http_addrs() {
        info!(addr = %addr, "HTTP server ready");
    }
    for addr in service.tcp_addrs() {
        info!(addr = %addr, "TCP relay ready");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    service.stop().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        "{} v{} - {} HTTP server(s), {} TCP relay(s), {} load balancer(s)",
        PKG_NAME,
        VERSION,
        config.http_servers.len(),
        config.tcp_servers.len(),
        config.load_balancers.len()
    );
}
