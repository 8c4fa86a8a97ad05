use anyhow::Context;
use clap::Parser;
use recira::api::{self, AppState, OverlayFabric};
use recira::{
    CommandRunner, ControllerConfig, DhcpManager, HostRegistry, NetworkManager, ShellExecutor,
    TunnelManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Parser)]
#[command(name = "recira")]
#[command(about = "Centralized control plane for OVS VXLAN overlay networks")]
#[command(version)]
struct Cli {
    /// Path to the controller configuration file
    #[arg(short, long, default_value = "recira.toml")]
    config: PathBuf,

    /// Override the HTTP listen address (e.g. 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = ControllerConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let runner: Arc<dyn CommandRunner> =
        Arc::new(ShellExecutor::new(config.connect_timeout_secs));
    let command_timeout = Duration::from_secs(config.command_timeout_secs);
    let install_timeout = Duration::from_secs(config.install_timeout_secs);

    let mut registry =
        HostRegistry::new(config.hosts_file.clone(), runner.clone(), command_timeout);
    registry
        .load_and_reconnect()
        .await
        .context("reloading host registry")?;
    if let Err(err) = registry.discover_localhost().await {
        warn!(error = %err, "local discovery failed; continuing without a local datapath");
    }

    // Adopt tunnels that exist on the datapaths but not in our records,
    // before any VNI allocation can collide with them.
    let mut tunnels = TunnelManager::new(runner.clone(), command_timeout);
    tunnels.discover(&registry).await;

    let mut networks = NetworkManager::new(config.networks_file.clone());
    networks.load().context("loading networks")?;

    let mut dhcp = DhcpManager::new(
        config.dhcp_file.clone(),
        runner.clone(),
        command_timeout,
        install_timeout,
    );
    dhcp.load().context("loading DHCP state")?;

    let state = Arc::new(AppState {
        hosts: Mutex::new(registry),
        fabric: Mutex::new(OverlayFabric { tunnels, networks }),
        dhcp: Mutex::new(dhcp),
        runner,
        config,
        started_at: Instant::now(),
    });

    api::serve(state).await.context("HTTP server failed")?;
    Ok(())
}
