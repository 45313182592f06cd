//! Fleetdeck Daemon
//!
//! Watches a home-lab fleet, launches remote-desktop sessions, and
//! positions their windows on a tiling desktop.

use clap::Parser;
use fleetdeck_common::{Prober, SystemRunner};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod hypr;
mod logbus;
mod presets;
mod registry;
mod server;
mod session;
mod status;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "fleetdeckd")]
#[command(about = "Fleetdeck daemon - fleet status, sessions, and window placement")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Log fan-out for WebSocket clients sits next to the fmt layer
    let (log_tx, log_layer) = logbus::channel();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_layer)
        .with(filter)
        .init();

    info!("Fleetdeck daemon v{}", fleetdeck_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(|| fleetdeck_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    tokio::fs::create_dir_all(&config.store_path).await?;

    let runner: Arc<dyn fleetdeck_common::CommandRunner> = Arc::new(SystemRunner);
    let registry = Arc::new(registry::FleetRegistry::load(config.fleet_path()));
    let presets = Arc::new(presets::PresetStore::load(config.presets_path()));
    let prober = Arc::new(Prober::new(runner.clone()).with_timeouts(
        Duration::from_secs(config.probe.ping_timeout_secs),
        Duration::from_secs(config.probe.port_timeout_secs),
    ));
    let bridge = Arc::new(hypr::WmBridge::new(runner.clone(), &config.wm));

    let timing = session::SessionTiming {
        settle: Duration::from_secs(config.session.settle_secs),
        kill_grace: Duration::from_secs(config.session.kill_grace_secs),
    };
    let sessions = session::SessionManager::new(
        Box::new(session::DefaultLauncher),
        Some(bridge.clone()),
        timing,
    );

    let aggregator = Arc::new(status::StatusAggregator::new(
        registry.clone(),
        prober.clone(),
        bridge.clone(),
        sessions.clone(),
        runner.clone(),
        config.session.unit_prefix.clone(),
    ));

    // Status events fan out to every WebSocket client
    let (event_tx, _) = broadcast::channel(64);

    let broadcaster_handle = tokio::spawn(status::run_broadcaster(
        aggregator.clone(),
        event_tx.clone(),
    ));

    let reap_interval = Duration::from_secs(config.session.reap_interval_secs);
    let reaper_handle = tokio::spawn(sessions.clone().run_reaper(reap_interval));

    // Expired cache entries are dropped by a periodic sweep, not on read
    tokio::spawn(aggregator.clone().run_sweeper(Duration::from_secs(60)));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));
    let api = server::ApiServer::new(Arc::new(server::AppState {
        registry,
        presets,
        bridge,
        sessions,
        aggregator,
        prober,
        runner,
        events: event_tx,
        logs: log_tx,
        config,
    }));
    let server_handle = tokio::spawn(api.serve(addr));

    info!("Dashboard API available at http://{}", addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("API server error: {}", e),
                Err(e) => tracing::error!("API server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = broadcaster_handle => {
            if let Err(e) = result {
                tracing::error!("Status broadcaster error: {}", e);
            }
        }
        result = reaper_handle => {
            if let Err(e) = result {
                tracing::error!("Session reaper error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
