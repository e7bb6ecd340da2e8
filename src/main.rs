// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Configuration structs loaded from JSON
// - schema:     Strongly typed game server messages
// - util:       Timing constants and small helpers
// - metrics:    Metrics sink contract, in-process registry, self-metrics
// - exporter:   Console exporter driving the export ticks
// - rpc:        Game server RPC contract and WebSocket transport
// - session:    Session id tracking per server
// - server:     Per-server cohort orchestration
// - collectors: Collector registry and the four collectors
//
mod collectors;
mod config;
mod exporter;
mod metrics;
mod rpc;
mod schema;
mod server;
mod session;
mod util;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use log::{error, info};
use rustls::crypto::{CryptoProvider, ring};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use config::Config;
use exporter::ConsoleExporter;
use metrics::{MetricsSink, Registry};
use rpc::ws::WsEndpoint;
use server::ServerMonitor;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "TELEMETRY_BRIDGE_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the rustls crypto backend
// - Load and validate configuration
// - Start the exporter and one monitor per game server
// - Shut everything down on Ctrl-C
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // rustls >= 0.23 requires an explicit CryptoProvider, installed
    // once before the first `wss://` connection.
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    info!(
        "Starting {} for {} game server(s)",
        config.application.name,
        config.game_servers.len()
    );

    let shutdown = CancellationToken::new();

    let registry = Registry::new();
    let exporter = ConsoleExporter::new(
        registry.clone(),
        Duration::from_secs(config.export.interval_secs),
        config.export.console,
    );
    let exporter_task = tokio::spawn(exporter.run(shutdown.clone()));

    // --------------------------------------------------------
    // One RPC connection and one monitor per game server
    // --------------------------------------------------------
    let sink: Arc<dyn MetricsSink> = Arc::new(registry);
    let mut servers = JoinSet::new();

    for server in &config.game_servers {
        let url = server.rpc.url();
        info!("[{}] Connecting to {} at {url}", server.short_name, server.name);

        let endpoint = Arc::new(WsEndpoint::connect(
            server.short_name.clone(),
            url,
            config.log_frames(),
            shutdown.clone(),
        ));
        let monitor = ServerMonitor::new(&server.short_name, endpoint, sink.clone());
        servers.spawn(monitor.run(shutdown.clone()));
    }

    // --------------------------------------------------------
    // Run until Ctrl-C or a fatal monitor error
    // --------------------------------------------------------
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            signal.context("failed to listen for shutdown signal")
        }
        Some(joined) = servers.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("server monitor stopped")),
            Err(e) => Err(anyhow::Error::new(e).context("server monitor panicked")),
        },
    };

    shutdown.cancel();

    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server monitor stopped: {e}"),
            Err(e) => error!("Server monitor panicked: {e}"),
        }
    }
    exporter_task.await.context("exporter task failed")?;

    info!("Stopped");
    outcome
}
