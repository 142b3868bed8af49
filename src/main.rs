//! topograph - per-host network topology agent
//!
//! The agent runs on each host and:
//! - Observes kernel links, network namespaces, OVS tables and Docker
//!   containers through dedicated probes
//! - Reconciles the observations into a typed topology graph
//! - Publishes the graph as a snapshot plus live mutation stream over a
//!   websocket endpoint

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use topograph::config::Config;
use topograph::graph::backend::backend_from_name;
use topograph::graph::Graph;
use topograph::probes::ProbeBundle;
use topograph::ws;

#[derive(Parser, Debug)]
#[command(name = "topograph", version, about = "Network topology agent")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the websocket listen port
    #[arg(short, long)]
    listen: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("topograph v{} starting...", topograph::VERSION);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let hostname = config.hostname();
    let backend = backend_from_name(&config.backend)?;
    let graph = Arc::new(Graph::new(backend, &hostname));

    let probes = ProbeBundle::from_config(graph.clone(), &config)?;
    probes.start().await;

    let publisher_graph = graph.clone();
    let publisher_host = hostname.clone();
    let listen = config.listen;
    let pong_timeout = Duration::from_secs(config.ws_pong_timeout);
    tokio::spawn(async move {
        if let Err(e) = ws::serve(publisher_graph, publisher_host, listen, pong_timeout).await {
            error!("Topology publisher failed: {}", e);
        }
    });

    info!(
        "Agent running as host \"{}\", publisher on port {}. Press Ctrl+C to exit.",
        hostname, listen
    );

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }

    probes.stop().await;

    info!("topograph stopped");
    Ok(())
}
