//! Fleetstore Agent - storage node
//!
//! Keeps blocks as files in a data directory and answers the node protocol
//! on every link the control plane opens.

mod store;

use anyhow::{Context, Result};
use clap::Parser;
use fleetstore_common::config::FabricConfig;
use fleetstore_fabric::serve_listener;
use std::sync::Arc;
use store::BlockDir;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetstore-agent")]
#[command(about = "Fleetstore storage agent")]
#[command(version)]
struct Args {
    /// Listen address for fabric links
    #[arg(short, long, env = "FLEETSTORE_AGENT_LISTEN", default_value = "0.0.0.0:7400")]
    listen: String,

    /// Directory holding block files
    #[arg(short, long, env = "FLEETSTORE_DATA_DIR", default_value = "./fleetstore-data")]
    data_dir: String,

    /// Largest payload per frame; must match the control plane
    #[arg(long)]
    max_frame_payload: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Fleetstore agent");
    let blocks = BlockDir::open(&args.data_dir)
        .await
        .with_context(|| format!("opening data directory {}", args.data_dir))?;
    info!(data_dir = %args.data_dir, "block directory ready");

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let max_frame_payload = args
        .max_frame_payload
        .unwrap_or_else(|| FabricConfig::default().max_frame_payload);
    info!(listen = %args.listen, max_frame_payload, "accepting links");

    tokio::select! {
        result = serve_listener(listener, Arc::new(blocks), max_frame_payload) => {
            if let Err(e) = &result {
                error!(error = %e, "listener failed");
            }
            result.context("serving links")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("Shutdown requested");
        }
    }
    info!("Fleetstore agent stopped");
    Ok(())
}
