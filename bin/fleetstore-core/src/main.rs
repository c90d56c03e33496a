//! Fleetstore Core - control plane daemon
//!
//! Connects the metadata store, builds the fabric and the engine, mirrors
//! the fleet from the store and runs the background loops until ctrl-c.
//! The process exits with an error when the store stays unreachable past
//! its tolerated window, so a supervisor can restart it.

use anyhow::{Context, Result, bail};
use clap::Parser;
use fleetstore_common::FleetConfig;
use fleetstore_engine::{BackgroundTasks, Engine};
use fleetstore_fabric::Fabric;
use fleetstore_meta_store::{MetaClient, PlacementRecords};
use fleetstore_usage::UsageStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetstore-core")]
#[command(about = "Fleetstore control plane")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/fleetstore/core.toml")]
    config: String,

    /// Metadata store location (redb file path or `memory:`)
    #[arg(long, env = "FLEETSTORE_META_PATH")]
    meta_path: Option<String>,

    /// Rendezvous endpoint for NAT-traversed links
    #[arg(long, env = "FLEETSTORE_RENDEZVOUS")]
    rendezvous: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Read the config file, if present, and apply command line overrides
fn load_config(args: &Args) -> Result<FleetConfig> {
    let mut config: FleetConfig = if Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config))?
    } else {
        FleetConfig::default()
    };

    if let Some(path) = &args.meta_path {
        config.meta.url.clone_from(path);
    }
    if let Some(rendezvous) = &args.rendezvous {
        config.fabric.rendezvous_address.clone_from(rendezvous);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging.level, args.log_json);

    info!("Starting Fleetstore core");
    info!(config = %args.config, meta = %config.meta.url, "configuration loaded");

    let client = MetaClient::new(config.meta.clone());
    let records = PlacementRecords::register(client.clone()).await?;
    let usage = UsageStore::register(client.clone(), &config.usage).await?;
    client.connect().await?;

    let fabric = Arc::new(Fabric::new(config.fabric.clone()));
    let engine = Arc::new(Engine::new(config.engine.clone(), records, Arc::clone(&fabric)).with_usage(usage));
    engine.load().await.context("loading fleet topology")?;

    let sweeper = fabric.spawn_stale_sweeper();
    let tasks = BackgroundTasks::spawn(&engine);
    info!(
        direct = config.fabric.use_direct,
        nat = !config.fabric.rendezvous_address.is_empty() && config.fabric.use_nat_traversal,
        "Fleetstore core running"
    );

    let fatal = tokio::select! {
        () = client.wait_fatal() => true,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("Shutdown requested");
            false
        }
    };

    tasks.shutdown().await;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    fabric.shutdown();
    client.disconnect();

    if fatal {
        error!(
            max_wait_ms = config.meta.connect_max_wait_ms,
            "metadata store unreachable for too long, exiting"
        );
        bail!("metadata store lost");
    }
    info!("Fleetstore core stopped");
    Ok(())
}
