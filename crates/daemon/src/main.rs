//! DeviceFarm Daemon
//!
//! Owns the device pool: runs the task workers, the periodic jobs and the
//! gRPC endpoint clients reserve devices through.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod discovery;
mod farm;
mod grpc;
mod scheduler;
mod state;
mod tasks;

pub mod generated {
    #![allow(clippy::all)]
    include!("generated/devicefarm.v1.rs");
}

use config::FarmConfig;

#[derive(Parser)]
#[command(name = "devicefarmd")]
#[command(about = "DeviceFarm daemon - mobile device pool manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overrides [store].path
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// gRPC listen address, overrides grpc_listen
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Do not run the periodic jobs
    #[arg(long)]
    no_schedule: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("DeviceFarm daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.unwrap_or_else(devicefarm_common::default_config_path);
    let mut config = FarmConfig::load(&config_path)?;
    if !config_path.exists() {
        config.save(&config_path)?;
        info!("Wrote default configuration to {:?}", config_path);
    }
    if let Some(store) = cli.store {
        config.store.path = store;
    }
    if let Some(listen) = cli.listen {
        config.grpc_listen = listen;
    }
    if cli.no_schedule {
        config.schedule.enabled = false;
    }

    let state = state::FarmState::connect(&config)?;
    let discovery = Arc::new(discovery::HostDiscovery::new(config.discovery.clone()));
    let farm = Arc::new(farm::DeviceFarm::new(state.clone(), discovery));

    let shutdown = CancellationToken::new();
    let (queue, workers) =
        tasks::TaskQueue::start(farm.clone(), &config.tasks, shutdown.clone());
    info!(workers = workers.len(), "Task workers started");

    let schedule_handles = if config.schedule.enabled {
        let scheduler = scheduler::Scheduler::new(queue.clone(), &config.schedule);
        for entry in scheduler.entries() {
            info!(entry = entry.name, every = ?entry.every, "Scheduled periodic job");
        }
        scheduler.spawn(shutdown.clone())
    } else {
        warn!("Periodic jobs disabled");
        Vec::new()
    };

    let mut grpc_handle = tokio::spawn(grpc::serve(
        config.grpc_listen.clone(),
        queue,
        farm,
        config.tasks.result_timeout(),
        shutdown.clone(),
    ));

    info!("Daemon started on {}", config.grpc_listen);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut grpc_handle => {
            match result {
                Ok(Err(e)) => error!("gRPC server error: {}", e),
                Err(e) => error!("gRPC server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    shutdown.cancel();
    for handle in schedule_handles {
        let _ = handle.await;
    }
    workers.join().await;
    if !grpc_handle.is_finished() {
        let _ = grpc_handle.await;
    }
    state.disconnect();

    info!("Daemon shutdown complete");
    Ok(())
}
