//! DeviceFarm CLI - Main Entry Point

use std::time::Duration;

use clap::{Parser, Subcommand};
use devicefarm_cli::client::{self, FarmClient};
use devicefarm_cli::commands::{device, pool, session};
use devicefarm_cli::output::{self, print_error, print_warning};

/// DeviceFarm CLI - mobile device pool manager
#[derive(Parser)]
#[command(name = "devicefarm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon address
    #[arg(long, default_value = "http://127.0.0.1:50051", global = true, env = "DEVICEFARM_ADDR")]
    daemon_addr: String,

    /// Seconds to wait for the daemon before giving up
    #[arg(long, default_value_t = client::DEFAULT_TIMEOUT.as_secs(), global = true)]
    timeout: u64,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage devices
    #[command(subcommand)]
    Device(device::DeviceCommands),

    /// Reserve and release devices
    #[command(subcommand)]
    Session(session::SessionCommands),

    /// Pool maintenance
    #[command(subcommand)]
    Pool(pool::PoolCommands),

    /// Check daemon status
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    if let Commands::Version = cli.command {
        println!("DeviceFarm CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let timeout = Duration::from_secs(cli.timeout);
    let client = FarmClient::connect(&cli.daemon_addr)
        .await
        .map(|c| c.with_timeout(timeout));

    let result = match cli.command {
        Commands::Device(cmd) => device::execute(cmd, client?, cli.format).await,
        Commands::Session(cmd) => session::execute(cmd, client?, cli.format).await,
        Commands::Pool(cmd) => pool::execute(cmd, client?, cli.format).await,
        Commands::Status => {
            match client {
                Ok(mut c) => match c.health().await {
                    Ok(health) if health.healthy => {
                        println!(
                            "✅ Daemon v{} is running at {} (up {}s)",
                            health.version, cli.daemon_addr, health.uptime_seconds
                        );
                    }
                    Ok(_) => {
                        println!(
                            "❌ Daemon at {} reports its store is unreachable",
                            cli.daemon_addr
                        );
                        std::process::exit(1);
                    }
                    Err(e) => {
                        println!("❌ Daemon is not responding at {}: {}", cli.daemon_addr, e);
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    println!("❌ Cannot connect to daemon: {}", e);
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Version => Ok(()),
    };

    if let Err(e) = result {
        match e.downcast_ref::<client::ClientError>() {
            Some(client_err) if client_err.is_timeout() => {
                print_warning(&format!("{} (the daemon may still finish the task)", client_err));
            }
            _ => print_error(&e.to_string()),
        }
        std::process::exit(1);
    }

    Ok(())
}
