//! Pool Commands

use anyhow::Result;
use clap::Subcommand;

use crate::client::FarmClient;
use crate::output::{print_message, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum PoolCommands {
    /// Register devices connected to the daemon's host
    Register,

    /// Return released devices to the pool
    Reconcile,
}

pub async fn execute(
    cmd: PoolCommands,
    mut client: FarmClient,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        PoolCommands::Register => {
            let report = client.register_devices().await?;
            if format == OutputFormat::Json {
                println!(
                    "{}",
                    serde_json::json!({ "android": report.android, "ios": report.ios })
                );
                return Ok(());
            }

            if report.android.is_empty() && report.ios.is_empty() {
                print_message("No new devices", format);
            } else {
                print_success(&format!(
                    "Registered {} android and {} ios device(s)",
                    report.android.len(),
                    report.ios.len()
                ));
                for id in report.android.iter().chain(report.ios.iter()) {
                    println!("  {}", id);
                }
            }
        }

        PoolCommands::Reconcile => {
            let reclaimed = client.reconcile().await?;
            print_message(&format!("Reclaimed {} device(s)", reclaimed), format);
        }
    }

    Ok(())
}
