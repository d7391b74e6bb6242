//! Device Commands

use anyhow::Result;
use clap::Subcommand;
use devicefarm_common::DeviceStatus;
use serde::Serialize;

use crate::client::FarmClient;
use crate::generated::Device;
use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// List devices in the pool
    List {
        /// Only devices with this status (available, in_use, terminated, faulty)
        #[arg(short, long)]
        status: Option<String>,

        /// Only devices of this OS (android, ios)
        #[arg(long)]
        os: Option<String>,
    },

    /// Take a device out of rotation
    MarkFaulty {
        /// Device serial or UDID
        device_id: String,
    },
}

/// Device display wrapper for serialization
#[derive(Serialize)]
pub struct DeviceDisplay {
    pub device_id: String,
    pub device_type: String,
    pub device_os: String,
    pub status: String,
}

impl From<Device> for DeviceDisplay {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.device_id,
            device_type: device.device_type,
            device_os: device.device_os,
            status: device.status,
        }
    }
}

impl TableDisplay for DeviceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Device", "Type", "OS", "Status"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.device_id.clone(),
            self.device_type.clone(),
            self.device_os.clone(),
            self.status.clone(),
        ]
    }
}

pub async fn execute(
    cmd: DeviceCommands,
    mut client: FarmClient,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        DeviceCommands::List { status, os } => {
            let status = status.as_deref().map(str::parse::<DeviceStatus>).transpose()?;
            let os = os.as_deref().map(super::parse_os).transpose()?;

            let devices = client.list_devices(status, os).await?;
            let displays: Vec<DeviceDisplay> =
                devices.into_iter().map(DeviceDisplay::from).collect();
            print_list(&displays, format);
        }

        DeviceCommands::MarkFaulty { device_id } => {
            client.mark_faulty(&device_id).await?;
            print_success(&format!("Device {} marked faulty", device_id));
        }
    }

    Ok(())
}
