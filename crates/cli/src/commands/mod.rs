//! CLI Commands

pub mod device;
pub mod pool;
pub mod session;

use anyhow::Result;
use devicefarm_common::DeviceOs;

/// Parse an OS name from the command line
pub(crate) fn parse_os(raw: &str) -> Result<DeviceOs> {
    Ok(raw.parse::<DeviceOs>()?)
}
