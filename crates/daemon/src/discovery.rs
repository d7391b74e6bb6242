//! Device discovery
//!
//! Enumerates devices attached to (or emulated on) this host by shelling out
//! to the platform tooling: `adb` for Android, `idevice_id` and
//! `xcrun simctl` for iOS.

use crate::config::DiscoveryConfig;
use async_trait::async_trait;
use devicefarm_common::{DeviceType, Error, MobilePlatform, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Source of connected device identifiers
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Whether this host can enumerate devices for `platform`
    fn supports(&self, platform: MobilePlatform) -> bool;

    /// Identifiers (serials / UDIDs) of devices of the given kind
    async fn fetch_connected_device_ids(
        &self,
        platform: MobilePlatform,
        device_type: DeviceType,
    ) -> Result<Vec<String>>;
}

/// Discovery backed by the host's platform command-line tools
pub struct HostDiscovery {
    config: DiscoveryConfig,
}

impl HostDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "Running discovery command");

        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Discovery(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Discovery(format!(
                "{} exited with {:?}: {}",
                program,
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn android_ids(&self, device_type: DeviceType) -> Result<Vec<String>> {
        let ids = parse_adb_devices(&self.run(&self.config.adb_path, &["devices"]).await?);

        match device_type {
            DeviceType::Physical => {
                if ids.is_empty() {
                    return Err(Error::Discovery(
                        "No physical device(s) connected/available at the moment!".to_string(),
                    ));
                }
                Ok(ids.into_iter().filter(|id| !is_android_emulator(id)).collect())
            }
            DeviceType::Emulator => Ok(ids
                .into_iter()
                .filter(|id| is_android_emulator(id))
                .collect()),
            other => Err(Error::Unsupported(format!(
                "android discovery supports only physical and emulator devices, not {}",
                other
            ))),
        }
    }

    async fn ios_ids(&self, device_type: DeviceType) -> Result<Vec<String>> {
        match device_type {
            DeviceType::Physical => Ok(parse_idevice_ids(
                &self.run(&self.config.idevice_id_path, &["-l"]).await?,
            )),
            DeviceType::Simulator => Ok(parse_simctl_list(
                &self.run(&self.config.xcrun_path, &["simctl", "list"]).await?,
            )),
            other => Err(Error::Unsupported(format!(
                "ios discovery supports only physical and simulator devices, not {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl DeviceDiscovery for HostDiscovery {
    fn supports(&self, platform: MobilePlatform) -> bool {
        match platform {
            MobilePlatform::Android => true,
            MobilePlatform::Ios => self.config.ios_enabled(),
        }
    }

    async fn fetch_connected_device_ids(
        &self,
        platform: MobilePlatform,
        device_type: DeviceType,
    ) -> Result<Vec<String>> {
        match platform {
            MobilePlatform::Android => self.android_ids(device_type).await,
            MobilePlatform::Ios => self.ios_ids(device_type).await,
        }
    }
}

fn is_android_emulator(id: &str) -> bool {
    id.contains("emulator")
}

/// Serials from `adb devices` output: skip the header, blank lines and
/// daemon status lines (`* daemon started ...`).
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .filter(|line| !line.starts_with("List of devices"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// UDIDs from `idevice_id -l`, one per line
pub fn parse_idevice_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Simulator UDIDs from `xcrun simctl list`. Only parenthesised tokens that
/// parse as UUIDs count; runtime versions and states are skipped.
pub fn parse_simctl_list(output: &str) -> Vec<String> {
    output
        .lines()
        .flat_map(|line| line.split('(').skip(1))
        .filter_map(|chunk| chunk.split(')').next())
        .map(str::trim)
        .filter(|token| Uuid::parse_str(token).is_ok())
        .map(str::to_string)
        .collect()
}
