//! Core types for DeviceFarm

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Where a device lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Physical,
    Emulator,
    Cloud,
    Simulator,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Physical => "physical",
            DeviceType::Emulator => "emulator",
            DeviceType::Cloud => "cloud",
            DeviceType::Simulator => "simulator",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "physical" => Ok(DeviceType::Physical),
            "emulator" => Ok(DeviceType::Emulator),
            "cloud" => Ok(DeviceType::Cloud),
            "simulator" => Ok(DeviceType::Simulator),
            _ => Err(Error::UnknownValue {
                kind: "device type",
                value: s.to_string(),
            }),
        }
    }
}

/// Mobile operating system of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceOs {
    #[serde(rename = "android")]
    Android,
    #[serde(rename = "ios")]
    Ios,
    #[serde(rename = "FirefoxOS")]
    FirefoxOs,
}

impl DeviceOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceOs::Android => "android",
            DeviceOs::Ios => "ios",
            DeviceOs::FirefoxOs => "FirefoxOS",
        }
    }
}

impl std::fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceOs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(DeviceOs::Android),
            "ios" => Ok(DeviceOs::Ios),
            "firefoxos" => Ok(DeviceOs::FirefoxOs),
            _ => Err(Error::UnknownValue {
                kind: "mobile os",
                value: s.to_string(),
            }),
        }
    }
}

/// Platforms the host can enumerate devices for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MobilePlatform {
    Android,
    Ios,
}

impl MobilePlatform {
    pub fn device_os(&self) -> DeviceOs {
        match self {
            MobilePlatform::Android => DeviceOs::Android,
            MobilePlatform::Ios => DeviceOs::Ios,
        }
    }
}

impl std::fmt::Display for MobilePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.device_os().fmt(f)
    }
}

/// Pool status of a device.
///
/// `Available -> InUse` on reserve, `InUse -> Terminated` on release,
/// `Terminated -> Available` on reconcile. `Faulty` is only ever set by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    InUse,
    Terminated,
    Faulty,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Available => "available",
            DeviceStatus::InUse => "in_use",
            DeviceStatus::Terminated => "terminated",
            DeviceStatus::Faulty => "faulty",
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::Available
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(DeviceStatus::Available),
            "in_use" => Ok(DeviceStatus::InUse),
            "terminated" => Ok(DeviceStatus::Terminated),
            "faulty" => Ok(DeviceStatus::Faulty),
            _ => Err(Error::UnknownValue {
                kind: "device status",
                value: s.to_string(),
            }),
        }
    }
}

/// One physical or virtual device known to the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_os: DeviceOs,
    pub status: DeviceStatus,
}

impl DeviceRecord {
    /// A freshly discovered device, ready to be reserved
    pub fn available(
        device_id: impl Into<String>,
        device_type: DeviceType,
        device_os: DeviceOs,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            device_os,
            status: DeviceStatus::Available,
        }
    }
}

/// One reservation period for a device.
///
/// `session_id` is persisted as its hyphenated string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub device_id: String,
    pub device_os: DeviceOs,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn open(session_id: Uuid, device_id: impl Into<String>, device_os: DeviceOs) -> Self {
        Self {
            session_id,
            device_id: device_id.into(),
            device_os,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// A device claimed for one test run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub device_id: String,
    pub session_id: Uuid,
}
