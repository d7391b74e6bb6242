//! Daemon configuration

use devicefarm_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// gRPC listen address
    pub grpc_listen: String,

    /// Document store configuration
    pub store: StoreConfig,

    /// Task queue configuration
    pub tasks: TaskConfig,

    /// Periodic job configuration
    pub schedule: ScheduleConfig,

    /// Device discovery configuration
    pub discovery: DiscoveryConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            grpc_listen: "127.0.0.1:50051".to_string(),
            store: StoreConfig::default(),
            tasks: TaskConfig::default(),
            schedule: ScheduleConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Collection holding one document per device
    pub device_collection: String,

    /// Collection holding one document per reservation
    pub session_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: devicefarm_common::default_db_path(),
            device_collection: "device_stat_collection".to_string(),
            session_collection: "device_session_collection".to_string(),
        }
    }
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Number of workers pulling from the queue
    pub worker_concurrency: usize,

    /// Extra attempts for a task failing with a retryable error
    pub max_retries: u32,

    /// Pause between attempts
    pub retry_delay_secs: u64,

    /// Pending tasks accepted before submitters wait
    pub queue_capacity: usize,

    /// How long an in-process caller waits on a task by default
    pub result_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 1,
            max_retries: 1,
            retry_delay_secs: 3,
            queue_capacity: 256,
            result_timeout_secs: 10,
        }
    }
}

impl TaskConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }
}

/// Periodic job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Run the periodic jobs at all
    pub enabled: bool,

    /// Period of the TERMINATED -> AVAILABLE sweep
    pub reconcile_every_secs: u64,

    /// Period of the device roster refresh
    pub register_every_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconcile_every_secs: 120,
            register_every_secs: 180,
        }
    }
}

/// Device discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Path to the Android debug bridge
    pub adb_path: String,

    /// Path to libimobiledevice's `idevice_id`
    pub idevice_id_path: String,

    /// Path to Xcode's `xcrun`
    pub xcrun_path: String,

    /// Force iOS discovery on or off; defaults to whether the host is macOS
    pub ios: Option<bool>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            idevice_id_path: "idevice_id".to_string(),
            xcrun_path: "xcrun".to_string(),
            ios: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn ios_enabled(&self) -> bool {
        self.ios.unwrap_or(cfg!(target_os = "macos"))
    }
}

impl FarmConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Look up a single value by section and key
    pub fn get(&self, section: &str, key: &str) -> Result<toml::Value> {
        let not_found = || Error::ConfigKeyNotFound {
            section: section.to_string(),
            key: key.to_string(),
        };

        let root = toml::Value::try_from(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        root.get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .ok_or_else(not_found)
    }

    /// Look up a string value by section and key
    pub fn get_str(&self, section: &str, key: &str) -> Result<String> {
        match self.get(section, key)? {
            toml::Value::String(s) => Ok(s),
            other => Err(Error::InvalidConfig(format!(
                "{}.{} should be a string, found {}",
                section,
                key,
                other.type_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FarmConfig::default();
        assert_eq!(config.tasks.max_retries, 1);
        assert_eq!(config.tasks.retry_delay(), Duration::from_secs(3));
        assert_eq!(config.tasks.result_timeout(), Duration::from_secs(10));
        assert_eq!(config.schedule.reconcile_every_secs, 120);
        assert_eq!(config.schedule.register_every_secs, 180);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: FarmConfig = toml::from_str(
            r#"
            grpc_listen = "0.0.0.0:6000"

            [store]
            device_collection = "devices"

            [schedule]
            reconcile_every_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.grpc_listen, "0.0.0.0:6000");
        assert_eq!(config.store.device_collection, "devices");
        assert_eq!(config.store.session_collection, "device_session_collection");
        assert_eq!(config.schedule.reconcile_every_secs, 30);
        assert_eq!(config.schedule.register_every_secs, 180);
        assert_eq!(config.tasks.worker_concurrency, 1);
    }

    #[test]
    fn test_section_key_lookup() {
        let config = FarmConfig::default();

        assert_eq!(
            config.get_str("store", "session_collection").unwrap(),
            "device_session_collection"
        );
        assert_eq!(
            config.get("tasks", "max_retries").unwrap(),
            toml::Value::Integer(1)
        );

        assert!(matches!(
            config.get("store", "nope"),
            Err(Error::ConfigKeyNotFound { .. })
        ));
        assert!(matches!(
            config.get("mongodb", "connection_string"),
            Err(Error::ConfigKeyNotFound { .. })
        ));
        assert!(matches!(
            config.get_str("tasks", "max_retries"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = FarmConfig::default();
        config.tasks.worker_concurrency = 4;
        config.discovery.ios = Some(false);
        config.save(&path).unwrap();

        let loaded = FarmConfig::load(&path).unwrap();
        assert_eq!(loaded.tasks.worker_concurrency, 4);
        assert!(!loaded.discovery.ios_enabled());

        let missing = FarmConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(missing.grpc_listen, "127.0.0.1:50051");
    }
}
