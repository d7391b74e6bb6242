//! Farm context: the document store plus resolved collection names
//!
//! Constructed once at process start and cloned into every component that
//! touches device or session documents.

use crate::config::FarmConfig;
use devicefarm_common::{
    db::{Database, Filter, Set},
    types::*,
    Result,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Collection names the farm reads and writes
#[derive(Debug, Clone)]
pub struct Collections {
    pub devices: String,
    pub sessions: String,
}

impl Collections {
    /// Resolve collection names through the configuration lookup
    pub fn resolve(config: &FarmConfig) -> Result<Self> {
        Ok(Self {
            devices: config.get_str("store", "device_collection")?,
            sessions: config.get_str("store", "session_collection")?,
        })
    }
}

/// Shared handle on persisted device pool state
#[derive(Clone)]
pub struct FarmState {
    db: Database,
    collections: Collections,
}

impl FarmState {
    /// Open the configured store and resolve collection names
    pub fn connect(config: &FarmConfig) -> Result<Self> {
        let collections = Collections::resolve(config)?;
        let db = Database::open(&config.store.path)?;
        db.ping()?;

        info!(
            devices = %collections.devices,
            sessions = %collections.sessions,
            "Connected to device store"
        );

        Ok(Self { db, collections })
    }

    /// Build state over an already-open database
    #[cfg(test)]
    pub fn with_database(db: Database, collections: Collections) -> Self {
        Self { db, collections }
    }

    /// Release this handle on the store. The connection closes once every
    /// clone has been dropped.
    pub fn disconnect(self) {
        info!("Disconnecting from device store");
        drop(self);
    }

    #[cfg(test)]
    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn ping(&self) -> Result<()> {
        self.db.ping()
    }

    // ========================================================================
    // Device documents
    // ========================================================================

    /// Devices, optionally narrowed by status and OS
    pub fn list_devices(
        &self,
        status: Option<DeviceStatus>,
        os: Option<DeviceOs>,
    ) -> Result<Vec<DeviceRecord>> {
        let mut filter = Filter::new();
        if let Some(status) = status {
            filter = filter.eq("status", status.as_str());
        }
        if let Some(os) = os {
            filter = filter.eq("device_os", os.as_str());
        }
        self.db.find_many(&self.collections.devices, &filter)
    }

    #[cfg(test)]
    pub fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        self.db
            .find_one(&self.collections.devices, &Filter::new().eq("device_id", device_id))
    }

    pub fn device_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list_devices(None, None)?
            .into_iter()
            .map(|d| d.device_id)
            .collect())
    }

    pub fn insert_devices(&self, devices: &[DeviceRecord]) -> Result<usize> {
        self.db.insert_many(&self.collections.devices, devices)
    }

    /// Overwrite a device's status regardless of its current one
    pub fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<bool> {
        let changed = self.db.update_one(
            &self.collections.devices,
            &Filter::new().eq("device_id", device_id),
            &Set::new().field("status", status.as_str()),
        )?;
        debug!(device_id, %status, changed, "Set device status");
        Ok(changed > 0)
    }

    /// Move a device from `from` to `to` only if it is still in `from`.
    /// Returns false when another writer got there first.
    pub fn transition_device(
        &self,
        device_id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool> {
        let changed = self.db.update_one(
            &self.collections.devices,
            &Filter::new()
                .eq("device_id", device_id)
                .eq("status", from.as_str()),
            &Set::new().field("status", to.as_str()),
        )?;
        debug!(device_id, %from, %to, changed, "Transition device");
        Ok(changed > 0)
    }

    // ========================================================================
    // Session documents
    // ========================================================================

    pub fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.db.insert_one(&self.collections.sessions, session)
    }

    #[cfg(test)]
    pub fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
        self.db.find_one(
            &self.collections.sessions,
            &Filter::new().eq("session_id", session_id.to_string()),
        )
    }

    pub fn list_sessions(&self, open_only: bool) -> Result<Vec<SessionRecord>> {
        let mut filter = Filter::new();
        if open_only {
            filter = filter.eq("end_time", serde_json::Value::Null);
        }
        self.db.find_many(&self.collections.sessions, &filter)
    }

    /// Stamp a session's end time, overwriting any earlier one
    pub fn close_session(&self, session_id: Uuid, end_time: DateTime<Utc>) -> Result<bool> {
        let changed = self.db.update_one(
            &self.collections.sessions,
            &Filter::new().eq("session_id", session_id.to_string()),
            &Set::new().field("end_time", serde_json::to_value(end_time)?),
        )?;
        Ok(changed > 0)
    }
}
