//! Device farming operations
//!
//! The four units of work that move devices through the pool:
//! registration of newly attached devices, reservation, release, and the
//! reconcile sweep that returns released devices to the pool.

use crate::discovery::DeviceDiscovery;
use crate::state::FarmState;
use chrono::Utc;
use devicefarm_common::{types::*, Error, Result};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How many times the pool is re-read after every candidate was claimed by
/// a concurrent reservation.
const MAX_RESERVE_ROUNDS: usize = 3;

/// Devices inserted by one registration pass, per platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    pub android: Vec<String>,
    pub ios: Vec<String>,
}

impl RegistrationReport {
    pub fn total(&self) -> usize {
        self.android.len() + self.ios.len()
    }
}

/// Device pool operations over the shared farm state
pub struct DeviceFarm {
    state: FarmState,
    discovery: Arc<dyn DeviceDiscovery>,
}

impl DeviceFarm {
    pub fn new(state: FarmState, discovery: Arc<dyn DeviceDiscovery>) -> Self {
        Self { state, discovery }
    }

    pub fn state(&self) -> &FarmState {
        &self.state
    }

    /// Add physically connected devices that the pool has not seen yet.
    ///
    /// iOS is queried only when the host supports it; Android always is.
    /// Existing documents are never touched. A discovery failure aborts the
    /// pass so the task queue can retry it.
    pub async fn enumerate_and_register(&self) -> Result<RegistrationReport> {
        let known: HashSet<String> = self.state.device_ids()?.into_iter().collect();
        let mut report = RegistrationReport::default();

        for platform in [MobilePlatform::Ios, MobilePlatform::Android] {
            if !self.discovery.supports(platform) {
                debug!(%platform, "Host cannot enumerate devices for platform, skipping");
                continue;
            }

            let connected = self
                .discovery
                .fetch_connected_device_ids(platform, DeviceType::Physical)
                .await?;
            let new_ids = unseen(&known, connected);

            if !new_ids.is_empty() {
                let os = platform.device_os();
                let records: Vec<DeviceRecord> = new_ids
                    .iter()
                    .map(|id| DeviceRecord::available(id.clone(), DeviceType::Physical, os))
                    .collect();
                self.state.insert_devices(&records)?;
                info!(%platform, count = records.len(), "Registered new devices");
            }

            match platform {
                MobilePlatform::Android => report.android = new_ids,
                MobilePlatform::Ios => report.ios = new_ids,
            }
        }

        debug!(registered = report.total(), "Registration pass finished");
        Ok(report)
    }

    /// Claim a uniformly random AVAILABLE device running `os` and open a
    /// session for it.
    ///
    /// The claim is a conditional update, so two concurrent reservations can
    /// never both win the same device; the loser picks another candidate.
    pub fn reserve_device(&self, os: DeviceOs) -> Result<Reservation> {
        let mut rng = rand::thread_rng();

        for round in 0..MAX_RESERVE_ROUNDS {
            let mut candidates: Vec<String> = self
                .state
                .list_devices(Some(DeviceStatus::Available), Some(os))?
                .into_iter()
                .map(|d| d.device_id)
                .collect();

            if candidates.is_empty() {
                break;
            }

            while !candidates.is_empty() {
                let device_id = candidates.swap_remove(rng.gen_range(0..candidates.len()));

                if !self
                    .state
                    .transition_device(&device_id, DeviceStatus::Available, DeviceStatus::InUse)?
                {
                    debug!(%device_id, round, "Device claimed concurrently, reselecting");
                    continue;
                }

                let session_id = Uuid::new_v4();
                self.state
                    .insert_session(&SessionRecord::open(session_id, device_id.clone(), os))?;

                info!(%device_id, %session_id, %os, "Reserved device");
                return Ok(Reservation {
                    device_id,
                    session_id,
                });
            }
        }

        warn!(%os, "No available device");
        Err(Error::NoAvailableDevice { os })
    }

    /// Mark a device TERMINATED and close its session.
    ///
    /// Both writes are unconditional; releasing twice re-applies the same end
    /// state with a fresh end time.
    pub fn release_device(&self, device_id: &str, session_id: Uuid) -> Result<()> {
        let device_found = self
            .state
            .set_device_status(device_id, DeviceStatus::Terminated)?;
        let session_found = self.state.close_session(session_id, Utc::now())?;

        if !device_found {
            warn!(device_id, "Released a device the pool does not know");
        }
        if !session_found {
            warn!(%session_id, "Released a session the pool does not know");
        }

        info!(device_id, %session_id, "Released device");
        Ok(())
    }

    /// Return every TERMINATED device to AVAILABLE. Returns how many were
    /// reclaimed.
    pub fn reconcile(&self) -> Result<usize> {
        let terminated = self
            .state
            .list_devices(Some(DeviceStatus::Terminated), None)?;

        let mut reclaimed = 0;
        for device in terminated {
            if self.state.transition_device(
                &device.device_id,
                DeviceStatus::Terminated,
                DeviceStatus::Available,
            )? {
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed terminated devices");
        } else {
            debug!("No terminated devices to reclaim");
        }
        Ok(reclaimed)
    }

    /// Take a device out of rotation by hand
    pub fn mark_faulty(&self, device_id: &str) -> Result<()> {
        if !self.state.set_device_status(device_id, DeviceStatus::Faulty)? {
            return Err(Error::NotFound {
                kind: "device".to_string(),
                id: device_id.to_string(),
            });
        }
        warn!(device_id, "Device marked faulty");
        Ok(())
    }

    pub fn list_devices(
        &self,
        status: Option<DeviceStatus>,
        os: Option<DeviceOs>,
    ) -> Result<Vec<DeviceRecord>> {
        self.state.list_devices(status, os)
    }

    pub fn list_sessions(&self, open_only: bool) -> Result<Vec<SessionRecord>> {
        self.state.list_sessions(open_only)
    }
}

/// Connected ids not yet in the pool, first occurrence order, without repeats
fn unseen(known: &HashSet<String>, connected: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    connected
        .into_iter()
        .filter(|id| !known.contains(id) && seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FarmConfig;
    use crate::discovery::testing::ScriptedDiscovery;
    use crate::state::Collections;
    use devicefarm_common::{Database, Filter};

    fn farm_with(discovery: ScriptedDiscovery) -> (DeviceFarm, Database) {
        let db = Database::open_memory().unwrap();
        let collections = Collections::resolve(&FarmConfig::default()).unwrap();
        let state = FarmState::with_database(db.clone(), collections);
        (DeviceFarm::new(state, Arc::new(discovery)), db)
    }

    fn farm() -> (DeviceFarm, Database) {
        farm_with(ScriptedDiscovery::android(&[]))
    }

    fn seed(farm: &DeviceFarm, id: &str, os: DeviceOs, status: DeviceStatus) {
        let mut record = DeviceRecord::available(id, DeviceType::Physical, os);
        record.status = status;
        farm.state().insert_devices(&[record]).unwrap();
    }

    fn status_of(farm: &DeviceFarm, id: &str) -> DeviceStatus {
        farm.state().get_device(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_register_inserts_new_devices_as_available() {
        let discovery =
            ScriptedDiscovery::android(&["R58M1", "R58M2", "R58M1"]).with_ios(&["00008030-A"]);
        let (farm, _db) = farm_with(discovery);

        let report = farm.enumerate_and_register().await.unwrap();
        assert_eq!(report.android, vec!["R58M1", "R58M2"]);
        assert_eq!(report.ios, vec!["00008030-A"]);
        assert_eq!(report.total(), 3);

        let ios = farm.list_devices(None, Some(DeviceOs::Ios)).unwrap();
        assert_eq!(ios.len(), 1);
        assert_eq!(ios[0].device_type, DeviceType::Physical);
        assert_eq!(ios[0].status, DeviceStatus::Available);
        assert_eq!(farm.list_devices(None, Some(DeviceOs::Android)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_register_is_additive_only() {
        let discovery =
            ScriptedDiscovery::android(&["R58M1"]).then_android(Ok(vec!["R58M1".to_string()]));
        let (farm, _db) = farm_with(discovery);

        assert_eq!(farm.enumerate_and_register().await.unwrap().total(), 1);
        farm.reserve_device(DeviceOs::Android).unwrap();

        let second = farm.enumerate_and_register().await.unwrap();
        assert_eq!(second.total(), 0);

        let devices = farm.list_devices(None, None).unwrap();
        assert_eq!(devices.len(), 1);
        // Registration never resets an existing device's status
        assert_eq!(devices[0].status, DeviceStatus::InUse);
    }

    #[tokio::test]
    async fn test_register_skips_ios_when_host_cannot() {
        let (farm, _db) = farm_with(ScriptedDiscovery::android(&["R58M1"]));
        let report = farm.enumerate_and_register().await.unwrap();
        assert!(report.ios.is_empty());
        assert_eq!(report.android, vec!["R58M1"]);
    }

    #[tokio::test]
    async fn test_register_propagates_discovery_failure() {
        let (farm, _db) =
            farm_with(ScriptedDiscovery::android(&[]).failing_android("adb not found"));

        let err = farm.enumerate_and_register().await.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
        assert!(farm.list_devices(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_reserve_round_trip() {
        let (farm, _db) = farm();
        seed(&farm, "A1", DeviceOs::Android, DeviceStatus::Available);
        seed(&farm, "I1", DeviceOs::Ios, DeviceStatus::Available);

        let reservation = farm.reserve_device(DeviceOs::Android).unwrap();
        assert_eq!(reservation.device_id, "A1");
        assert_eq!(status_of(&farm, "A1"), DeviceStatus::InUse);
        assert_eq!(status_of(&farm, "I1"), DeviceStatus::Available);

        let session = farm
            .state()
            .get_session(reservation.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.device_id, "A1");
        assert_eq!(session.device_os, DeviceOs::Android);
        assert!(session.end_time.is_none());
    }

    #[test]
    fn test_reserve_exhaustion_writes_no_session() {
        let (farm, _db) = farm();
        seed(&farm, "I1", DeviceOs::Ios, DeviceStatus::InUse);
        seed(&farm, "I2", DeviceOs::Ios, DeviceStatus::Terminated);
        seed(&farm, "A1", DeviceOs::Android, DeviceStatus::Available);

        let err = farm.reserve_device(DeviceOs::Ios).unwrap_err();
        assert!(matches!(err, Error::NoAvailableDevice { os: DeviceOs::Ios }));
        assert!(err.to_string().contains("ios"));
        assert!(farm.list_sessions(false).unwrap().is_empty());
        assert_eq!(status_of(&farm, "A1"), DeviceStatus::Available);
    }

    #[test]
    fn test_reserve_picks_among_all_candidates() {
        let (farm, _db) = farm();
        for id in ["A1", "A2", "A3"] {
            seed(&farm, id, DeviceOs::Android, DeviceStatus::Available);
        }

        let mut reserved: Vec<String> = (0..3)
            .map(|_| farm.reserve_device(DeviceOs::Android).unwrap().device_id)
            .collect();
        reserved.sort();
        assert_eq!(reserved, vec!["A1", "A2", "A3"]);

        assert!(farm.reserve_device(DeviceOs::Android).is_err());
        assert_eq!(farm.list_sessions(true).unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_reservations_never_share_a_device() {
        let (farm, _db) = farm();
        seed(&farm, "A1", DeviceOs::Android, DeviceStatus::Available);
        seed(&farm, "A2", DeviceOs::Android, DeviceStatus::Available);
        let farm = Arc::new(farm);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let farm = farm.clone();
                std::thread::spawn(move || farm.reserve_device(DeviceOs::Android))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut winners: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|res| res.device_id.clone()))
            .collect();
        winners.sort();

        assert_eq!(winners, vec!["A1", "A2"]);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::NoAvailableDevice { .. })))
                .count(),
            6
        );
        assert_eq!(farm.list_sessions(true).unwrap().len(), 2);
    }

    #[test]
    fn test_release_twice_is_last_write_wins() {
        let (farm, _db) = farm();
        seed(&farm, "A1", DeviceOs::Android, DeviceStatus::Available);
        let reservation = farm.reserve_device(DeviceOs::Android).unwrap();

        farm.release_device("A1", reservation.session_id).unwrap();
        let first_end = farm
            .state()
            .get_session(reservation.session_id)
            .unwrap()
            .unwrap()
            .end_time
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        farm.release_device("A1", reservation.session_id).unwrap();
        let second_end = farm
            .state()
            .get_session(reservation.session_id)
            .unwrap()
            .unwrap()
            .end_time
            .unwrap();

        assert_eq!(status_of(&farm, "A1"), DeviceStatus::Terminated);
        // The second release restamps the end time
        assert!(second_end > first_end, "{} vs {}", second_end, first_end);
    }

    #[test]
    fn test_release_unknown_ids_is_not_an_error() {
        let (farm, _db) = farm();
        farm.release_device("ghost", Uuid::new_v4()).unwrap();
        assert!(farm.list_devices(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_only_touches_terminated() {
        let (farm, _db) = farm();
        for id in ["T1", "T2", "T3"] {
            seed(&farm, id, DeviceOs::Android, DeviceStatus::Terminated);
        }
        seed(&farm, "U1", DeviceOs::Android, DeviceStatus::InUse);
        seed(&farm, "F1", DeviceOs::Ios, DeviceStatus::Faulty);
        seed(&farm, "A1", DeviceOs::Ios, DeviceStatus::Available);

        assert_eq!(farm.reconcile().unwrap(), 3);

        for id in ["T1", "T2", "T3", "A1"] {
            assert_eq!(status_of(&farm, id), DeviceStatus::Available);
        }
        assert_eq!(status_of(&farm, "U1"), DeviceStatus::InUse);
        assert_eq!(status_of(&farm, "F1"), DeviceStatus::Faulty);

        assert_eq!(farm.reconcile().unwrap(), 0);
    }

    #[test]
    fn test_full_lifecycle() {
        let (farm, db) = farm();
        seed(&farm, "D1", DeviceOs::Android, DeviceStatus::Available);

        let first = farm.reserve_device(DeviceOs::Android).unwrap();
        assert_eq!(first.device_id, "D1");
        assert_eq!(status_of(&farm, "D1"), DeviceStatus::InUse);

        farm.release_device("D1", first.session_id).unwrap();
        assert_eq!(status_of(&farm, "D1"), DeviceStatus::Terminated);
        assert!(farm
            .state()
            .get_session(first.session_id)
            .unwrap()
            .unwrap()
            .end_time
            .is_some());

        // Released devices wait for the sweep
        assert!(farm.reserve_device(DeviceOs::Android).is_err());

        farm.reconcile().unwrap();
        assert_eq!(status_of(&farm, "D1"), DeviceStatus::Available);

        let second = farm.reserve_device(DeviceOs::Android).unwrap();
        assert_eq!(second.device_id, "D1");
        assert_ne!(second.session_id, first.session_id);

        // Every status ever written is one of the four known values
        let raw: Vec<serde_json::Value> = db
            .find_many(&farm.state().collections().devices, &Filter::new())
            .unwrap();
        for doc in raw {
            let status = doc["status"].as_str().unwrap();
            assert!(["available", "in_use", "terminated", "faulty"].contains(&status));
        }
    }

    #[test]
    fn test_faulty_devices_stay_out_of_rotation() {
        let (farm, _db) = farm();
        seed(&farm, "A1", DeviceOs::Android, DeviceStatus::Available);

        farm.mark_faulty("A1").unwrap();
        assert!(farm.reserve_device(DeviceOs::Android).is_err());
        assert_eq!(farm.reconcile().unwrap(), 0);
        assert_eq!(status_of(&farm, "A1"), DeviceStatus::Faulty);

        assert!(matches!(
            farm.mark_faulty("ghost"),
            Err(Error::NotFound { .. })
        ));
    }
}
