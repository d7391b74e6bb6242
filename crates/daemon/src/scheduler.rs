//! Periodic jobs
//!
//! Two entries run on fixed periods: returning terminated devices to the
//! pool, and picking up newly attached devices. Each tick submits a task to
//! the queue; the scheduler waits for the outcome only to log it.

use crate::config::ScheduleConfig;
use crate::tasks::{FarmTask, TaskQueue};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A named task fired on a fixed period
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: &'static str,
    pub task: FarmTask,
    pub every: Duration,
}

/// Fires schedule entries into the task queue
pub struct Scheduler {
    queue: TaskQueue,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub fn new(queue: TaskQueue, config: &ScheduleConfig) -> Self {
        Self::with_periods(
            queue,
            Duration::from_secs(config.reconcile_every_secs),
            Duration::from_secs(config.register_every_secs),
        )
    }

    pub fn with_periods(
        queue: TaskQueue,
        reconcile_every: Duration,
        register_every: Duration,
    ) -> Self {
        Self {
            queue,
            entries: vec![
                ScheduleEntry {
                    name: "update_device_availability",
                    task: FarmTask::Reconcile,
                    every: reconcile_every,
                },
                ScheduleEntry {
                    name: "add_new_device_to_device_list",
                    task: FarmTask::RegisterDevices,
                    every: register_every,
                },
            ],
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Spawn one loop per entry; every loop exits on `shutdown`
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.entries
            .into_iter()
            .map(|entry| tokio::spawn(run_entry(entry, self.queue.clone(), shutdown.clone())))
            .collect()
    }
}

async fn run_entry(entry: ScheduleEntry, queue: TaskQueue, shutdown: CancellationToken) {
    debug!(entry = entry.name, "Schedule entry started");

    // The first tick of an interval completes immediately; the first run
    // belongs one period after startup.
    let first = tokio::time::Instant::now() + entry.every;
    let mut ticker = tokio::time::interval_at(first, entry.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let handle = match queue.submit(entry.task.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(entry = entry.name, error = %e, "Failed to submit scheduled task");
                continue;
            }
        };

        // Waiting would delay the next tick only when the queue is backed
        // up; MissedTickBehavior::Skip drops those ticks.
        let task_id = handle.id();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = handle.wait() => match result {
                Ok(output) => {
                    debug!(entry = entry.name, %task_id, ?output, "Scheduled task finished")
                }
                Err(e) => warn!(entry = entry.name, %task_id, error = %e, "Scheduled task failed"),
            },
        }
    }

    info!(entry = entry.name, "Schedule entry stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FarmConfig, TaskConfig};
    use crate::discovery::testing::ScriptedDiscovery;
    use crate::farm::DeviceFarm;
    use crate::state::{Collections, FarmState};
    use devicefarm_common::{Database, DeviceOs, DeviceRecord, DeviceStatus, DeviceType};
    use std::sync::Arc;
    use std::time::Instant;

    fn farm(discovery: ScriptedDiscovery) -> Arc<DeviceFarm> {
        let state = FarmState::with_database(
            Database::open_memory().unwrap(),
            Collections::resolve(&FarmConfig::default()).unwrap(),
        );
        Arc::new(DeviceFarm::new(state, Arc::new(discovery)))
    }

    fn task_config() -> TaskConfig {
        TaskConfig {
            retry_delay_secs: 0,
            ..TaskConfig::default()
        }
    }

    #[tokio::test]
    async fn test_entries_follow_config() {
        let farm = farm(ScriptedDiscovery::android(&[]));
        let (queue, _pool) = TaskQueue::start(farm, &task_config(), CancellationToken::new());

        let scheduler = Scheduler::new(queue, &ScheduleConfig::default());
        let entries = scheduler.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "update_device_availability");
        assert_eq!(entries[0].task, FarmTask::Reconcile);
        assert_eq!(entries[0].every, Duration::from_secs(120));
        assert_eq!(entries[1].name, "add_new_device_to_device_list");
        assert_eq!(entries[1].task, FarmTask::RegisterDevices);
        assert_eq!(entries[1].every, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_periodic_jobs_recover_and_register() {
        let farm = farm(ScriptedDiscovery::android(&["R58M1"]));
        farm.state()
            .insert_devices(&[DeviceRecord {
                status: DeviceStatus::Terminated,
                ..DeviceRecord::available("A1", DeviceType::Physical, DeviceOs::Android)
            }])
            .unwrap();

        let shutdown = CancellationToken::new();
        let (queue, pool) = TaskQueue::start(farm.clone(), &task_config(), shutdown.clone());
        let scheduler =
            Scheduler::with_periods(queue, Duration::from_millis(20), Duration::from_millis(30));
        let loops = scheduler.spawn(shutdown.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let a1 = farm.state().get_device("A1").unwrap().unwrap();
            let registered = farm.state().get_device("R58M1").unwrap().is_some();
            if a1.status == DeviceStatus::Available && registered {
                break;
            }
            assert!(Instant::now() < deadline, "periodic jobs never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        for handle in loops {
            handle.await.unwrap();
        }
        pool.join().await;
    }
}
