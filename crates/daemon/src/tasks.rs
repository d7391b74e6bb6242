//! Task queue
//!
//! Farming operations run as units of work on a pool of workers. Callers
//! submit a task and get back a handle they can wait on, with or without a
//! bound. Giving up on a handle never cancels the task: it runs to
//! completion and its writes land regardless.

use crate::config::TaskConfig;
use crate::farm::{DeviceFarm, RegistrationReport};
use devicefarm_common::{DeviceOs, Error, Reservation, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A unit of work the workers know how to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FarmTask {
    RegisterDevices,
    ReserveDevice { os: DeviceOs },
    ReleaseDevice { device_id: String, session_id: Uuid },
    Reconcile,
}

impl FarmTask {
    pub fn name(&self) -> &'static str {
        match self {
            FarmTask::RegisterDevices => "register_devices",
            FarmTask::ReserveDevice { .. } => "reserve_device",
            FarmTask::ReleaseDevice { .. } => "release_device",
            FarmTask::Reconcile => "reconcile",
        }
    }
}

/// What a finished task produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Registered(RegistrationReport),
    Reserved(Reservation),
    Released,
    Reconciled(usize),
}

impl TaskOutput {
    pub fn into_reservation(self) -> Result<Reservation> {
        match self {
            TaskOutput::Reserved(reservation) => Ok(reservation),
            other => Err(unexpected("reserve_device", &other)),
        }
    }

    pub fn into_registration(self) -> Result<RegistrationReport> {
        match self {
            TaskOutput::Registered(report) => Ok(report),
            other => Err(unexpected("register_devices", &other)),
        }
    }

    pub fn into_reclaimed(self) -> Result<usize> {
        match self {
            TaskOutput::Reconciled(count) => Ok(count),
            other => Err(unexpected("reconcile", &other)),
        }
    }
}

fn unexpected(task: &str, output: &TaskOutput) -> Error {
    Error::Internal(format!("{} produced unexpected output {:?}", task, output))
}

/// Retry policy applied to retryable failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl From<&TaskConfig> for RetryPolicy {
    fn from(config: &TaskConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }
}

struct Envelope {
    id: Uuid,
    task: FarmTask,
    reply: oneshot::Sender<Result<TaskOutput>>,
}

/// Handle on a submitted task
pub struct TaskHandle {
    id: Uuid,
    name: &'static str,
    rx: oneshot::Receiver<Result<TaskOutput>>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task without a bound
    pub async fn wait(self) -> Result<TaskOutput> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(dropped(self.id, self.name)),
        }
    }

    /// Wait up to `timeout`. On expiry the task keeps running and the
    /// caller gets `Error::Timeout`, distinct from a task-reported failure.
    pub async fn get(self, timeout: Duration) -> Result<TaskOutput> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(dropped(self.id, self.name)),
            Err(_) => {
                warn!(task_id = %self.id, task = self.name, ?timeout, "Gave up waiting for task");
                Err(Error::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }
}

fn dropped(id: Uuid, name: &str) -> Error {
    Error::TaskQueue(format!("task {} ({}) was dropped before completing", name, id))
}

/// Submission side of the queue
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Envelope>,
}

/// The spawned workers, for joining on shutdown
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("Task worker panicked: {}", e);
            }
        }
    }
}

impl TaskQueue {
    /// Spawn `worker_concurrency` workers pulling from a bounded queue.
    /// Workers stop taking new tasks once `shutdown` is cancelled.
    pub fn start(
        farm: Arc<DeviceFarm>,
        config: &TaskConfig,
        shutdown: CancellationToken,
    ) -> (Self, WorkerPool) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let policy = RetryPolicy::from(config);

        let handles = (0..config.worker_concurrency.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    farm: farm.clone(),
                    rx: rx.clone(),
                    policy,
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        (Self { tx }, WorkerPool { handles })
    }

    /// Enqueue a task
    pub async fn submit(&self, task: FarmTask) -> Result<TaskHandle> {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let name = task.name();

        self.tx
            .send(Envelope { id, task, reply })
            .await
            .map_err(|_| Error::TaskQueue("task queue is shut down".to_string()))?;

        debug!(task_id = %id, task = name, "Submitted task");
        Ok(TaskHandle { id, name, rx })
    }
}

struct Worker {
    id: usize,
    farm: Arc<DeviceFarm>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Task worker started");

        loop {
            let next = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    envelope = rx.recv() => envelope,
                }
            };

            let Some(envelope) = next else { break };
            self.execute(envelope).await;
        }

        debug!(worker = self.id, "Task worker stopped");
    }

    async fn execute(&self, envelope: Envelope) {
        let Envelope { id, task, reply } = envelope;
        let name = task.name();
        let started = Instant::now();
        info!(task_id = %id, task = name, worker = self.id, "Task started");

        let mut attempt = 0;
        let result = loop {
            match self.run_once(&task).await {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!(
                        task_id = %id,
                        task = name,
                        attempt,
                        error = %e,
                        "Task failed, retrying in {:?}",
                        self.policy.delay
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
                other => break other,
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(task_id = %id, task = name, elapsed_ms, "Task succeeded"),
            Err(e) => error!(task_id = %id, task = name, elapsed_ms, error = %e, "Task failed"),
        }

        if reply.send(result).is_err() {
            debug!(task_id = %id, task = name, "Caller stopped waiting, result discarded");
        }
    }

    async fn run_once(&self, task: &FarmTask) -> Result<TaskOutput> {
        match task {
            FarmTask::RegisterDevices => self
                .farm
                .enumerate_and_register()
                .await
                .map(TaskOutput::Registered),
            FarmTask::ReserveDevice { os } => {
                self.farm.reserve_device(*os).map(TaskOutput::Reserved)
            }
            FarmTask::ReleaseDevice {
                device_id,
                session_id,
            } => self
                .farm
                .release_device(device_id, *session_id)
                .map(|_| TaskOutput::Released),
            FarmTask::Reconcile => self.farm.reconcile().map(TaskOutput::Reconciled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FarmConfig;
    use crate::discovery::testing::ScriptedDiscovery;
    use crate::state::{Collections, FarmState};
    use devicefarm_common::{Database, DeviceRecord, DeviceStatus, DeviceType};

    fn fast_config() -> TaskConfig {
        TaskConfig {
            worker_concurrency: 2,
            retry_delay_secs: 0,
            ..TaskConfig::default()
        }
    }

    type Harness = (
        TaskQueue,
        WorkerPool,
        Arc<DeviceFarm>,
        Arc<ScriptedDiscovery>,
        CancellationToken,
    );

    fn start(discovery: ScriptedDiscovery) -> Harness {
        let discovery = Arc::new(discovery);
        let state = FarmState::with_database(
            Database::open_memory().unwrap(),
            Collections::resolve(&FarmConfig::default()).unwrap(),
        );
        let farm = Arc::new(DeviceFarm::new(state, discovery.clone()));
        let shutdown = CancellationToken::new();
        let (queue, pool) = TaskQueue::start(farm.clone(), &fast_config(), shutdown.clone());
        (queue, pool, farm, discovery, shutdown)
    }

    #[tokio::test]
    async fn test_reserve_and_release_through_queue() {
        let (queue, _pool, farm, _discovery, _shutdown) = start(ScriptedDiscovery::android(&[]));
        farm.state()
            .insert_devices(&[DeviceRecord::available(
                "A1",
                DeviceType::Physical,
                DeviceOs::Android,
            )])
            .unwrap();

        let reservation = queue
            .submit(FarmTask::ReserveDevice { os: DeviceOs::Android })
            .await
            .unwrap()
            .get(Duration::from_secs(10))
            .await
            .unwrap()
            .into_reservation()
            .unwrap();
        assert_eq!(reservation.device_id, "A1");

        let released = queue
            .submit(FarmTask::ReleaseDevice {
                device_id: reservation.device_id.clone(),
                session_id: reservation.session_id,
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(released, TaskOutput::Released);

        let reclaimed = queue
            .submit(FarmTask::Reconcile)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap()
            .into_reclaimed()
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(
            farm.state().get_device("A1").unwrap().unwrap().status,
            DeviceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_to_caller() {
        let (queue, _pool, _farm, _discovery, _shutdown) = start(ScriptedDiscovery::android(&[]));

        let err = queue
            .submit(FarmTask::ReserveDevice { os: DeviceOs::Ios })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableDevice { os: DeviceOs::Ios }));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_retried_once() {
        let (queue, _pool, _farm, discovery, _shutdown) =
            start(ScriptedDiscovery::android(&[]).failing_android("no devices"));

        let err = queue
            .submit(FarmTask::RegisterDevices)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Discovery(_)));
        assert_eq!(discovery.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_discovery_failure() {
        let scripted = ScriptedDiscovery::android(&[])
            .failing_android("adb restarting")
            .then_android(Ok(vec!["R58M1".to_string()]));
        let (queue, _pool, farm, discovery, _shutdown) = start(scripted);

        let report = queue
            .submit(FarmTask::RegisterDevices)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap()
            .into_registration()
            .unwrap();

        assert_eq!(report.android, vec!["R58M1"]);
        assert_eq!(discovery.calls(), 2);
        assert_eq!(farm.list_devices(None, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_task() {
        let scripted =
            ScriptedDiscovery::android(&["R58M1"]).with_delay(Duration::from_millis(300));
        let (queue, _pool, farm, _discovery, _shutdown) = start(scripted);

        let err = queue
            .submit(FarmTask::RegisterDevices)
            .await
            .unwrap()
            .get(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(farm.list_devices(None, None).unwrap().is_empty());

        // The abandoned task still finishes and its writes land
        let deadline = Instant::now() + Duration::from_secs(5);
        while farm.list_devices(None, None).unwrap().is_empty() {
            assert!(Instant::now() < deadline, "task never completed");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let (queue, pool, _farm, _discovery, shutdown) = start(ScriptedDiscovery::android(&[]));
        assert_eq!(pool.len(), 2);

        shutdown.cancel();
        pool.join().await;

        assert!(matches!(
            queue.submit(FarmTask::Reconcile).await,
            Err(Error::TaskQueue(_))
        ));
    }

    #[test]
    fn test_output_conversions_reject_mismatches() {
        assert!(TaskOutput::Released.into_reservation().is_err());
        assert_eq!(TaskOutput::Reconciled(2).into_reclaimed().unwrap(), 2);
        assert_eq!(FarmTask::Reconcile.name(), "reconcile");
    }
}
