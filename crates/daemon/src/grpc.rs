//! gRPC server implementation

use crate::farm::DeviceFarm;
use crate::generated::device_farm_server::{DeviceFarm as DeviceFarmRpc, DeviceFarmServer};
use crate::generated::{
    self, GetHealthRequest, GetHealthResponse, ListDevicesRequest, ListDevicesResponse,
    ListSessionsRequest, ListSessionsResponse, MarkDeviceFaultyRequest, MarkDeviceFaultyResponse,
    ReconcileRequest, ReconcileResponse, RegisterDevicesRequest, RegisterDevicesResponse,
    ReleaseDeviceRequest, ReleaseDeviceResponse, ReserveDeviceRequest, ReserveDeviceResponse,
};
use crate::tasks::{FarmTask, TaskQueue};
use devicefarm_common::types::{DeviceOs, DeviceRecord, DeviceStatus, SessionRecord};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};
use uuid::Uuid;

/// gRPC service implementation
pub struct FarmService {
    queue: TaskQueue,
    farm: Arc<DeviceFarm>,
    result_timeout: Duration,
    started: Instant,
}

impl FarmService {
    pub fn new(queue: TaskQueue, farm: Arc<DeviceFarm>, result_timeout: Duration) -> Self {
        Self {
            queue,
            farm,
            result_timeout,
            started: Instant::now(),
        }
    }

    /// Submit a task and wait up to `result_timeout` for its outcome.
    /// Expiry maps to DEADLINE_EXCEEDED; the task itself keeps running.
    async fn run(&self, task: FarmTask) -> Result<crate::tasks::TaskOutput, Status> {
        let handle = self.queue.submit(task).await?;
        Ok(handle.get(self.result_timeout).await?)
    }
}

#[tonic::async_trait]
impl DeviceFarmRpc for FarmService {
    async fn reserve_device(
        &self,
        request: Request<ReserveDeviceRequest>,
    ) -> Result<Response<ReserveDeviceResponse>, Status> {
        let req = request.into_inner();
        let os = DeviceOs::from_str(&req.mobile_os)?;
        debug!(%os, "ReserveDevice");

        let reservation = self
            .run(FarmTask::ReserveDevice { os })
            .await?
            .into_reservation()?;

        Ok(Response::new(ReserveDeviceResponse {
            device_id: reservation.device_id,
            session_id: reservation.session_id.to_string(),
        }))
    }

    async fn release_device(
        &self,
        request: Request<ReleaseDeviceRequest>,
    ) -> Result<Response<ReleaseDeviceResponse>, Status> {
        let req = request.into_inner();
        if req.device_id.is_empty() {
            return Err(Status::invalid_argument("device_id required"));
        }
        let session_id = parse_session_id(&req.session_id)?;
        debug!(device_id = %req.device_id, %session_id, "ReleaseDevice");

        self.run(FarmTask::ReleaseDevice {
            device_id: req.device_id,
            session_id,
        })
        .await?;

        Ok(Response::new(ReleaseDeviceResponse {}))
    }

    async fn register_devices(
        &self,
        _request: Request<RegisterDevicesRequest>,
    ) -> Result<Response<RegisterDevicesResponse>, Status> {
        let report = self
            .run(FarmTask::RegisterDevices)
            .await?
            .into_registration()?;

        Ok(Response::new(RegisterDevicesResponse {
            android: report.android,
            ios: report.ios,
        }))
    }

    async fn reconcile(
        &self,
        _request: Request<ReconcileRequest>,
    ) -> Result<Response<ReconcileResponse>, Status> {
        let reclaimed = self.run(FarmTask::Reconcile).await?.into_reclaimed()?;

        Ok(Response::new(ReconcileResponse {
            reclaimed: reclaimed as u32,
        }))
    }

    async fn list_devices(
        &self,
        request: Request<ListDevicesRequest>,
    ) -> Result<Response<ListDevicesResponse>, Status> {
        let req = request.into_inner();
        let status = optional(&req.status, DeviceStatus::from_str)?;
        let os = optional(&req.mobile_os, DeviceOs::from_str)?;

        let devices = self.farm.list_devices(status, os)?;

        Ok(Response::new(ListDevicesResponse {
            devices: devices.iter().map(device_to_proto).collect(),
        }))
    }

    async fn list_sessions(
        &self,
        request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let req = request.into_inner();
        let sessions = self.farm.list_sessions(req.open_only)?;

        Ok(Response::new(ListSessionsResponse {
            sessions: sessions.iter().map(session_to_proto).collect(),
        }))
    }

    async fn mark_device_faulty(
        &self,
        request: Request<MarkDeviceFaultyRequest>,
    ) -> Result<Response<MarkDeviceFaultyResponse>, Status> {
        let req = request.into_inner();
        self.farm.mark_faulty(&req.device_id)?;
        Ok(Response::new(MarkDeviceFaultyResponse {}))
    }

    async fn get_health(
        &self,
        _request: Request<GetHealthRequest>,
    ) -> Result<Response<GetHealthResponse>, Status> {
        let healthy = self.farm.state().ping().is_ok();

        Ok(Response::new(GetHealthResponse {
            healthy,
            version: devicefarm_common::VERSION.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }))
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw)
        .map_err(|_| Status::invalid_argument(format!("invalid session_id: {:?}", raw)))
}

/// Empty strings mean "no filter"
fn optional<T>(
    raw: &str,
    parse: impl Fn(&str) -> devicefarm_common::Result<T>,
) -> Result<Option<T>, Status> {
    if raw.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parse(raw)?))
    }
}

fn device_to_proto(device: &DeviceRecord) -> generated::Device {
    generated::Device {
        device_id: device.device_id.clone(),
        device_type: device.device_type.to_string(),
        device_os: device.device_os.to_string(),
        status: device.status.to_string(),
    }
}

fn session_to_proto(session: &SessionRecord) -> generated::Session {
    generated::Session {
        session_id: session.session_id.to_string(),
        device_id: session.device_id.clone(),
        device_os: session.device_os.to_string(),
        start_time: session.start_time.to_rfc3339(),
        end_time: session
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    }
}

/// Start the gRPC server; returns once `shutdown` fires
pub async fn serve(
    listen: String,
    queue: TaskQueue,
    farm: Arc<DeviceFarm>,
    result_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listen.parse()?;
    let service = FarmService::new(queue, farm, result_timeout);

    info!("gRPC server listening on {}", addr);

    tonic::transport::Server::builder()
        .add_service(DeviceFarmServer::new(service))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FarmConfig, TaskConfig};
    use crate::discovery::testing::ScriptedDiscovery;
    use crate::state::{Collections, FarmState};
    use devicefarm_common::{Database, DeviceType};

    fn service(discovery: ScriptedDiscovery) -> FarmService {
        service_with_timeout(discovery, Duration::from_secs(10))
    }

    fn service_with_timeout(discovery: ScriptedDiscovery, result_timeout: Duration) -> FarmService {
        let state = FarmState::with_database(
            Database::open_memory().unwrap(),
            Collections::resolve(&FarmConfig::default()).unwrap(),
        );
        let farm = Arc::new(DeviceFarm::new(state, Arc::new(discovery)));
        let config = TaskConfig {
            retry_delay_secs: 0,
            ..TaskConfig::default()
        };
        let (queue, _pool) = TaskQueue::start(farm.clone(), &config, CancellationToken::new());
        FarmService::new(queue, farm, result_timeout)
    }

    #[tokio::test]
    async fn test_register_reserve_release_reconcile() {
        let svc = service(ScriptedDiscovery::android(&["R58M1"]));

        let registered = svc
            .register_devices(Request::new(RegisterDevicesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(registered.android, vec!["R58M1"]);
        assert!(registered.ios.is_empty());

        let reserved = svc
            .reserve_device(Request::new(ReserveDeviceRequest {
                mobile_os: "Android".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reserved.device_id, "R58M1");

        let open = svc
            .list_sessions(Request::new(ListSessionsRequest { open_only: true }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(open.sessions.len(), 1);
        assert_eq!(open.sessions[0].session_id, reserved.session_id);
        assert!(open.sessions[0].end_time.is_empty());

        svc.release_device(Request::new(ReleaseDeviceRequest {
            device_id: reserved.device_id.clone(),
            session_id: reserved.session_id.clone(),
        }))
        .await
        .unwrap();

        let reclaimed = svc
            .reconcile(Request::new(ReconcileRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reclaimed.reclaimed, 1);

        let available = svc
            .list_devices(Request::new(ListDevicesRequest {
                status: "available".to_string(),
                mobile_os: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(available.devices.len(), 1);
        assert_eq!(available.devices[0].device_type, "physical");
    }

    #[tokio::test]
    async fn test_status_codes() {
        let svc = service(ScriptedDiscovery::android(&[]));

        let exhausted = svc
            .reserve_device(Request::new(ReserveDeviceRequest {
                mobile_os: "ios".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(exhausted.code(), tonic::Code::ResourceExhausted);
        assert!(exhausted.message().contains("ios"));

        let bad_os = svc
            .reserve_device(Request::new(ReserveDeviceRequest {
                mobile_os: "symbian".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(bad_os.code(), tonic::Code::InvalidArgument);

        let bad_session = svc
            .release_device(Request::new(ReleaseDeviceRequest {
                device_id: "A1".to_string(),
                session_id: "not-a-uuid".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(bad_session.code(), tonic::Code::InvalidArgument);

        let missing = svc
            .mark_device_faulty(Request::new(MarkDeviceFaultyRequest {
                device_id: "ghost".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_mark_faulty_and_health() {
        let svc = service(ScriptedDiscovery::android(&[]));
        svc.farm
            .state()
            .insert_devices(&[DeviceRecord::available(
                "A1",
                DeviceType::Emulator,
                DeviceOs::Android,
            )])
            .unwrap();

        svc.mark_device_faulty(Request::new(MarkDeviceFaultyRequest {
            device_id: "A1".to_string(),
        }))
        .await
        .unwrap();

        let faulty = svc
            .list_devices(Request::new(ListDevicesRequest {
                status: "faulty".to_string(),
                mobile_os: "android".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(faulty.devices.len(), 1);

        let health = svc
            .get_health(Request::new(GetHealthRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(health.healthy);
        assert_eq!(health.version, devicefarm_common::VERSION);
    }

    #[tokio::test]
    async fn test_slow_task_returns_deadline_exceeded_and_still_lands() {
        let slow = ScriptedDiscovery::android(&["R58M1"]).with_delay(Duration::from_millis(300));
        let svc = service_with_timeout(slow, Duration::from_millis(20));

        let err = svc
            .register_devices(Request::new(RegisterDevicesRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::DeadlineExceeded);

        let deadline = Instant::now() + Duration::from_secs(5);
        while svc.farm.state().get_device("R58M1").unwrap().is_none() {
            assert!(Instant::now() < deadline, "registration never completed");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
