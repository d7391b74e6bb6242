//! Daemon gRPC Client

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use devicefarm_common::{DeviceOs, DeviceStatus, Reservation};
use futures::FutureExt;
use tonic::transport::Channel;
use tonic::{Code, Response, Status};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::generated::device_farm_client::DeviceFarmClient;
use crate::generated::*;

/// Default bound on how long a call waits for the daemon
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side failures
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect to daemon at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// The caller stopped waiting. The daemon may still complete the task.
    #[error("no result from daemon within {0:?}")]
    Timeout(Duration),

    /// The daemon ran the task and it failed
    #[error("{}", .0.message())]
    Task(#[from] Status),

    #[error("invalid response from daemon: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// The pool had no available device for the requested OS
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ClientError::Task(status) if status.code() == Code::ResourceExhausted)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Wait on an RPC for at most `timeout`
async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = std::result::Result<Response<T>, Status>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(ClientError::Task(status)),
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}

/// Client for communicating with the DeviceFarm daemon
pub struct FarmClient {
    client: DeviceFarmClient<Channel>,
    timeout: Duration,
}

impl FarmClient {
    /// Connect to the daemon
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = DeviceFarmClient::connect(addr.to_string())
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bound every call by `timeout` instead of the default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check if the daemon is healthy
    pub async fn health_check(&mut self) -> bool {
        matches!(self.health().await, Ok(health) if health.healthy)
    }

    pub async fn health(&mut self) -> Result<GetHealthResponse> {
        bounded(self.timeout, self.client.get_health(GetHealthRequest {})).await
    }

    // Pool tasks

    /// Reserve an available device of the given OS
    pub async fn reserve_device(&mut self, os: DeviceOs) -> Result<Reservation> {
        let request = ReserveDeviceRequest {
            mobile_os: os.to_string(),
        };
        let response = bounded(self.timeout, self.client.reserve_device(request)).await?;

        let session_id = Uuid::parse_str(&response.session_id).map_err(|e| {
            ClientError::InvalidResponse(format!("session_id {:?}: {}", response.session_id, e))
        })?;
        debug!(device_id = %response.device_id, %session_id, "Reserved device");

        Ok(Reservation {
            device_id: response.device_id,
            session_id,
        })
    }

    /// Release a reserved device and close its session
    pub async fn release_device(&mut self, device_id: &str, session_id: Uuid) -> Result<()> {
        let request = ReleaseDeviceRequest {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
        };
        bounded(self.timeout, self.client.release_device(request)).await?;
        debug!(device_id, %session_id, "Released device");
        Ok(())
    }

    /// Register newly connected devices
    pub async fn register_devices(&mut self) -> Result<RegisterDevicesResponse> {
        bounded(self.timeout, self.client.register_devices(RegisterDevicesRequest {})).await
    }

    /// Return terminated devices to the pool
    pub async fn reconcile(&mut self) -> Result<u32> {
        let response = bounded(self.timeout, self.client.reconcile(ReconcileRequest {})).await?;
        Ok(response.reclaimed)
    }

    // Queries

    pub async fn list_devices(
        &mut self,
        status: Option<DeviceStatus>,
        os: Option<DeviceOs>,
    ) -> Result<Vec<Device>> {
        let request = ListDevicesRequest {
            status: status.map(|s| s.to_string()).unwrap_or_default(),
            mobile_os: os.map(|o| o.to_string()).unwrap_or_default(),
        };
        let response = bounded(self.timeout, self.client.list_devices(request)).await?;
        Ok(response.devices)
    }

    pub async fn list_sessions(&mut self, open_only: bool) -> Result<Vec<Session>> {
        let response = bounded(
            self.timeout,
            self.client.list_sessions(ListSessionsRequest { open_only }),
        )
        .await?;
        Ok(response.sessions)
    }

    /// Take a device out of rotation
    pub async fn mark_faulty(&mut self, device_id: &str) -> Result<()> {
        let request = MarkDeviceFaultyRequest {
            device_id: device_id.to_string(),
        };
        bounded(self.timeout, self.client.mark_device_faulty(request)).await?;
        Ok(())
    }

    /// Reserve a device, run `f` with it, and release it afterwards.
    ///
    /// The release runs whether `f` returns normally or panics; a panic is
    /// resumed once the device is back.
    pub async fn with_device<F, Fut, T>(&mut self, os: DeviceOs, f: F) -> Result<T>
    where
        F: FnOnce(Reservation) -> Fut,
        Fut: Future<Output = T>,
    {
        let reservation = self.reserve_device(os).await?;
        let outcome = AssertUnwindSafe(f(reservation.clone())).catch_unwind().await;

        let released = self
            .release_device(&reservation.device_id, reservation.session_id)
            .await;

        match outcome {
            Ok(output) => {
                released?;
                Ok(output)
            }
            Err(panic) => {
                if let Err(e) = released {
                    warn!(
                        device_id = %reservation.device_id,
                        error = %e,
                        "Release after panic failed"
                    );
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_timeout_is_distinct() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Response::new(()))
        };
        let err = bounded(Duration::from_millis(20), slow).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_exhausted());
    }

    #[tokio::test]
    async fn test_bounded_passes_task_failure_through() {
        let failing = async {
            Err::<Response<()>, _>(Status::resource_exhausted(
                "Failed to reserve any device for ios mobile os as availability is 0",
            ))
        };
        let err = bounded(Duration::from_secs(1), failing).await.unwrap_err();
        assert!(err.is_exhausted());
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("availability is 0"));

        let ok = bounded(Duration::from_secs(1), async { Ok(Response::new(7u32)) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let err = FarmClient::connect("http://127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
