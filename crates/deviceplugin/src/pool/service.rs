use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::ContainerPreferredAllocationResponse;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::Mount;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::reconcile;
use super::AllocationError;
use super::AllocationId;
use super::DeviceSnapshot;
use super::PoolShared;
use crate::constants;
use crate::handoff::HandoffEndpoint;
use crate::handoff::HandoffSession;
use crate::net::SocketFactory;

/// Where and how long handoff endpoints of one pool live.
pub struct HandoffSettings {
    /// `<handoff dir>/<pool>`, one subdirectory per container allocation.
    pub root: PathBuf,
    pub timeout: Duration,
    pub sockets: Arc<dyn SocketFactory>,
    /// Cancelled when the pool terminates.
    pub token: CancellationToken,
}

/// Where the kubelet reports which devices running containers hold.
#[derive(Debug, Clone)]
pub struct PodResourcesSettings {
    pub socket: PathBuf,
    pub resource_name: String,
}

/// kubelet device plugin service of one pool.
#[derive(Clone)]
pub struct DevicePluginService {
    shared: Arc<PoolShared>,
    handoff: Arc<HandoffSettings>,
    pod_resources: Arc<PodResourcesSettings>,
    keep_alive: Duration,
    /// Ends the server and every ListAndWatch stream.
    token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        shared: Arc<PoolShared>,
        handoff: HandoffSettings,
        pod_resources: PodResourcesSettings,
        keep_alive: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            shared,
            handoff: Arc::new(handoff),
            pod_resources: Arc::new(pod_resources),
            keep_alive,
            token,
        }
    }

    pub fn options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: true,
        }
    }

    /// Same service, bound to another server lifetime.
    pub fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }

    /// Binds `socket_path` and serves until the service token is cancelled.
    pub fn serve(self, socket_path: &Path) -> io::Result<JoinHandle<()>> {
        utils::fs::remove_file_if_exists(socket_path)?;
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "device plugin server bound");

        let token = self.token.clone();
        let pool = self.shared.name().to_string();
        Ok(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(self))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    token.cancelled().await;
                    info!(pool = %pool, "shutting down device plugin server");
                })
                .await;
            if let Err(e) = result {
                error!("device plugin server failed: {e}");
            }
        }))
    }

    /// Marks every requested device allocated, one allocation per container,
    /// or none at all.
    async fn reserve(&self, containers: Vec<Vec<String>>) -> Result<Vec<(AllocationId, Vec<String>)>, AllocationError> {
        if containers.is_empty() {
            return Err(AllocationError::Empty);
        }

        let mut devices = self.shared.lock().await;
        let mut reserved: Vec<(AllocationId, Vec<String>)> = Vec::with_capacity(containers.len());
        for ids in containers {
            let allocation = AllocationId::new();
            if let Err(e) = devices.allocate(&ids, allocation) {
                for (allocation, ids) in &reserved {
                    devices.release(ids.iter().map(String::as_str), *allocation);
                }
                return Err(e);
            }
            reserved.push((allocation, ids));
        }
        Ok(reserved)
    }

    /// Like [`Self::reserve`], but a refusal caused by a device whose socket
    /// was already handed over triggers an immediate check for ended
    /// workloads and one more attempt. The kubelet only asks for a device
    /// again once the container holding it is gone.
    async fn reserve_or_reclaim(
        &self,
        containers: Vec<Vec<String>>,
    ) -> Result<Vec<(AllocationId, Vec<String>)>, AllocationError> {
        match self.reserve(containers.clone()).await {
            Err(AllocationError::AlreadyAllocated(id)) => {
                let requested = containers.iter().flatten().cloned().collect::<Vec<_>>();
                if self.reclaim_ended(&requested).await {
                    self.reserve(containers).await
                } else {
                    Err(AllocationError::AlreadyAllocated(id))
                }
            }
            other => other,
        }
    }

    /// Frees consumed devices among `requested` whose workload ended.
    /// Returns whether any device was freed.
    async fn reclaim_ended(&self, requested: &[String]) -> bool {
        if !self.shared.lock().await.any_consumed(requested) {
            return false;
        }

        let released = match reconcile::reconcile_once(
            &self.shared,
            &self.pod_resources.socket,
            &self.pod_resources.resource_name,
        )
        .await
        {
            Some(released) => released,
            None => {
                let released = self.shared.release_consumed(requested).await;
                if !released.is_empty() {
                    warn!(
                        pool = self.shared.name(),
                        devices = ?released,
                        "pod resources unavailable, releasing devices requested again by the kubelet"
                    );
                }
                released
            }
        };
        !released.is_empty()
    }

    async fn rollback(&self, reserved: &[(AllocationId, Vec<String>)]) {
        let mut devices = self.shared.lock().await;
        for (allocation, ids) in reserved {
            devices.release(ids.iter().map(String::as_str), *allocation);
        }
    }

    fn open_endpoint(&self, allocation: AllocationId, devices: &[String]) -> io::Result<HandoffEndpoint> {
        let sessions = devices
            .iter()
            .map(|device| {
                Ok(HandoffSession {
                    device: device.clone(),
                    socket: self.handoff.sockets.create(device)?,
                })
            })
            .collect::<io::Result<Vec<_>>>()?;

        HandoffEndpoint::bind(
            self.handoff.root.join(allocation.to_string()),
            allocation,
            sessions,
            self.handoff.timeout,
        )
    }
}

fn list_response(snapshot: &DeviceSnapshot) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: snapshot.iter().map(Into::into).collect(),
    }
}

fn allocation_status(err: AllocationError) -> Status {
    match err {
        AllocationError::Empty | AllocationError::Duplicate(_) => Status::invalid_argument(err.to_string()),
        AllocationError::UnknownDevice(_) => Status::not_found(err.to_string()),
        AllocationError::Unhealthy(_) | AllocationError::AlreadyAllocated(_) => {
            Status::failed_precondition(err.to_string())
        }
    }
}

fn container_response(endpoint: &HandoffEndpoint) -> ContainerAllocateResponse {
    let container_socket = Path::new(constants::CONTAINER_HANDOFF_DIR).join(constants::HANDOFF_SOCKET_NAME);
    let envs = HashMap::from([
        (constants::DEVICES_ENV.to_string(), endpoint.pending().join(" ")),
        (
            constants::HANDOFF_SOCKET_ENV.to_string(),
            container_socket.display().to_string(),
        ),
    ]);

    ContainerAllocateResponse {
        envs,
        mounts: vec![Mount {
            container_path: constants::CONTAINER_HANDOFF_DIR.to_string(),
            host_path: endpoint.dir().display().to_string(),
            read_only: false,
        }],
        devices: Vec::new(),
        annotations: HashMap::new(),
        cdi_devices: Vec::new(),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(Self::options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Full snapshot first, then every change in order, plus a full snapshot
    /// on every keep-alive tick.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let pool = self.shared.name().to_string();
        info!(pool = %pool, "starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let token = self.token.clone();
        let keep_alive = self.keep_alive;

        tokio::spawn(async move {
            let (snapshot, mut updates) = shared.subscribe().await;
            if tx.send(Ok(list_response(&snapshot))).is_err() {
                return;
            }

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let snapshot = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => {
                        debug!(pool = %pool, "ListAndWatch client went away");
                        break;
                    }
                    _ = ticker.tick() => shared.snapshot().await,
                    update = updates.recv() => match update {
                        Ok(snapshot) => snapshot,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(pool = %pool, skipped, "ListAndWatch subscriber lagged, resending full list");
                            shared.snapshot().await
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if tx.send(Ok(list_response(&snapshot))).is_err() {
                    break;
                }
            }
            debug!(pool = %pool, "device watch task stopped");
        });

        let stream = UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        let devices = self.shared.lock().await;
        let container_responses = req
            .container_requests
            .iter()
            .map(|container| ContainerPreferredAllocationResponse {
                device_i_ds: devices.preferred(
                    &container.available_device_i_ds,
                    &container.must_include_device_i_ds,
                    usize::try_from(container.allocation_size).unwrap_or(0),
                ),
            })
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let containers = req
            .container_requests
            .into_iter()
            .map(|container| container.devices_ids)
            .collect::<Vec<_>>();
        info!(pool = self.shared.name(), ?containers, "allocating devices");

        let reserved = self.reserve_or_reclaim(containers).await.map_err(|e| {
            warn!(pool = self.shared.name(), "allocation refused: {e}");
            allocation_status(e)
        })?;

        let mut endpoints = Vec::with_capacity(reserved.len());
        for (allocation, devices) in &reserved {
            match self.open_endpoint(*allocation, devices) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    error!(pool = self.shared.name(), ?devices, "failed to prepare handoff: {e}");
                    // dropping the endpoints removes them
                    drop(endpoints);
                    self.rollback(&reserved).await;
                    return Err(Status::internal(format!(
                        "failed to prepare socket handoff for {devices:?}: {e}"
                    )));
                }
            }
        }

        let container_responses = endpoints
            .into_iter()
            .map(|endpoint| {
                let response = container_response(&endpoint);
                info!(
                    pool = self.shared.name(),
                    path = %endpoint.socket_path().display(),
                    "handoff endpoint ready"
                );
                tokio::spawn(endpoint.serve(self.shared.clone(), self.handoff.token.child_token()));
                response
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        debug!("pre-start container: {:?}", req.devices_ids);
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
