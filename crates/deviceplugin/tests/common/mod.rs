//! A kubelet stand-in serving registration and pod resources over Unix
//! sockets in a scratch directory.

#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use device_plugin_pb::api;
use device_plugin_pb::api::device_plugin_client::DevicePluginClient;
use device_plugin_pb::api::registration_server::Registration;
use device_plugin_pb::api::registration_server::RegistrationServer;
use device_plugin_pb::api::RegisterRequest;
use device_plugin_pb::pod_resources::pod_resources_lister_server::PodResourcesLister;
use device_plugin_pb::pod_resources::pod_resources_lister_server::PodResourcesListerServer;
use device_plugin_pb::pod_resources::ContainerDevices;
use device_plugin_pb::pod_resources::ContainerResources;
use device_plugin_pb::pod_resources::ListPodResourcesRequest;
use device_plugin_pb::pod_resources::ListPodResourcesResponse;
use device_plugin_pb::pod_resources::PodResources;
use deviceplugin::config::PluginPaths;
use deviceplugin::kubelet::connect_uds;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Server;
use tonic::Request;
use tonic::Response;
use tonic::Status;

#[derive(Clone, Default)]
struct Recorder {
    registrations: Arc<Mutex<Vec<RegisterRequest>>>,
    in_use: Arc<Mutex<Vec<(String, String)>>>,
}

#[tonic::async_trait]
impl Registration for Recorder {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<api::Empty>, Status> {
        self.registrations.lock().unwrap().push(request.into_inner());
        Ok(Response::new(api::Empty {}))
    }
}

#[tonic::async_trait]
impl PodResourcesLister for Recorder {
    async fn list(
        &self,
        _request: Request<ListPodResourcesRequest>,
    ) -> Result<Response<ListPodResourcesResponse>, Status> {
        let devices = self
            .in_use
            .lock()
            .unwrap()
            .iter()
            .map(|(resource_name, id)| ContainerDevices {
                resource_name: resource_name.clone(),
                device_ids: vec![id.clone()],
            })
            .collect();
        Ok(Response::new(ListPodResourcesResponse {
            pod_resources: vec![PodResources {
                name: "workload".to_string(),
                namespace: "default".to_string(),
                containers: vec![ContainerResources {
                    name: "app".to_string(),
                    devices,
                }],
            }],
        }))
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

pub struct FakeKubelet {
    dir: tempfile::TempDir,
    recorder: Recorder,
    registration: Option<Running>,
    pod_resources: Option<Running>,
}

impl FakeKubelet {
    /// Serves registration and pod resources.
    pub fn start() -> Self {
        let mut kubelet = Self::offline();
        kubelet.registration = Some(kubelet.serve_registration());
        kubelet.pod_resources = Some(kubelet.serve_pod_resources());
        kubelet
    }

    /// Creates the directories but serves nothing.
    pub fn offline() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("device-plugins")).unwrap();
        std::fs::create_dir_all(dir.path().join("pod-resources")).unwrap();
        Self {
            dir,
            recorder: Recorder::default(),
            registration: None,
            pod_resources: None,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> PluginPaths {
        PluginPaths::new(
            self.root().join("device-plugins"),
            self.root().join("pod-resources/kubelet.sock"),
            self.root().join("handoff"),
        )
    }

    pub fn registrations(&self) -> Vec<RegisterRequest> {
        self.recorder.registrations.lock().unwrap().clone()
    }

    /// Waits until at least `count` registrations arrived.
    pub async fn wait_for_registrations(&self, count: usize) -> Vec<RegisterRequest> {
        eventually(Duration::from_secs(10), || {
            let registrations = self.registrations();
            (registrations.len() >= count).then_some(registrations)
        })
        .await
    }

    /// Reports `id` of `resource_name` as held by a running container.
    pub fn set_in_use(&self, devices: &[(&str, &str)]) {
        *self.recorder.in_use.lock().unwrap() = devices
            .iter()
            .map(|(resource, id)| (resource.to_string(), id.to_string()))
            .collect();
    }

    /// Removes and recreates the registration socket, like a kubelet restart.
    pub async fn restart(&mut self) {
        if let Some(running) = self.registration.take() {
            running.stop().await;
        }
        // the watcher must observe a fresh socket file
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.registration = Some(self.serve_registration());
    }

    fn serve_registration(&self) -> Running {
        let path = self.paths().kubelet_socket;
        let service = RegistrationServer::new(self.recorder.clone());
        serve(&path, move |builder| builder.add_service(service))
    }

    fn serve_pod_resources(&self) -> Running {
        let path = self.paths().pod_resources_socket;
        let service = PodResourcesListerServer::new(self.recorder.clone());
        serve(&path, move |builder| builder.add_service(service))
    }
}

fn serve<F>(path: &Path, add: F) -> Running
where
    F: FnOnce(&mut Server) -> tonic::transport::server::Router,
{
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path).unwrap();
    let token = CancellationToken::new();
    let router = add(&mut Server::builder());
    let handle = tokio::spawn({
        let token = token.clone();
        async move {
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), token.cancelled_owned())
                .await
                .unwrap();
        }
    });
    Running { token, handle }
}

/// A client of the pool served at `socket`.
pub async fn plugin_client(socket: &Path) -> DevicePluginClient<Channel> {
    DevicePluginClient::new(connect_uds(socket).await.unwrap())
}

/// Polls `check` every 20ms until it yields a value. Panics after `limit`.
pub async fn eventually<T>(limit: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn handoff_socket(host_dir: &str) -> PathBuf {
    Path::new(host_dir).join(deviceplugin::constants::HANDOFF_SOCKET_NAME)
}
