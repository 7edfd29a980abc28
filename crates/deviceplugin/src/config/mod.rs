pub mod cli;
pub mod plugin;
pub mod pool;

use std::path::PathBuf;

use device_plugin_pb::api::KUBELET_SOCKET;

pub use cli::*;
pub use plugin::*;
pub use pool::*;

/// Host paths shared by every pool manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    /// Directory the kubelet watches for device plugin sockets.
    pub device_plugin_dir: PathBuf,
    /// Kubelet registration socket, normally inside `device_plugin_dir`.
    pub kubelet_socket: PathBuf,
    pub pod_resources_socket: PathBuf,
    /// Root of the per-allocation handoff endpoints.
    pub handoff_dir: PathBuf,
}

impl PluginPaths {
    pub fn new(
        device_plugin_dir: impl Into<PathBuf>,
        pod_resources_socket: impl Into<PathBuf>,
        handoff_dir: impl Into<PathBuf>,
    ) -> Self {
        let device_plugin_dir = device_plugin_dir.into();
        Self {
            kubelet_socket: device_plugin_dir.join(KUBELET_SOCKET),
            device_plugin_dir,
            pod_resources_socket: pod_resources_socket.into(),
            handoff_dir: handoff_dir.into(),
        }
    }
}

impl From<&Cli> for PluginPaths {
    fn from(cli: &Cli) -> Self {
        Self::new(
            &cli.device_plugin_dir,
            &cli.pod_resources_socket,
            &cli.handoff_dir,
        )
    }
}
