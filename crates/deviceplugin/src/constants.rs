//! Well-known paths, names and default values.

use std::time::Duration;

/// Prefix of every advertised resource name, `afxdp/<pool>`.
pub const RESOURCE_PREFIX: &str = "afxdp";

/// Oldest kernel with usable AF_XDP support.
pub const MINIMUM_KERNEL: &str = "4.18.0";

pub const DEFAULT_CONFIG_FILE: &str = "/afxdp/config.json";
pub const DEFAULT_LOG_DIR: &str = "/var/log/afxdp-k8s-plugins/";
pub const DEFAULT_DEVICE_FILE: &str = "/tmp/afxdp_dp/device.json";
pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins/";
pub const DEFAULT_POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";
pub const DEFAULT_HANDOFF_DIR: &str = "/tmp/afxdp_dp/";

pub const LOG_DIR_PERMISSIONS: u32 = 0o744;

/// Directory the handoff endpoint directory is mounted at inside containers.
pub const CONTAINER_HANDOFF_DIR: &str = "/tmp/afxdp_dp";
/// File name of every handoff endpoint socket.
pub const HANDOFF_SOCKET_NAME: &str = "afxdp.sock";
/// Env var listing the devices handed to a container.
pub const DEVICES_ENV: &str = "AFXDP_DEVICES";
/// Env var carrying the container-side handoff socket path.
pub const HANDOFF_SOCKET_ENV: &str = "AFXDP_HANDOFF_SOCKET";

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_CHECK: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONCILE: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a single handshake request once a client connected.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on dialing the kubelet sockets.
pub const KUBELET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
