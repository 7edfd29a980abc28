//! One device pool: bookkeeping, the kubelet device plugin service and the
//! manager driving its lifecycle.

mod device;
mod discovery;
mod inventory;
mod manager;
mod reconcile;
mod service;
mod shared;
mod state;

use std::path::PathBuf;

use thiserror::Error;

pub use device::AllocationId;
pub use device::Assignment;
pub use device::Device;
pub use device::DeviceSnapshot;
pub use device::DeviceStatus;
pub use device::HandoffState;
pub use device::Health;
pub use discovery::discover;
pub use discovery::select;
pub use inventory::AllocationError;
pub use inventory::DevicePool;
pub use inventory::SyncOutcome;
pub use manager::PoolManager;
pub use service::DevicePluginService;
pub use service::HandoffSettings;
pub use service::PodResourcesSettings;
pub use shared::PoolShared;
pub use state::PoolState;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no host interface matches the selection criteria of pool {0}")]
    NoDevices(String),
    #[error("device discovery failed for pool {0}")]
    Discovery(String),
    #[error("failed to serve the device plugin endpoint {}", .0.display())]
    Bind(PathBuf),
    #[error("failed to register {0} with the kubelet")]
    Registration(String),
    #[error("invalid pool state transition {from} -> {to}")]
    InvalidTransition { from: PoolState, to: PoolState },
    #[error("pool {0} did not terminate cleanly")]
    Terminate(String),
}
