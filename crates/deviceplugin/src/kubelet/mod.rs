//! Client side of the kubelet sockets: registration, pod resources and the
//! restart watcher.

mod channel;
mod pod_resources;
mod registration;
mod watcher;

use std::path::PathBuf;

use thiserror::Error;

pub use channel::connect_uds;
pub use pod_resources::devices_in_use;
pub use registration::register;
pub use watcher::KubeletWatcher;

#[derive(Debug, Error)]
pub enum KubeletError {
    #[error("failed to connect to {}", .0.display())]
    Connect(PathBuf),
    #[error("timed out connecting to {}", .0.display())]
    Timeout(PathBuf),
    #[error("kubelet rejected the registration of {0}")]
    Registration(String),
    #[error("failed to list pod resources")]
    PodResources,
    #[error("failed to watch {}", .0.display())]
    Watch(PathBuf),
}
