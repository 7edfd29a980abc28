//! Hands a live AF_XDP socket from the plugin to a workload.
//!
//! Every container allocation gets its own Unix stream endpoint holding one
//! session per allocated device. The workload connects, names a device and
//! receives the socket over `SCM_RIGHTS`:
//!
//! ```text
//! client: /xsk_fd,<device>\n
//! server: /fd_ack\n        + fd   (session consumed)
//! server: /fd_nak,<reason>\n      (unknown, consumed or expired device)
//! ```

mod client;
mod endpoint;
mod fd;
mod protocol;

use std::future::Future;
use std::io;

use thiserror::Error;

pub use client::request_socket;
pub use endpoint::HandoffEndpoint;
pub use endpoint::HandoffSession;
pub use protocol::Request;
pub use protocol::Response;

use crate::pool::AllocationId;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to connect to handoff endpoint")]
    Connect(#[source] io::Error),
    #[error("handoff I/O failed")]
    Io(#[from] io::Error),
    #[error("handoff peer did not answer in time")]
    Timeout,
    #[error("malformed handoff message: {0:?}")]
    Malformed(String),
    #[error("handoff rejected: {0}")]
    Rejected(String),
    #[error("handoff acknowledged without a socket attached")]
    MissingFd,
}

/// Receives the outcome of handoff sessions. Implemented by the pool that
/// owns the allocated devices.
pub trait SessionLedger: Send + Sync + 'static {
    /// The socket of `device` reached its workload.
    fn consumed(&self, allocation: AllocationId, device: &str) -> impl Future<Output = ()> + Send;

    /// Sessions of `devices` ended unconsumed; the devices are free again.
    fn reclaimed(&self, allocation: AllocationId, devices: Vec<String>) -> impl Future<Output = ()> + Send;
}
