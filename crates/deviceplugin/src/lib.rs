//! Kubernetes device plugin that hands AF_XDP sockets to pods.

pub mod config;
pub mod constants;
pub mod handoff;
pub mod host;
pub mod kubelet;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod net;
pub mod orchestrator;
pub mod pool;
