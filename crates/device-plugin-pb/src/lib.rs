//! gRPC bindings for the kubelet device plugin API.

#![allow(clippy::doc_markdown)]

/// `k8s.io/kubelet/pkg/apis/deviceplugin/v1beta1`
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");

    /// Version string sent in registration requests.
    pub const VERSION: &str = "v1beta1";
    /// Health value of a usable device.
    pub const HEALTHY: &str = "Healthy";
    /// Health value of a device that must not be allocated.
    pub const UNHEALTHY: &str = "Unhealthy";
    /// Socket file name of the kubelet registration service.
    pub const KUBELET_SOCKET: &str = "kubelet.sock";
}

/// `k8s.io/kubelet/pkg/apis/podresources/v1`
pub mod pod_resources {
    tonic::include_proto!("v1");
}
