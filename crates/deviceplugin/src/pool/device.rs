use std::sync::Arc;

use device_plugin_pb::api;

/// Device health as advertised to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Health {
    #[display("{}", api::HEALTHY)]
    Healthy,
    #[display("{}", api::UNHEALTHY)]
    Unhealthy,
}

/// Identifies one Allocate call's binding of devices to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub struct AllocationId(uuid::Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of the socket handoff of an allocated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// The session is open and waits for the workload.
    Pending,
    /// The workload received its socket.
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Free,
    Allocated {
        allocation: AllocationId,
        handoff: HandoffState,
    },
}

/// One allocatable interface of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub health: Health,
    pub assignment: Assignment,
}

impl Device {
    pub fn new(id: impl Into<String>, health: Health) -> Self {
        Self {
            id: id.into(),
            health,
            assignment: Assignment::Free,
        }
    }

    pub fn is_free(&self) -> bool {
        self.assignment == Assignment::Free
    }

    /// Allocated and its socket already handed to the workload.
    pub fn is_consumed(&self) -> bool {
        matches!(
            self.assignment,
            Assignment::Allocated {
                handoff: HandoffState::Consumed,
                ..
            }
        )
    }

    pub fn allocation(&self) -> Option<AllocationId> {
        match self.assignment {
            Assignment::Free => None,
            Assignment::Allocated { allocation, .. } => Some(allocation),
        }
    }
}

/// What ListAndWatch reports for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub id: String,
    pub health: Health,
}

/// Full device list of a pool at one point in time, ordered by id.
pub type DeviceSnapshot = Arc<Vec<DeviceStatus>>;

impl From<&DeviceStatus> for api::Device {
    fn from(status: &DeviceStatus) -> Self {
        api::Device {
            id: status.id.clone(),
            health: status.health.to_string(),
            topology: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_uses_kubelet_wire_values() {
        assert_eq!(Health::Healthy.to_string(), "Healthy");
        assert_eq!(Health::Unhealthy.to_string(), "Unhealthy");
    }

    #[test]
    fn status_converts_to_api_device() {
        let status = DeviceStatus {
            id: "ens1".to_string(),
            health: Health::Unhealthy,
        };
        let device = api::Device::from(&status);
        assert_eq!(device.id, "ens1");
        assert_eq!(device.health, "Unhealthy");
        assert!(device.topology.is_none());
    }
}
