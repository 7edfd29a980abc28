use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use super::device::Assignment;
use super::device::AllocationId;
use super::device::Device;
use super::device::DeviceSnapshot;
use super::device::DeviceStatus;
use super::device::HandoffState;
use super::device::Health;

/// Why an allocation request was refused. No device changes state when one
/// of these is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocation request names no devices")]
    Empty,
    #[error("device {0} is requested more than once")]
    Duplicate(String),
    #[error("device {0} is not part of this pool")]
    UnknownDevice(String),
    #[error("device {0} is unhealthy")]
    Unhealthy(String),
    #[error("device {0} is already allocated")]
    AlreadyAllocated(String),
}

/// Result of folding one discovery pass into the pool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub health_changed: Vec<String>,
}

impl SyncOutcome {
    /// Whether ListAndWatch subscribers need a new snapshot.
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.health_changed.is_empty())
    }
}

/// Device bookkeeping of one pool. Pure state, locking is the caller's job.
#[derive(Debug, Clone)]
pub struct DevicePool {
    devices: BTreeMap<String, Device>,
}

impl DevicePool {
    /// Builds a pool from discovered devices. Later duplicates of an id are
    /// ignored so ids stay unique.
    pub fn new<I>(devices: I) -> Self
    where
        I: IntoIterator<Item = (String, Health)>,
    {
        let mut map = BTreeMap::new();
        for (id, health) in devices {
            map.entry(id.clone()).or_insert_with(|| Device::new(id, health));
        }
        Self { devices: map }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// No devices at all, or at least one unhealthy device.
    pub fn is_degraded(&self) -> bool {
        self.devices.is_empty() || self.devices.values().any(|d| d.health == Health::Unhealthy)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        Arc::new(
            self.devices
                .values()
                .map(|d| DeviceStatus {
                    id: d.id.clone(),
                    health: d.health,
                })
                .collect(),
        )
    }

    /// Allocates every device in `ids` or none of them.
    pub fn allocate(&mut self, ids: &[String], allocation: AllocationId) -> Result<(), AllocationError> {
        if ids.is_empty() {
            return Err(AllocationError::Empty);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(AllocationError::Duplicate(id.clone()));
            }
            let device = self
                .devices
                .get(id)
                .ok_or_else(|| AllocationError::UnknownDevice(id.clone()))?;
            if !device.is_free() {
                return Err(AllocationError::AlreadyAllocated(id.clone()));
            }
            if device.health != Health::Healthy {
                return Err(AllocationError::Unhealthy(id.clone()));
            }
        }

        for id in ids {
            if let Some(device) = self.devices.get_mut(id) {
                device.assignment = Assignment::Allocated {
                    allocation,
                    handoff: HandoffState::Pending,
                };
            }
        }
        Ok(())
    }

    /// Records that the workload of `allocation` received the socket of `id`.
    pub fn mark_consumed(&mut self, id: &str, allocation: AllocationId) -> bool {
        match self.devices.get_mut(id) {
            Some(device) if device.allocation() == Some(allocation) => {
                device.assignment = Assignment::Allocated {
                    allocation,
                    handoff: HandoffState::Consumed,
                };
                true
            }
            _ => false,
        }
    }

    /// Frees the devices of `ids` that are still held by `allocation`.
    pub fn release<'a, I>(&mut self, ids: I, allocation: AllocationId) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut released = Vec::new();
        for id in ids {
            if let Some(device) = self.devices.get_mut(id) {
                if device.allocation() == Some(allocation) {
                    device.assignment = Assignment::Free;
                    released.push(id.to_string());
                }
            }
        }
        released
    }

    /// Frees every allocated device, returns how many were freed.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for device in self.devices.values_mut() {
            if !device.is_free() {
                device.assignment = Assignment::Free;
                released += 1;
            }
        }
        released
    }

    /// Frees devices whose socket was handed over but that no container holds
    /// any more. Pending handoffs are left to their session timeout.
    pub fn release_unused(&mut self, in_use: &HashSet<String>) -> Vec<String> {
        let mut released = Vec::new();
        for device in self.devices.values_mut() {
            if device.is_consumed() && !in_use.contains(&device.id) {
                device.assignment = Assignment::Free;
                released.push(device.id.clone());
            }
        }
        released
    }

    /// Whether any of `ids` has had its socket handed over.
    pub fn any_consumed(&self, ids: &[String]) -> bool {
        ids.iter()
            .any(|id| self.devices.get(id).is_some_and(Device::is_consumed))
    }

    /// Frees the consumed devices among `ids`. Pending handoffs are kept.
    pub fn release_consumed(&mut self, ids: &[String]) -> Vec<String> {
        let mut released = Vec::new();
        for id in ids {
            if let Some(device) = self.devices.get_mut(id) {
                if device.is_consumed() {
                    device.assignment = Assignment::Free;
                    released.push(id.clone());
                }
            }
        }
        released
    }

    /// Folds the currently selected interfaces into the pool: new ones are
    /// added, vanished ones removed and health updated.
    pub fn sync(&mut self, observed: &[(String, Health)]) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let observed_ids = observed.iter().map(|(id, _)| id.as_str()).collect::<HashSet<_>>();

        self.devices.retain(|id, _| {
            let keep = observed_ids.contains(id.as_str());
            if !keep {
                outcome.removed.push(id.clone());
            }
            keep
        });

        for (id, health) in observed {
            match self.devices.get_mut(id) {
                Some(device) => {
                    if device.health != *health {
                        device.health = *health;
                        outcome.health_changed.push(id.clone());
                    }
                }
                None => {
                    self.devices.insert(id.clone(), Device::new(id.clone(), *health));
                    outcome.added.push(id.clone());
                }
            }
        }

        outcome
    }

    /// Preferred devices for one container: the mandatory ones first, then
    /// free healthy ones from `available` in id order, up to `size`.
    pub fn preferred(&self, available: &[String], must_include: &[String], size: usize) -> Vec<String> {
        let mut chosen = must_include.to_vec();
        let mut candidates = available
            .iter()
            .filter(|id| !must_include.contains(id))
            .filter(|id| {
                self.devices
                    .get(id.as_str())
                    .is_some_and(|d| d.is_free() && d.health == Health::Healthy)
            })
            .cloned()
            .collect::<Vec<_>>();
        candidates.sort();

        for id in candidates {
            if chosen.len() >= size {
                break;
            }
            chosen.push(id);
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn pool() -> DevicePool {
        DevicePool::new([
            ("eth-pool-0".to_string(), Health::Healthy),
            ("eth-pool-1".to_string(), Health::Healthy),
            ("eth-pool-2".to_string(), Health::Unhealthy),
        ])
    }

    fn assignments(pool: &DevicePool) -> Vec<Assignment> {
        pool.devices().map(|d| d.assignment).collect()
    }

    #[test]
    fn duplicate_ids_are_collapsed() {
        let pool = DevicePool::new([
            ("a".to_string(), Health::Healthy),
            ("a".to_string(), Health::Unhealthy),
        ]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get("a").unwrap().health, Health::Healthy);
    }

    #[test]
    fn allocates_all_available_devices() {
        let mut pool = pool();
        let allocation = AllocationId::new();

        pool.allocate(&ids(&["eth-pool-0", "eth-pool-1"]), allocation).unwrap();

        for id in ["eth-pool-0", "eth-pool-1"] {
            assert_eq!(
                pool.get(id).unwrap().assignment,
                Assignment::Allocated {
                    allocation,
                    handoff: HandoffState::Pending
                }
            );
        }
        assert!(pool.get("eth-pool-2").unwrap().is_free());
    }

    #[test]
    fn allocation_is_atomic() {
        let mut pool = pool();
        let first = AllocationId::new();
        pool.allocate(&ids(&["eth-pool-1"]), first).unwrap();
        let before = assignments(&pool);

        let cases = [
            (ids(&["eth-pool-0", "eth-pool-1"]), AllocationError::AlreadyAllocated("eth-pool-1".into())),
            (ids(&["eth-pool-0", "eth-pool-2"]), AllocationError::Unhealthy("eth-pool-2".into())),
            (ids(&["eth-pool-0", "missing"]), AllocationError::UnknownDevice("missing".into())),
            (ids(&["eth-pool-0", "eth-pool-0"]), AllocationError::Duplicate("eth-pool-0".into())),
            (Vec::new(), AllocationError::Empty),
        ];

        for (request, expected) in cases {
            let err = pool.allocate(&request, AllocationId::new()).unwrap_err();
            assert_eq!(err, expected);
            assert_eq!(assignments(&pool), before, "request {request:?} mutated the pool");
        }
    }

    #[test]
    fn release_only_frees_own_allocation() {
        let mut pool = pool();
        let first = AllocationId::new();
        let second = AllocationId::new();
        pool.allocate(&ids(&["eth-pool-0"]), first).unwrap();
        pool.allocate(&ids(&["eth-pool-1"]), second).unwrap();

        let released = pool.release(["eth-pool-0", "eth-pool-1"], first);

        assert_eq!(released, ids(&["eth-pool-0"]));
        assert!(pool.get("eth-pool-0").unwrap().is_free());
        assert_eq!(pool.get("eth-pool-1").unwrap().allocation(), Some(second));
        assert_eq!(pool.release_all(), 1);
        assert!(pool.devices().all(Device::is_free));
    }

    #[test]
    fn release_unused_skips_pending_and_in_use() {
        let mut pool = DevicePool::new(["a", "b", "c"].map(|id| (id.to_string(), Health::Healthy)));
        let allocation = AllocationId::new();
        pool.allocate(&ids(&["a", "b", "c"]), allocation).unwrap();
        assert!(pool.mark_consumed("a", allocation));
        assert!(pool.mark_consumed("b", allocation));
        assert!(!pool.mark_consumed("b", AllocationId::new()));

        let in_use = HashSet::from(["b".to_string()]);
        assert_eq!(pool.release_unused(&in_use), ids(&["a"]));
        assert!(pool.get("a").unwrap().is_free());
        assert!(!pool.get("b").unwrap().is_free());
        assert!(!pool.get("c").unwrap().is_free(), "pending handoff must stay allocated");
    }

    #[test]
    fn release_consumed_keeps_pending_handoffs() {
        let mut pool = DevicePool::new(["a", "b", "c"].map(|id| (id.to_string(), Health::Healthy)));
        let allocation = AllocationId::new();
        pool.allocate(&ids(&["a", "b"]), allocation).unwrap();
        assert!(pool.mark_consumed("a", allocation));

        assert!(pool.any_consumed(&ids(&["a", "c"])));
        assert!(!pool.any_consumed(&ids(&["b", "c", "zz"])));

        assert_eq!(pool.release_consumed(&ids(&["a", "b", "c"])), ids(&["a"]));
        assert!(pool.get("a").unwrap().is_free());
        assert!(!pool.get("b").unwrap().is_free());
        assert!(!pool.any_consumed(&ids(&["a"])));
    }

    #[test]
    fn sync_tracks_health_and_membership() {
        let mut pool = pool();
        let allocation = AllocationId::new();
        pool.allocate(&ids(&["eth-pool-0"]), allocation).unwrap();

        let outcome = pool.sync(&[
            ("eth-pool-0".to_string(), Health::Unhealthy),
            ("eth-pool-2".to_string(), Health::Unhealthy),
            ("eth-pool-3".to_string(), Health::Healthy),
        ]);

        assert_eq!(
            outcome,
            SyncOutcome {
                added: ids(&["eth-pool-3"]),
                removed: ids(&["eth-pool-1"]),
                health_changed: ids(&["eth-pool-0"]),
            }
        );
        assert!(outcome.changed());

        // health is tracked independently of the allocation
        let device = pool.get("eth-pool-0").unwrap();
        assert_eq!(device.health, Health::Unhealthy);
        assert_eq!(device.allocation(), Some(allocation));

        let snapshot = pool.snapshot();
        assert_eq!(
            *snapshot,
            vec![
                DeviceStatus { id: "eth-pool-0".into(), health: Health::Unhealthy },
                DeviceStatus { id: "eth-pool-2".into(), health: Health::Unhealthy },
                DeviceStatus { id: "eth-pool-3".into(), health: Health::Healthy },
            ]
        );
        assert!(pool.is_degraded());
    }

    #[test]
    fn sync_without_changes_reports_nothing() {
        let mut pool = pool();
        let observed = pool
            .devices()
            .map(|d| (d.id.clone(), d.health))
            .collect::<Vec<_>>();
        assert!(!pool.sync(&observed).changed());
    }

    #[test]
    fn degraded_when_empty_or_unhealthy() {
        assert!(DevicePool::new([]).is_degraded());
        assert!(!DevicePool::new([("a".to_string(), Health::Healthy)]).is_degraded());
        assert!(pool().is_degraded());
    }

    #[test]
    fn preferred_puts_mandatory_first() {
        let mut pool = DevicePool::new(["a", "b", "c", "d"].map(|id| (id.to_string(), Health::Healthy)));
        pool.allocate(&ids(&["b"]), AllocationId::new()).unwrap();

        let preferred = pool.preferred(&ids(&["d", "c", "b", "a"]), &ids(&["d"]), 3);
        assert_eq!(preferred, ids(&["d", "a", "c"]));
    }
}
