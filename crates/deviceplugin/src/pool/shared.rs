use std::collections::HashSet;

use error_stack::Report;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::AllocationId;
use super::DevicePool;
use super::DeviceSnapshot;
use super::Health;
use super::PoolError;
use super::PoolState;
use super::SyncOutcome;
use crate::handoff::SessionLedger;

/// Device snapshots buffered per ListAndWatch subscriber before it lags.
const UPDATE_CAPACITY: usize = 16;

/// State of one pool shared by its service, background tasks and handoff
/// endpoints.
///
/// Every device mutation happens under `devices`. Updates are broadcast while
/// the lock is still held, so subscribers see them in mutation order and a
/// new subscriber can take a snapshot and subscribe without missing one.
#[derive(Debug)]
pub struct PoolShared {
    name: String,
    devices: Mutex<DevicePool>,
    updates: broadcast::Sender<DeviceSnapshot>,
    state: watch::Sender<PoolState>,
}

impl PoolShared {
    pub fn new(name: impl Into<String>, devices: DevicePool) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (state, _) = watch::channel(PoolState::Uninitialized);
        Self {
            name: name.into(),
            devices: Mutex::new(devices),
            updates,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, DevicePool> {
        self.devices.lock().await
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        self.devices.lock().await.snapshot()
    }

    /// Current device list plus a receiver for every later change.
    pub async fn subscribe(&self) -> (DeviceSnapshot, broadcast::Receiver<DeviceSnapshot>) {
        let devices = self.devices.lock().await;
        (devices.snapshot(), self.updates.subscribe())
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn transition(&self, next: PoolState) -> Result<(), Report<PoolError>> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(pool = %self.name, "state {current} -> {next}");
                *current = next;
                true
            } else {
                result = Err(Report::new(PoolError::InvalidTransition {
                    from: *current,
                    to: next,
                }));
                false
            }
        });
        result
    }

    /// Folds one discovery pass into the pool. Changes are broadcast and a
    /// live pool toggles between `Serving` and `Degraded`.
    pub async fn apply_observation(&self, observed: &[(String, Health)]) -> SyncOutcome {
        let mut devices = self.devices.lock().await;
        let outcome = devices.sync(observed);
        if !outcome.changed() {
            return outcome;
        }

        info!(
            pool = %self.name,
            added = ?outcome.added,
            removed = ?outcome.removed,
            health_changed = ?outcome.health_changed,
            "device set changed"
        );
        // no subscribers is fine
        let _ = self.updates.send(devices.snapshot());
        self.update_liveness(devices.is_degraded());
        outcome
    }

    /// Moves a live pool to `Degraded` or back to `Serving`.
    pub fn update_liveness(&self, degraded: bool) {
        let target = if degraded {
            PoolState::Degraded
        } else {
            PoolState::Serving
        };
        let current = self.state();
        if current.is_live() && current != target {
            if degraded {
                warn!(pool = %self.name, "pool degraded");
            } else {
                info!(pool = %self.name, "pool healthy again");
            }
            if let Err(e) = self.transition(target) {
                debug!(pool = %self.name, "liveness update skipped: {e:?}");
            }
        }
    }

    /// Frees consumed devices no container holds any more.
    pub async fn release_unused(&self, in_use: &HashSet<String>) -> Vec<String> {
        let released = self.devices.lock().await.release_unused(in_use);
        if !released.is_empty() {
            info!(pool = %self.name, devices = ?released, "released devices of ended workloads");
        }
        released
    }

    /// Frees consumed devices among `ids` without asking the kubelet.
    pub async fn release_consumed(&self, ids: &[String]) -> Vec<String> {
        self.devices.lock().await.release_consumed(ids)
    }

    pub async fn release_all(&self) -> usize {
        self.devices.lock().await.release_all()
    }
}

impl SessionLedger for PoolShared {
    async fn consumed(&self, allocation: AllocationId, device: &str) {
        if !self.devices.lock().await.mark_consumed(device, allocation) {
            debug!(pool = %self.name, device, "consumed device no longer held by {allocation}");
        }
    }

    async fn reclaimed(&self, allocation: AllocationId, devices: Vec<String>) {
        let released = self
            .devices
            .lock()
            .await
            .release(devices.iter().map(String::as_str), allocation);
        info!(pool = %self.name, devices = ?released, "reclaimed devices of expired handoff");
    }
}
