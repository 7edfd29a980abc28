use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::PoolShared;
use crate::kubelet;

/// Periodically frees devices whose workload is gone.
pub async fn run(
    shared: Arc<PoolShared>,
    pod_resources_socket: &Path,
    resource_name: &str,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                reconcile_once(&shared, pod_resources_socket, resource_name).await;
            }
        }
    }
}

/// Releases consumed devices the kubelet no longer reports as held by a
/// container. Returns `None` when the kubelet could not be asked.
pub async fn reconcile_once(
    shared: &PoolShared,
    pod_resources_socket: &Path,
    resource_name: &str,
) -> Option<Vec<String>> {
    if !pod_resources_socket.exists() {
        debug!(
            path = %pod_resources_socket.display(),
            "pod resources socket absent, skipping reconciliation"
        );
        return None;
    }

    match kubelet::devices_in_use(pod_resources_socket, resource_name).await {
        Ok(in_use) => Some(shared.release_unused(&in_use).await),
        Err(e) => {
            warn!(pool = shared.name(), "failed to query pod resources: {e:?}");
            None
        }
    }
}
