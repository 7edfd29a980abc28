use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::discovery;
use super::reconcile;
use super::DevicePluginService;
use super::DevicePool;
use super::HandoffSettings;
use super::Health;
use super::PodResourcesSettings;
use super::PoolError;
use super::PoolShared;
use super::PoolState;
use crate::config::PluginPaths;
use crate::config::PoolConfig;
use crate::config::Tunables;
use crate::kubelet;
use crate::kubelet::KubeletWatcher;
use crate::net::NetHandler;
use crate::net::SocketFactory;

/// Registration attempts after a kubelet restart, one second apart.
const REREGISTER_ATTEMPTS: usize = 5;

/// Drives one pool from discovery to teardown.
pub struct PoolManager {
    config: PoolConfig,
    paths: Arc<PluginPaths>,
    tunables: Tunables,
    net: Arc<dyn NetHandler>,
    sockets: Arc<dyn SocketFactory>,
    shared: Arc<PoolShared>,
    /// Parent of every task, server and handoff endpoint of the pool.
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        paths: Arc<PluginPaths>,
        tunables: Tunables,
        net: Arc<dyn NetHandler>,
        sockets: Arc<dyn SocketFactory>,
    ) -> Self {
        let shared = Arc::new(PoolShared::new(config.name.clone(), DevicePool::new([])));
        Self {
            config,
            paths,
            tunables,
            net,
            sockets,
            shared,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// The pool's gRPC socket inside the device plugin directory.
    pub fn socket_path(&self) -> PathBuf {
        self.paths.device_plugin_dir.join(self.config.endpoint_name())
    }

    fn handoff_root(&self) -> PathBuf {
        self.paths.handoff_dir.join(&self.config.name)
    }

    /// Discovers devices, serves and registers the pool. On failure the pool
    /// ends up `Terminated` with nothing left behind.
    #[tracing::instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn init(&mut self) -> Result<(), Report<PoolError>> {
        self.shared.transition(PoolState::Initializing)?;

        if let Err(e) = self.start().await {
            self.token.cancel();
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
            if let Err(e) = utils::fs::remove_file_if_exists(self.socket_path()) {
                warn!("failed to remove device plugin socket: {e}");
            }
            if let Err(e) = self.shared.transition(PoolState::Terminated) {
                warn!("{e:?}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), Report<PoolError>> {
        let name = self.config.name.clone();
        let devices = discover_blocking(self.config.clone(), self.net.clone())
            .await
            .change_context_lazy(|| PoolError::Discovery(name.clone()))?;
        if devices.is_empty() {
            return Err(Report::new(PoolError::NoDevices(name)));
        }
        self.shared.apply_observation(&devices).await;
        info!(devices = ?devices, "discovered devices");

        let server_token = self.token.child_token();
        let service = DevicePluginService::new(
            self.shared.clone(),
            HandoffSettings {
                root: self.handoff_root(),
                timeout: self.config.handoff_timeout(),
                sockets: self.sockets.clone(),
                token: self.token.child_token(),
            },
            PodResourcesSettings {
                socket: self.paths.pod_resources_socket.clone(),
                resource_name: self.config.resource_name(),
            },
            self.tunables.keep_alive,
            server_token.clone(),
        );
        let socket_path = self.socket_path();
        let server = service
            .clone()
            .serve(&socket_path)
            .change_context_lazy(|| PoolError::Bind(socket_path.clone()))?;
        self.tasks.push(server);

        let registration = Registration {
            kubelet_socket: self.paths.kubelet_socket.clone(),
            endpoint: self.config.endpoint_name(),
            resource_name: self.config.resource_name(),
        };
        registration.register().await?;
        self.shared.transition(PoolState::Registered)?;

        self.spawn_health_monitor();
        self.spawn_reconciler();
        self.spawn_kubelet_watcher(service, server_token, registration);

        // under the device lock so a concurrent health pass cannot slip in
        let devices = self.shared.lock().await;
        let live = if devices.is_degraded() {
            PoolState::Degraded
        } else {
            PoolState::Serving
        };
        self.shared.transition(live)?;
        drop(devices);

        info!(resource = %self.config.resource_name(), "pool {live}");
        Ok(())
    }

    fn spawn_health_monitor(&mut self) {
        let shared = self.shared.clone();
        let net = self.net.clone();
        let config = self.config.clone();
        let period = self.tunables.health_check;
        let token = self.token.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match discover_blocking(config.clone(), net.clone()).await {
                        Ok(devices) => {
                            shared.apply_observation(&devices).await;
                        }
                        Err(e) => warn!(pool = %config.name, "device discovery failed, keeping last known state: {e}"),
                    },
                }
            }
        }));
    }

    fn spawn_reconciler(&mut self) {
        let shared = self.shared.clone();
        let socket = self.paths.pod_resources_socket.clone();
        let resource_name = self.config.resource_name();
        let period = self.tunables.reconcile;
        let token = self.token.clone();

        self.tasks.push(tokio::spawn(async move {
            reconcile::run(shared, &socket, &resource_name, period, token).await;
        }));
    }

    /// Rebinds the server and registers again whenever the kubelet restarts.
    fn spawn_kubelet_watcher(
        &mut self,
        service: DevicePluginService,
        mut server_token: CancellationToken,
        registration: Registration,
    ) {
        let mut watcher = match KubeletWatcher::new(&self.paths.kubelet_socket) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("kubelet restarts will not be detected: {e:?}");
                return;
            }
        };
        let socket_path = self.socket_path();
        let token = self.token.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut server: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    restarted = watcher.restarted() => {
                        if restarted.is_none() {
                            warn!("kubelet watcher stopped");
                            break;
                        }
                        info!("kubelet restarted, registering again");

                        server_token.cancel();
                        server_token = token.child_token();
                        match service.with_token(server_token.clone()).serve(&socket_path) {
                            Ok(handle) => server = Some(handle),
                            Err(e) => {
                                error!("failed to rebind device plugin server: {e}");
                                continue;
                            }
                        }
                        registration.register_with_retry().await;
                    }
                }
            }
            if let Some(server) = server {
                let _ = server.await;
            }
        }));
    }

    /// Stops advertising, cancels handoff sessions, frees every allocation and
    /// removes the pool's sockets. Errors are collected, never short-circuit.
    #[tracing::instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn terminate(&mut self) -> Result<(), Report<PoolError>> {
        match self.state() {
            PoolState::Terminated | PoolState::Uninitialized => return Ok(()),
            _ => {}
        }
        self.shared.transition(PoolState::Terminating)?;
        self.token.cancel();

        let mut failures = Vec::new();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                failures.push(format!("pool task failed: {e}"));
            }
        }

        let released = self.shared.release_all().await;
        if released > 0 {
            info!(released, "released outstanding allocations");
        }

        if let Err(e) = utils::fs::remove_file_if_exists(self.socket_path()) {
            failures.push(format!("failed to remove {}: {e}", self.socket_path().display()));
        }
        if let Err(e) = utils::fs::remove_dir_if_exists(self.handoff_root()) {
            failures.push(format!("failed to remove {}: {e}", self.handoff_root().display()));
        }

        self.shared.transition(PoolState::Terminated)?;

        if failures.is_empty() {
            info!("pool terminated");
            return Ok(());
        }
        let mut report = Report::new(PoolError::Terminate(self.config.name.clone()));
        for failure in failures {
            report = report.attach_printable(failure);
        }
        Err(report)
    }
}

/// Runs discovery off the async workers, sysfs reads block.
async fn discover_blocking(
    config: PoolConfig,
    net: Arc<dyn NetHandler>,
) -> io::Result<Vec<(String, Health)>> {
    tokio::task::spawn_blocking(move || discovery::discover(&config, net.as_ref()))
        .await
        .map_err(io::Error::other)?
}

/// What the pool tells the kubelet about itself.
struct Registration {
    kubelet_socket: PathBuf,
    endpoint: String,
    resource_name: String,
}

impl Registration {
    async fn register(&self) -> Result<(), Report<PoolError>> {
        kubelet::register(
            &self.kubelet_socket,
            &self.endpoint,
            &self.resource_name,
            DevicePluginService::options(),
        )
        .await
        .change_context_lazy(|| PoolError::Registration(self.resource_name.clone()))
    }

    /// A fresh kubelet socket may not accept connections right away.
    async fn register_with_retry(&self) {
        for attempt in 1..=REREGISTER_ATTEMPTS {
            match self.register().await {
                Ok(()) => return,
                Err(e) if attempt == REREGISTER_ATTEMPTS => {
                    error!("giving up registering with the restarted kubelet: {e:?}");
                }
                Err(e) => {
                    warn!(attempt, "registration with the restarted kubelet failed: {e:?}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
