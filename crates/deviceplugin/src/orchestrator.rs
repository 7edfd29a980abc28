//! Process lifecycle: config, logging, host gate, pool fan-out and teardown.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::future::join_all;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::version;

use crate::config::Cli;
use crate::config::PluginConfig;
use crate::config::PluginPaths;
use crate::config::PoolConfig;
use crate::config::Tunables;
use crate::host;
use crate::host::HostHandler;
use crate::host::LinuxHost;
use crate::logging::LogHandle;
use crate::net::AfXdpSocketFactory;
use crate::net::NetHandler;
use crate::net::SocketFactory;
use crate::net::SysfsNet;
use crate::pool::PoolError;
use crate::pool::PoolManager;

/// Process exit status, stable values for supervisors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ExitStatus {
    /// Includes a host that does not meet the requirements.
    #[display("normal")]
    Normal = 0,
    #[display("config error")]
    ConfigError = 1,
    #[display("logging error")]
    LogError = 2,
    #[display("host error")]
    HostError = 3,
    #[display("pool error")]
    PoolError = 4,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        Self::from(status.code())
    }
}

/// The host seams every component is built on.
#[derive(Clone)]
pub struct Handlers {
    pub host: Arc<dyn HostHandler>,
    pub net: Arc<dyn NetHandler>,
    pub sockets: Arc<dyn SocketFactory>,
}

impl Handlers {
    /// Handlers talking to the real kernel.
    pub fn linux() -> Self {
        Self {
            host: Arc::new(LinuxHost::new()),
            net: Arc::new(SysfsNet::default()),
            sockets: Arc::new(AfXdpSocketFactory),
        }
    }
}

/// What the orchestrator needs from a pool at shutdown.
pub trait ManagedPool: Send {
    fn name(&self) -> &str;

    fn terminate(&mut self) -> impl Future<Output = Result<(), Report<PoolError>>> + Send;
}

impl ManagedPool for PoolManager {
    fn name(&self) -> &str {
        PoolManager::name(self)
    }

    fn terminate(&mut self) -> impl Future<Output = Result<(), Report<PoolError>>> + Send {
        PoolManager::terminate(self)
    }
}

/// Initialized pools by name. Built once, then only iterated.
pub type PoolRegistry<P = PoolManager> = BTreeMap<String, P>;

pub struct Orchestrator {
    config_file: PathBuf,
    log_dir: PathBuf,
    paths: Arc<PluginPaths>,
    handlers: Handlers,
    logging: Option<LogHandle>,
}

impl Orchestrator {
    pub fn new(config_file: PathBuf, log_dir: PathBuf, paths: PluginPaths, handlers: Handlers) -> Self {
        Self {
            config_file,
            log_dir,
            paths: Arc::new(paths),
            handlers,
            logging: None,
        }
    }

    pub fn from_cli(cli: &Cli, handlers: Handlers) -> Self {
        Self::new(
            cli.config.clone(),
            cli.log_dir.clone(),
            PluginPaths::from(cli),
            handlers,
        )
    }

    /// Applies the configured level and log file to `handle` once the config
    /// file is read.
    pub fn with_logging(mut self, handle: LogHandle) -> Self {
        self.logging = Some(handle);
        self
    }

    /// Runs the plugin until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> ExitStatus {
        let config = match PluginConfig::load(&self.config_file) {
            Ok(config) => config,
            Err(e) => {
                error!("Error getting device plugin config: {e:?}");
                return ExitStatus::ConfigError;
            }
        };
        let tunables = match config.tunables() {
            Ok(tunables) => tunables,
            Err(e) => {
                error!("Error getting device plugin config: {e:?}");
                return ExitStatus::ConfigError;
            }
        };

        if let Some(logging) = &mut self.logging {
            if let Err(e) = logging.apply(&config, &self.log_dir) {
                error!("Error configuring logging: {e}");
                return ExitStatus::LogError;
            }
        }

        match utils::fs::remove_file_if_exists(&config.device_file) {
            Ok(true) => info!("Removed stale device file {}", config.device_file.display()),
            Ok(false) => {}
            Err(e) => error!("Error deleting device file: {e}"),
        }

        info!("Starting AF_XDP device plugin {}", &**version::VERSION);

        info!("Checking if host meets requirements");
        match host::check_host(self.handlers.host.as_ref()) {
            Ok(true) => info!("Host meets requirements"),
            Ok(false) => {
                info!("Host does not meet requirements");
                return ExitStatus::Normal;
            }
            Err(e) => {
                error!("Error checking host: {e:?}");
                return ExitStatus::HostError;
            }
        }

        info!("Getting device pools");
        let pools = match config.validate_pools() {
            Ok(pools) => pools,
            Err(e) => {
                warn!("Error getting device pools: {e:?}");
                return ExitStatus::PoolError;
            }
        };

        let mut registry = self.init_pools(pools, tunables).await;
        if registry.is_empty() {
            warn!("No device pool could be initialized");
        } else {
            info!(pools = ?registry.keys().collect::<Vec<_>>(), "Device pools serving");
        }

        shutdown.await;
        info!("Termination requested");

        terminate_all(&mut registry, tunables.shutdown_grace).await;
        ExitStatus::Normal
    }

    /// Initializes every pool concurrently. Pools that fail are logged and
    /// left out.
    async fn init_pools(&self, configs: Vec<PoolConfig>, tunables: Tunables) -> PoolRegistry {
        let mut managers = configs
            .into_iter()
            .map(|config| {
                PoolManager::new(
                    config,
                    self.paths.clone(),
                    tunables,
                    self.handlers.net.clone(),
                    self.handlers.sockets.clone(),
                )
            })
            .collect::<Vec<_>>();

        let results = join_all(managers.iter_mut().map(|manager| manager.init())).await;

        let mut registry = PoolRegistry::new();
        for (manager, result) in managers.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    registry.insert(manager.name().to_string(), manager);
                }
                Err(e) => error!("Error initializing pool {}: {e:?}", manager.name()),
            }
        }
        registry
    }
}

/// Terminates every pool concurrently, waiting at most `grace`. Returns
/// whether all of them finished in time.
pub async fn terminate_all<P: ManagedPool>(pools: &mut PoolRegistry<P>, grace: Duration) -> bool {
    let terminations = pools.values_mut().map(|pool| async move {
        info!("Terminating {}", pool.name());
        if let Err(e) = pool.terminate().await {
            error!("Termination error in pool {}: {e:?}", pool.name());
        }
    });

    match tokio::time::timeout(grace, join_all(terminations)).await {
        Ok(_) => true,
        Err(_) => {
            warn!("Pools did not terminate within {grace:?}");
            false
        }
    }
}
