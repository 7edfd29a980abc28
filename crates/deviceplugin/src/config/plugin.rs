use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use thiserror::Error;

use super::pool::PoolConfig;
use crate::constants;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", .0.display())]
    Read(PathBuf),
    #[error("failed to parse config file {}", .0.display())]
    Parse(PathBuf),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("no device pools are defined")]
    NoPools,
    #[error("pool name {0:?} is defined more than once")]
    DuplicatePool(String),
    #[error("pool {pool:?} is invalid: {reason}")]
    InvalidPool { pool: String, reason: String },
}

/// Process-wide settings read from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginConfig {
    /// Log file name inside the log directory, empty for stdout only.
    #[serde(default)]
    pub log_file: String,
    /// Log level, empty keeps the default.
    #[serde(default)]
    pub log_level: String,
    /// Coordination file of a previous run, removed at startup.
    #[serde(default = "default_device_file")]
    pub device_file: PathBuf,
    #[serde(default)]
    keep_alive_secs: Option<u64>,
    #[serde(default)]
    health_check_secs: Option<u64>,
    #[serde(default)]
    reconcile_secs: Option<u64>,
    #[serde(default)]
    shutdown_grace_secs: Option<u64>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

fn default_device_file() -> PathBuf {
    PathBuf::from(constants::DEFAULT_DEVICE_FILE)
}

/// Operational intervals, all strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// Full snapshot re-send interval on every ListAndWatch stream.
    pub keep_alive: Duration,
    /// Device discovery and health check interval.
    pub health_check: Duration,
    /// Pod-resources reconciliation interval.
    pub reconcile: Duration,
    /// Upper bound on pool termination at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            keep_alive: constants::DEFAULT_KEEP_ALIVE,
            health_check: constants::DEFAULT_HEALTH_CHECK,
            reconcile: constants::DEFAULT_RECONCILE,
            shutdown_grace: constants::DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl PluginConfig {
    /// Reads and parses the config file. Pool definitions are only checked
    /// syntactically here; see [`PluginConfig::validate_pools`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report<ConfigError>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .change_context_lazy(|| ConfigError::Read(path.to_path_buf()))?;
        Self::parse_at(&raw, path)
    }

    pub fn parse(raw: &str) -> Result<Self, Report<ConfigError>> {
        Self::parse_at(raw, Path::new("<inline>"))
    }

    fn parse_at(raw: &str, origin: &Path) -> Result<Self, Report<ConfigError>> {
        let config: Self = serde_json::from_str(raw)
            .change_context_lazy(|| ConfigError::Parse(origin.to_path_buf()))?;
        config
            .tunables()
            .attach_printable_lazy(|| format!("config file: {}", origin.display()))?;
        Ok(config)
    }

    pub fn tunables(&self) -> Result<Tunables, Report<ConfigError>> {
        let defaults = Tunables::default();
        Ok(Tunables {
            keep_alive: secs("keepAliveSecs", self.keep_alive_secs, defaults.keep_alive)?,
            health_check: secs(
                "healthCheckSecs",
                self.health_check_secs,
                defaults.health_check,
            )?,
            reconcile: secs("reconcileSecs", self.reconcile_secs, defaults.reconcile)?,
            shutdown_grace: secs(
                "shutdownGraceSecs",
                self.shutdown_grace_secs,
                defaults.shutdown_grace,
            )?,
        })
    }

    /// Checks every pool definition and the uniqueness of pool names.
    pub fn validate_pools(&self) -> Result<Vec<PoolConfig>, Report<ConfigError>> {
        if self.pools.is_empty() {
            return Err(Report::new(ConfigError::NoPools));
        }

        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.name.as_str()) {
                return Err(Report::new(ConfigError::DuplicatePool(pool.name.clone())));
            }
        }

        Ok(self.pools.clone())
    }
}

fn secs(
    field: &'static str,
    value: Option<u64>,
    default: Duration,
) -> Result<Duration, Report<ConfigError>> {
    match value {
        None => Ok(default),
        Some(0) => Err(Report::new(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        })),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}
