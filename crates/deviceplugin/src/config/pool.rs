use std::time::Duration;

use error_stack::Report;
use serde::Deserialize;

use super::plugin::ConfigError;
use crate::constants;

/// How a selected interface is exposed to workloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// The whole physical netdev is one allocatable device.
    #[default]
    #[display("primary")]
    Primary,
}

/// Selects every interface bound to a kernel driver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DriverSelector {
    pub name: String,
    /// Maximum number of interfaces taken from this driver, in name order.
    #[serde(default)]
    pub primary: Option<usize>,
    #[serde(default)]
    pub exclude_devices: Vec<String>,
}

/// Selects one interface explicitly. Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceSelector {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub pci: Option<String>,
}

/// One device pool definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub mode: PoolMode,
    #[serde(default)]
    pub drivers: Vec<DriverSelector>,
    #[serde(default)]
    pub devices: Vec<DeviceSelector>,
    /// Seconds a handoff session waits for its workload.
    #[serde(default)]
    pub uds_timeout_secs: Option<u64>,
}

impl PoolConfig {
    /// A pool selecting devices of the given drivers, used by tests and tools.
    pub fn with_drivers<I, S>(name: impl Into<String>, drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            mode: PoolMode::Primary,
            drivers: drivers
                .into_iter()
                .map(|name| DriverSelector {
                    name: name.into(),
                    primary: None,
                    exclude_devices: Vec::new(),
                })
                .collect(),
            devices: Vec::new(),
            uds_timeout_secs: None,
        }
    }

    /// Resource name advertised to the kubelet.
    pub fn resource_name(&self) -> String {
        format!("{}/{}", constants::RESOURCE_PREFIX, self.name)
    }

    /// File name of the pool's gRPC socket inside the device plugin directory.
    pub fn endpoint_name(&self) -> String {
        format!("{}-{}.sock", constants::RESOURCE_PREFIX, self.name)
    }

    pub fn handoff_timeout(&self) -> Duration {
        self.uds_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(constants::DEFAULT_HANDOFF_TIMEOUT)
    }

    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |reason: &str| {
            Report::new(ConfigError::InvalidPool {
                pool: self.name.clone(),
                reason: reason.to_string(),
            })
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !is_resource_name(&self.name) {
            return Err(invalid(
                "name may only contain ASCII letters, digits, '-', '_' and '.', \
                 and must start and end with a letter or digit",
            ));
        }
        if self.drivers.is_empty() && self.devices.is_empty() {
            return Err(invalid("at least one driver or device selector is required"));
        }
        for driver in &self.drivers {
            if driver.name.is_empty() {
                return Err(invalid("driver name must not be empty"));
            }
            if driver.primary == Some(0) {
                return Err(invalid("driver primary count must be greater than zero"));
            }
        }
        for device in &self.devices {
            let set = [&device.name, &device.mac, &device.pci]
                .iter()
                .filter(|field| field.as_deref().is_some_and(|v| !v.is_empty()))
                .count();
            if set != 1 {
                return Err(invalid(
                    "each device selector needs exactly one of name, mac or pci",
                ));
            }
        }
        if self.uds_timeout_secs == Some(0) {
            return Err(invalid("udsTimeoutSecs must be greater than zero"));
        }

        Ok(())
    }
}

/// The kubelet's rule for the part of a resource name after the prefix:
/// `[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?`.
fn is_resource_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(raw: &str) -> PoolConfig {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn names_derive_from_pool_name() {
        let config = PoolConfig::with_drivers("fast", ["ice"]);
        assert_eq!(config.resource_name(), "afxdp/fast");
        assert_eq!(config.endpoint_name(), "afxdp-fast.sock");
        assert_eq!(config.handoff_timeout(), constants::DEFAULT_HANDOFF_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mode_defaults_to_primary_and_rejects_unknown() {
        assert_eq!(pool(r#"{ "name": "p", "drivers": [{"name": "ice"}] }"#).mode, PoolMode::Primary);
        assert!(serde_json::from_str::<PoolConfig>(r#"{ "name": "p", "mode": "cdq" }"#).is_err());
    }

    #[test]
    fn rejects_pool_without_selectors() {
        let err = pool(r#"{ "name": "p" }"#).validate().unwrap_err();
        assert!(matches!(err.current_context(), ConfigError::InvalidPool { pool, .. } if pool == "p"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(pool(r#"{ "name": "", "drivers": [{"name": "ice"}] }"#).validate().is_err());
        assert!(pool(r#"{ "name": "a/b", "drivers": [{"name": "ice"}] }"#).validate().is_err());
        assert!(pool(r#"{ "name": "a.b-c_1", "drivers": [{"name": "ice"}] }"#).validate().is_ok());
        assert!(pool(r#"{ "name": "x", "drivers": [{"name": "ice"}] }"#).validate().is_ok());
        for name in ["..", ".", "-a", "a_", "a.", "_a", "a b"] {
            let config = PoolConfig::with_drivers(name, ["ice"]);
            assert!(config.validate().is_err(), "{name:?} must be rejected");
        }
    }

    #[test]
    fn device_selector_needs_exactly_one_key() {
        assert!(pool(r#"{ "name": "p", "devices": [{}] }"#).validate().is_err());
        assert!(
            pool(r#"{ "name": "p", "devices": [{"name": "eth0", "mac": "aa:bb:cc:dd:ee:ff"}] }"#)
                .validate()
                .is_err()
        );
        assert!(pool(r#"{ "name": "p", "devices": [{"pci": "0000:18:00.0"}] }"#).validate().is_ok());
    }

    #[test]
    fn rejects_zero_counts() {
        assert!(pool(r#"{ "name": "p", "drivers": [{"name": "ice", "primary": 0}] }"#)
            .validate()
            .is_err());
        assert!(pool(r#"{ "name": "p", "drivers": [{"name": "ice"}], "udsTimeoutSecs": 0 }"#)
            .validate()
            .is_err());
    }
}
