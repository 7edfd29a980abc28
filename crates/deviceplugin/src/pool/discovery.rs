use std::collections::BTreeMap;
use std::io;

use super::device::Health;
use crate::config::DeviceSelector;
use crate::config::PoolConfig;
use crate::net::LinkState;
use crate::net::NetHandler;
use crate::net::NetInterface;

/// Interfaces of the host that belong to the pool, with their health, in name
/// order.
pub fn discover(config: &PoolConfig, net: &dyn NetHandler) -> io::Result<Vec<(String, Health)>> {
    let interfaces = net.interfaces()?;
    Ok(select(config, &interfaces))
}

/// Applies the pool's selection criteria to a list of interfaces.
pub fn select(config: &PoolConfig, interfaces: &[NetInterface]) -> Vec<(String, Health)> {
    let mut selected = BTreeMap::new();

    for selector in &config.devices {
        for interface in interfaces.iter().filter(|i| matches_selector(selector, i)) {
            selected.insert(interface.name.clone(), health(interface));
        }
    }

    for driver in &config.drivers {
        let mut candidates = interfaces
            .iter()
            .filter(|i| i.driver.as_deref() == Some(driver.name.as_str()))
            .filter(|i| !driver.exclude_devices.contains(&i.name))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let limit = driver.primary.unwrap_or(usize::MAX);
        for interface in candidates.into_iter().take(limit) {
            selected.insert(interface.name.clone(), health(interface));
        }
    }

    selected.into_iter().collect()
}

fn matches_selector(selector: &DeviceSelector, interface: &NetInterface) -> bool {
    if let Some(name) = &selector.name {
        return interface.name == *name;
    }
    if let Some(mac) = &selector.mac {
        return interface
            .mac
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(mac));
    }
    if let Some(pci) = &selector.pci {
        return interface.pci.as_deref() == Some(pci.as_str());
    }
    false
}

fn health(interface: &NetInterface) -> Health {
    match interface.link {
        LinkState::Down => Health::Unhealthy,
        LinkState::Up | LinkState::Unknown => Health::Healthy,
    }
}
